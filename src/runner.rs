//! The boundary to the script runtime.
//!
//! The execution core never interprets user scripts itself. A [`Runner`]
//! mints per-VU iteration contexts ([`VirtualUser`]s) and the executors
//! drive them. [`FnRunner`] wraps a plain async closure so library users
//! and tests can run without a full script runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sample::SampleContainer;

/// Failure to mint a new VU.
#[derive(Debug, Error)]
#[error("runner failed to create VU: {0}")]
pub struct RunnerError(pub String);

/// A failed iteration. Recorded against the iteration's samples, never
/// fatal to the run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IterationError(pub String);

/// Produces fresh per-VU iteration contexts.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Create the iteration context for the VU with the given global id.
    ///
    /// Calls are serialized by the execution state; implementations need
    /// not be re-entrant during initialization.
    async fn new_vu(&self, id: u64) -> Result<Box<dyn VirtualUser>, RunnerError>;
}

/// One virtual user: a worker able to run iterations of the user function.
#[async_trait]
pub trait VirtualUser: Send + 'static {
    /// Run a single iteration. Any samples the user function produces go
    /// straight to `out`; the driving executor adds its own bookkeeping
    /// samples afterwards.
    async fn run_once(
        &mut self,
        out: &mpsc::Sender<SampleContainer>,
    ) -> Result<(), IterationError>;
}

type IterationFuture = Pin<Box<dyn Future<Output = Result<(), IterationError>> + Send>>;

/// A [`Runner`] backed by an async closure; every VU shares the closure.
pub struct FnRunner<F> {
    f: Arc<F>,
}

impl<F> FnRunner<F>
where
    F: Fn(u64) -> IterationFuture + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        FnRunner { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> Runner for FnRunner<F>
where
    F: Fn(u64) -> IterationFuture + Send + Sync + 'static,
{
    async fn new_vu(&self, id: u64) -> Result<Box<dyn VirtualUser>, RunnerError> {
        Ok(Box::new(FnVu {
            id,
            f: Arc::clone(&self.f),
        }))
    }
}

struct FnVu<F> {
    id: u64,
    f: Arc<F>,
}

#[async_trait]
impl<F> VirtualUser for FnVu<F>
where
    F: Fn(u64) -> IterationFuture + Send + Sync + 'static,
{
    async fn run_once(
        &mut self,
        _out: &mpsc::Sender<SampleContainer>,
    ) -> Result<(), IterationError> {
        (self.f)(self.id).await
    }
}

/// Boxes an iteration future; saves callers from spelling out the pin.
pub fn iteration<Fut>(fut: Fut) -> IterationFuture
where
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    Box::pin(fut)
}
