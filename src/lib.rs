//! Stampede — the execution core of a scriptable load-testing tool.
//!
//! Stampede drives cohorts of virtual users (VUs) through iterations of a
//! user-supplied function according to declarative workload shapes, and
//! emits time-series metric samples into a channel for whatever sink the
//! embedder wires up. The script runtime itself is external: anything
//! implementing [`Runner`] can mint VUs.
//!
//! # Architecture
//!
//! - [`config`]: layered option consolidation (defaults → file → env →
//!   CLI → script), shortcut-to-executor rewriting, joined validation.
//! - [`executor`]: the five workload shapes — constant VUs, ramping VUs,
//!   shared iterations, per-VU iterations, constant arrival rate — behind
//!   one dispatch trait.
//! - [`scheduler`]: the run-level orchestrator that sizes and fills the
//!   VU pool, starts every executor at its offset, publishes progress,
//!   and shuts down in two phases.
//! - [`state`]: the shared VU pool and run counters.
//! - [`resolver`]: the TTL/CNAME-aware caching DNS resolver feeding the
//!   connection dialer.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//! use stampede::config::{consolidate, derive_and_validate, ConfigSource, EnvSource, FileSource};
//! use stampede::runner::{iteration, FnRunner};
//! use stampede::scheduler::ExecutionScheduler;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let file = FileSource::default();
//! let env = EnvSource::from_os();
//! let sources: Vec<&dyn ConfigSource> = vec![&file, &env];
//! let config = derive_and_validate(consolidate(&sources)?)?;
//!
//! let runner = Arc::new(FnRunner::new(|_vu| {
//!     iteration(async {
//!         // one iteration of the user's function
//!         Ok(())
//!     })
//! }));
//!
//! let (samples_tx, mut samples_rx) = mpsc::channel(4096);
//! tokio::spawn(async move { while samples_rx.recv().await.is_some() {} });
//!
//! let mut scheduler = ExecutionScheduler::new(&config, runner)?;
//! scheduler.run(CancellationToken::new(), samples_tx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod exit;
pub mod options;
pub mod progress;
pub mod resolver;
pub mod runner;
pub mod sample;
pub mod scheduler;
pub mod segment;
pub mod state;

pub use config::{consolidate, derive_and_validate, Config, ConfigError};
pub use executor::{ExecutionMap, Executor, ExecutorConfig};
pub use options::{Options, Setting, Stage, TimeSpan};
pub use progress::{ExecutorPhase, Progress, ProgressSnapshot};
pub use resolver::{BaseResolver, CachingResolver, IpFamilies};
pub use runner::{FnRunner, Runner, VirtualUser};
pub use sample::{Sample, SampleContainer};
pub use scheduler::{ExecutionScheduler, RunError, SchedulerOptions};
pub use segment::ExecutionSegment;
pub use state::ExecutionState;
