//! Process-wide execution state: the VU pool and the run counters.
//!
//! Created once per run and shared by the scheduler and every executor.
//! The idle pool has channel semantics: takes block until a VU is free,
//! returns never block, and ordering is FIFO so no VU is starved.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::options::Options;
use crate::runner::{Runner, RunnerError, VirtualUser};

/// A VU that has been through runner initialization, tagged with its
/// 1-based global id.
pub struct InitializedVu {
    pub id: u64,
    pub vu: Box<dyn VirtualUser>,
}

impl std::fmt::Debug for InitializedVu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializedVu").field("id", &self.id).finish()
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("VU initialization was interrupted")]
    InitInterrupted,
    #[error("failed to initialize VU #{id}")]
    InitFailed {
        id: u64,
        #[source]
        source: RunnerError,
    },
    #[error("interrupted while waiting for a free VU")]
    PoolInterrupted,
    #[error("the VU idle pool is closed")]
    PoolClosed,
}

/// Shared state of a single run.
pub struct ExecutionState {
    options: Options,
    runner: Arc<dyn Runner>,
    max_possible_vus: u64,

    idle_tx: mpsc::UnboundedSender<InitializedVu>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<InitializedVu>>,
    // The runner is not assumed re-entrant during VU creation.
    init_lock: Mutex<()>,

    vu_serial: AtomicU64,
    initialized: AtomicU64,
    active: AtomicI64,
    full_iterations: AtomicU64,
    interrupted_iterations: AtomicU64,
}

impl ExecutionState {
    pub fn new(options: Options, runner: Arc<dyn Runner>, max_possible_vus: u64) -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        ExecutionState {
            options,
            runner,
            max_possible_vus,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            init_lock: Mutex::new(()),
            vu_serial: AtomicU64::new(0),
            initialized: AtomicU64::new(0),
            active: AtomicI64::new(0),
            full_iterations: AtomicU64::new(0),
            interrupted_iterations: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn max_possible_vus(&self) -> u64 {
        self.max_possible_vus
    }

    /// Create a fresh VU with a unique 1-based global id.
    ///
    /// Creation calls are serialized; concurrent callers queue on the
    /// internal lock and each still receives a distinct id.
    pub async fn initialize_new_vu(
        &self,
        token: &CancellationToken,
    ) -> Result<InitializedVu, StateError> {
        let _guard = tokio::select! {
            guard = self.init_lock.lock() => guard,
            _ = token.cancelled() => return Err(StateError::InitInterrupted),
        };
        let id = self.vu_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let vu = tokio::select! {
            res = self.runner.new_vu(id) => {
                res.map_err(|source| StateError::InitFailed { id, source })?
            }
            _ = token.cancelled() => return Err(StateError::InitInterrupted),
        };
        Ok(InitializedVu { id, vu })
    }

    /// Put a freshly initialized VU into the idle pool.
    pub fn add_initialized_vu(&self, vu: InitializedVu) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        // Send can only fail after the state is torn down.
        let _ = self.idle_tx.send(vu);
    }

    /// Take a planned VU from the idle pool, blocking until one is free.
    ///
    /// The caller owns the VU until it pairs this with [`return_vu`] or
    /// [`abandon_vu`]. Returns an error if `token` fires first.
    ///
    /// [`return_vu`]: ExecutionState::return_vu
    /// [`abandon_vu`]: ExecutionState::abandon_vu
    pub async fn get_planned_vu(
        &self,
        token: &CancellationToken,
    ) -> Result<InitializedVu, StateError> {
        let mut rx = tokio::select! {
            rx = self.idle_rx.lock() => rx,
            _ = token.cancelled() => return Err(StateError::PoolInterrupted),
        };
        tokio::select! {
            taken = rx.recv() => match taken {
                Some(vu) => {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    Ok(vu)
                }
                None => Err(StateError::PoolClosed),
            },
            _ = token.cancelled() => Err(StateError::PoolInterrupted),
        }
    }

    /// Non-blocking pool take; used by open-loop executors that would
    /// rather drop an iteration than queue behind a busy VU. A pool
    /// whose receiver is held by a blocked taker counts as empty.
    pub fn try_get_planned_vu(&self) -> Option<InitializedVu> {
        let mut rx = self.idle_rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(vu) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Some(vu)
            }
            Err(_) => None,
        }
    }

    /// Return a VU to the idle pool, crediting its last iteration.
    pub fn return_vu(&self, vu: InitializedVu, was_full: bool) {
        if was_full {
            self.full_iterations.fetch_add(1, Ordering::SeqCst);
        } else {
            self.interrupted_iterations.fetch_add(1, Ordering::SeqCst);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self.idle_tx.send(vu);
    }

    /// Return a VU whose tenure simply ended; no iteration is credited
    /// because the executor counted each one as it completed.
    pub fn relinquish_vu(&self, vu: InitializedVu) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self.idle_tx.send(vu);
    }

    /// Release an active VU without returning it: its iteration overran
    /// the stop deadline and was abandoned.
    pub fn abandon_vu(&self) {
        self.interrupted_iterations.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Credit a completed iteration without cycling the VU through the
    /// pool; used by executors that keep their VUs across iterations.
    pub fn add_full_iterations(&self, n: u64) {
        self.full_iterations.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_interrupted_iterations(&self, n: u64) {
        self.interrupted_iterations.fetch_add(n, Ordering::SeqCst);
    }

    pub fn currently_active_vus(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn initialized_vus_count(&self) -> u64 {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn full_iterations_count(&self) -> u64 {
        self.full_iterations.load(Ordering::SeqCst)
    }

    pub fn interrupted_iterations_count(&self) -> u64 {
        self.interrupted_iterations.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("max_possible_vus", &self.max_possible_vus)
            .field("initialized", &self.initialized_vus_count())
            .field("active", &self.currently_active_vus())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{iteration, FnRunner};

    fn noop_state(max: u64) -> ExecutionState {
        let runner = Arc::new(FnRunner::new(|_id| iteration(async { Ok(()) })));
        ExecutionState::new(Options::default(), runner, max)
    }

    #[tokio::test]
    async fn vu_ids_are_unique_and_one_based() {
        let state = noop_state(5);
        let token = CancellationToken::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let vu = state.initialize_new_vu(&token).await.unwrap();
            ids.push(vu.id);
            state.add_initialized_vu(vu);
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(state.initialized_vus_count(), 5);
    }

    #[tokio::test]
    async fn pool_take_is_fifo() {
        let state = noop_state(3);
        let token = CancellationToken::new();
        for _ in 0..3 {
            let vu = state.initialize_new_vu(&token).await.unwrap();
            state.add_initialized_vu(vu);
        }
        let first = state.get_planned_vu(&token).await.unwrap();
        let second = state.get_planned_vu(&token).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(state.currently_active_vus(), 2);

        // Returned VUs rejoin at the back of the queue.
        state.return_vu(first, true);
        let third = state.get_planned_vu(&token).await.unwrap();
        let again = state.get_planned_vu(&token).await.unwrap();
        assert_eq!((third.id, again.id), (3, 1));
        assert_eq!(state.full_iterations_count(), 1);
    }

    #[tokio::test]
    async fn pool_take_observes_cancellation() {
        let state = noop_state(1);
        let token = CancellationToken::new();
        token.cancel();
        let err = state.get_planned_vu(&token).await.unwrap_err();
        assert!(matches!(err, StateError::PoolInterrupted));
    }

    #[tokio::test]
    async fn init_observes_cancellation() {
        let state = noop_state(1);
        let token = CancellationToken::new();
        token.cancel();
        let err = state.initialize_new_vu(&token).await.unwrap_err();
        assert!(matches!(err, StateError::InitInterrupted));
    }

    #[tokio::test]
    async fn failed_runner_surfaces_the_vu_id() {
        struct FailingRunner;
        #[async_trait::async_trait]
        impl Runner for FailingRunner {
            async fn new_vu(
                &self,
                _id: u64,
            ) -> Result<Box<dyn VirtualUser>, RunnerError> {
                Err(RunnerError("script threw during init".into()))
            }
        }

        let state = ExecutionState::new(Options::default(), Arc::new(FailingRunner), 1);
        let err = state
            .initialize_new_vu(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InitFailed { id: 1, .. }));
    }

    #[tokio::test]
    async fn abandoned_vus_count_as_interrupted() {
        let state = noop_state(1);
        let token = CancellationToken::new();
        let vu = state.initialize_new_vu(&token).await.unwrap();
        state.add_initialized_vu(vu);
        let _vu = state.get_planned_vu(&token).await.unwrap();
        assert_eq!(state.currently_active_vus(), 1);
        state.abandon_vu();
        assert_eq!(state.currently_active_vus(), 0);
        assert_eq!(state.interrupted_iterations_count(), 1);
        assert!(state.try_get_planned_vu().is_none());
    }
}
