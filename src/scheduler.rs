//! The run-level orchestrator composing all executors.
//!
//! The scheduler owns the whole run: it plans VU requirements, fills the
//! pool, launches every executor at its start offset, publishes progress,
//! and tears everything down with a two-phase (signal, then deadline)
//! shutdown. Cancellation is not an error; executors drain and return.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::config::Config;
use crate::executor::{
    max_planned_vus, planned_duration, Executor, ExecutorError, RunContext,
};
use crate::progress::{ExecutorPhase, Progress, ProgressSnapshot};
use crate::runner::Runner;
use crate::sample::SampleContainer;
use crate::state::{ExecutionState, StateError};

/// Slack added to the hard kill deadline after the graceful window.
const STOP_EPSILON: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("the configuration defines no executors; derive it before scheduling")]
    NoExecutors,
    #[error("failed to initialize the VU pool")]
    Init(#[source] StateError),
    #[error("executor `{name}` failed")]
    Executor {
        name: String,
        #[source]
        source: ExecutorError,
    },
}

/// Scheduler knobs that embedders may want to tune.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SchedulerOptions {
    /// How often executor progress snapshots are published.
    #[builder(default = Duration::from_millis(500))]
    pub progress_interval: Duration,
    /// Cap on concurrent VU initializations; defaults to
    /// `min(available cores, maxPossibleVUs)`.
    #[builder(default)]
    pub init_concurrency: Option<usize>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions::builder().build()
    }
}

struct ScheduledExecutor {
    name: String,
    start_time: Duration,
    executor: Box<dyn Executor>,
    progress: Arc<Progress>,
}

/// Owns and drives one full run.
pub struct ExecutionScheduler {
    state: Arc<ExecutionState>,
    entries: Vec<ScheduledExecutor>,
    options: SchedulerOptions,
    max_possible_vus: u64,
    end_offset: Duration,
    max_graceful_stop: Duration,
}

impl ExecutionScheduler {
    pub fn new(config: &Config, runner: Arc<dyn Runner>) -> Result<Self, RunError> {
        Self::with_options(config, runner, SchedulerOptions::default())
    }

    pub fn with_options(
        config: &Config,
        runner: Arc<dyn Runner>,
        options: SchedulerOptions,
    ) -> Result<Self, RunError> {
        let execution = match config.options.execution.value() {
            Some(map) if !map.is_empty() => map,
            _ => return Err(RunError::NoExecutors),
        };
        let segment = config.options.segment();

        // Plan: the shared pool is sized for the hungriest executor, and
        // the run ends when the latest schedule does.
        let mut max_possible_vus = 0u64;
        let mut end_offset = Duration::ZERO;
        let mut max_graceful_stop = Duration::ZERO;
        for exec_config in execution.configs() {
            let steps = exec_config.execution_requirements(&segment);
            max_possible_vus = max_possible_vus.max(max_planned_vus(&steps));
            let base = exec_config.base();
            end_offset = end_offset.max(base.start_time() + planned_duration(&steps));
            max_graceful_stop = max_graceful_stop.max(base.graceful_stop());
        }

        let state = Arc::new(ExecutionState::new(
            config.options.clone(),
            runner,
            max_possible_vus,
        ));

        let mut entries: Vec<ScheduledExecutor> = execution
            .configs()
            .map(|exec_config| {
                let executor = exec_config.build(Arc::clone(&state));
                let progress = executor.progress();
                ScheduledExecutor {
                    name: exec_config.name().to_string(),
                    start_time: exec_config.base().start_time(),
                    executor,
                    progress,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.name.cmp(&b.name)));

        Ok(ExecutionScheduler {
            state,
            entries,
            options,
            max_possible_vus,
            end_offset,
            max_graceful_stop,
        })
    }

    pub fn state(&self) -> Arc<ExecutionState> {
        Arc::clone(&self.state)
    }

    pub fn max_possible_vus(&self) -> u64 {
        self.max_possible_vus
    }

    /// Offset from run start at which the last executor's schedule ends.
    pub fn planned_duration(&self) -> Duration {
        self.end_offset
    }

    /// Progress observers for every executor, in start order.
    pub fn progress_observers(
        &self,
    ) -> Vec<(String, tokio::sync::watch::Receiver<ProgressSnapshot>)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.progress.observer()))
            .collect()
    }

    /// Run everything to completion.
    ///
    /// Samples go to `out`; the scheduler drops all of its senders before
    /// returning, so once the caller releases theirs the channel closes
    /// only after every executor has returned.
    pub async fn run(
        &mut self,
        token: CancellationToken,
        out: mpsc::Sender<SampleContainer>,
    ) -> Result<(), RunError> {
        self.initialize_vus(&token).await?;
        for entry in &mut self.entries {
            entry
                .executor
                .init(&token)
                .await
                .map_err(|source| RunError::Executor {
                    name: entry.name.clone(),
                    source,
                })?;
        }

        let progress_handles: Vec<Arc<Progress>> =
            self.entries.iter().map(|e| Arc::clone(&e.progress)).collect();
        let ticker = {
            let interval = self.options.progress_interval;
            let handles = progress_handles.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    for progress in &handles {
                        progress.tick();
                    }
                }
            })
        };

        let started = Instant::now();
        let soft = CancellationToken::new();
        {
            // Outside cancellation becomes the soft stop signal.
            let token = token.clone();
            let soft = soft.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                soft.cancel();
            });
        }

        info!(
            executors = self.entries.len(),
            max_vus = self.max_possible_vus,
            planned = ?self.end_offset,
            "starting run"
        );

        let mut tasks: JoinSet<(String, Result<(), ExecutorError>)> = JoinSet::new();
        for entry in self.entries.drain(..) {
            let ScheduledExecutor {
                name,
                start_time,
                mut executor,
                progress,
            } = entry;
            let soft = soft.clone();
            let state = Arc::clone(&self.state);
            let out = out.clone();
            tasks.spawn(async move {
                progress.advance_phase(ExecutorPhase::Waiting);
                tokio::select! {
                    _ = tokio::time::sleep(start_time) => {}
                    _ = soft.cancelled() => {
                        progress.advance_phase(ExecutorPhase::Done);
                        return (name, Ok(()));
                    }
                }
                debug!(executor = %name, "starting executor");
                let result = executor
                    .run(RunContext {
                        stop: soft.child_token(),
                        state,
                        out,
                    })
                    .await;
                progress.advance_phase(match result {
                    Ok(_) => ExecutorPhase::Done,
                    Err(_) => ExecutorPhase::Failed,
                });
                (name, result)
            });
        }
        drop(out);

        // Two-phase shutdown: the soft signal (outside cancellation or the
        // natural end of the last schedule), then a hard kill once every
        // graceful window plus some slack has passed.
        let watchdog = {
            let soft = soft.clone();
            let natural_end = started + self.end_offset;
            let grace = self.max_graceful_stop + STOP_EPSILON;
            async move {
                tokio::select! {
                    _ = soft.cancelled() => {}
                    _ = tokio::time::sleep_until(natural_end) => {}
                }
                tokio::time::sleep(grace).await;
            }
        };
        tokio::pin!(watchdog);

        let mut first_error: Option<RunError> = None;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => {
                        debug!(executor = %name, "executor finished");
                    }
                    Some(Ok((name, Err(source)))) => {
                        tracing::error!(executor = %name, error = %source, "executor failed");
                        // One failing executor takes the run down.
                        soft.cancel();
                        first_error.get_or_insert(RunError::Executor { name, source });
                    }
                    Some(Err(join_err)) => {
                        tracing::error!(error = %join_err, "executor task panicked");
                        soft.cancel();
                    }
                },
                _ = &mut watchdog => {
                    tracing::warn!("graceful-stop deadline passed, aborting executors");
                    soft.cancel();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        ticker.abort();
        for progress in &progress_handles {
            progress.tick();
        }
        info!(
            full = self.state.full_iterations_count(),
            interrupted = self.state.interrupted_iterations_count(),
            "run finished"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create all planned VUs up front, in parallel but bounded.
    async fn initialize_vus(&self, token: &CancellationToken) -> Result<(), RunError> {
        for entry in &self.entries {
            entry.progress.advance_phase(ExecutorPhase::Initializing);
        }
        let limit = self.options.init_concurrency.unwrap_or_else(|| {
            num_cpus::get().min(self.max_possible_vus.max(1) as usize)
        });
        info!(
            vus = self.max_possible_vus,
            concurrency = limit,
            "initializing VUs"
        );

        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let mut join: JoinSet<Result<(), StateError>> = JoinSet::new();
        for _ in 0..self.max_possible_vus {
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&self.state);
            let token = token.clone();
            join.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Err(StateError::InitInterrupted);
                };
                let vu = state.initialize_new_vu(&token).await?;
                state.add_initialized_vu(vu);
                Ok(())
            });
        }
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    join.abort_all();
                    return Err(RunError::Init(err));
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "VU initialization task panicked");
                    join.abort_all();
                    return Err(RunError::Init(StateError::InitInterrupted));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{consolidate, derive_and_validate, ConfigSource};
    use crate::executor::{
        BaseConfig, ConstantVusConfig, ExecutionMap, ExecutorConfig,
    };
    use crate::options::{Options, Setting, TimeSpan};
    use crate::runner::{iteration, FnRunner, RunnerError, VirtualUser};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn drain(mut rx: mpsc::Receiver<SampleContainer>) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        })
    }

    fn counting_runner() -> (Arc<dyn Runner>, Arc<AtomicU64>) {
        // A 10ms pause keeps looping executors from starving the paused
        // clock; the iteration must hit a timer to let time advance.
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let runner = Arc::new(FnRunner::new(move |_id| {
            let c = Arc::clone(&c);
            iteration(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }));
        (runner, count)
    }

    fn two_executor_config() -> Config {
        let mut execution = ExecutionMap::default();
        execution.insert(
            "first",
            ExecutorConfig::PerVuIterations(crate::executor::PerVuIterationsConfig {
                base: BaseConfig {
                    graceful_stop: Setting::Value(TimeSpan::ZERO),
                    ..Default::default()
                },
                vus: Setting::Value(2),
                iterations: Setting::Value(10),
                max_duration: Setting::Value(TimeSpan::from_secs(1)),
            }),
        );
        execution.insert(
            "second",
            ExecutorConfig::ConstantVus(ConstantVusConfig {
                base: BaseConfig {
                    start_time: Setting::Value(TimeSpan::from_millis(500)),
                    graceful_stop: Setting::Value(TimeSpan::ZERO),
                    ..Default::default()
                },
                vus: Setting::Value(4),
                duration: Setting::Value(TimeSpan::from_secs(1)),
            }),
        );
        Config {
            options: Options {
                execution: Setting::Value(execution),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_executors_at_their_start_offsets() {
        let (runner, iters) = counting_runner();
        let config = two_executor_config();
        let mut scheduler = ExecutionScheduler::new(&config, runner).unwrap();

        // Pool is sized for the hungriest executor, not the sum.
        assert_eq!(scheduler.max_possible_vus(), 4);
        assert_eq!(scheduler.planned_duration(), Duration::from_millis(1500));

        let (tx, rx) = mpsc::channel(1024);
        let drained = drain(rx);
        scheduler
            .run(CancellationToken::new(), tx)
            .await
            .unwrap();

        let state = scheduler.state();
        assert_eq!(state.initialized_vus_count(), 4);
        assert_eq!(state.currently_active_vus(), 0);
        // The per-VU executor contributes exactly 20 iterations; the
        // constant one at least a few thousand no-op loops.
        assert!(iters.load(Ordering::Relaxed) >= 20);
        assert!(state.full_iterations_count() >= 20);
        assert!(drained.await.unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_a_clean_stop() {
        let (runner, _) = counting_runner();
        let mut execution = ExecutionMap::default();
        execution.insert(
            "forever",
            ExecutorConfig::ConstantVus(ConstantVusConfig {
                base: BaseConfig {
                    graceful_stop: Setting::Value(TimeSpan::ZERO),
                    ..Default::default()
                },
                vus: Setting::Value(2),
                duration: Setting::Value(TimeSpan::from_secs(3600)),
            }),
        );
        let config = Config {
            options: Options {
                execution: Setting::Value(execution),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut scheduler = ExecutionScheduler::new(&config, runner).unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let (tx, rx) = mpsc::channel(1024);
        let drained = drain(rx);
        scheduler.run(token, tx).await.unwrap();
        drained.await.unwrap();
        assert_eq!(scheduler.state().currently_active_vus(), 0);
    }

    #[tokio::test]
    async fn init_failure_is_fatal() {
        struct Exploding;
        #[async_trait::async_trait]
        impl Runner for Exploding {
            async fn new_vu(&self, _id: u64) -> Result<Box<dyn VirtualUser>, RunnerError> {
                Err(RunnerError("no database".into()))
            }
        }
        let config = two_executor_config();
        let mut scheduler = ExecutionScheduler::new(&config, Arc::new(Exploding)).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let err = scheduler.run(CancellationToken::new(), tx).await.unwrap_err();
        assert!(matches!(err, RunError::Init(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_observers_see_completion() {
        let (runner, _) = counting_runner();
        let config = two_executor_config();
        let mut scheduler = ExecutionScheduler::new(&config, runner).unwrap();
        let observers = scheduler.progress_observers();
        assert_eq!(observers.len(), 2);
        assert_eq!(observers[0].0, "first");

        let (tx, rx) = mpsc::channel(1024);
        let drained = drain(rx);
        scheduler.run(CancellationToken::new(), tx).await.unwrap();
        drained.await.unwrap();

        for (name, rx) in observers {
            let snap = rx.borrow().clone();
            assert_eq!(snap.phase, ExecutorPhase::Done, "executor {name}");
            assert!((snap.fraction - 1.0).abs() < 1e-9, "executor {name}");
        }
    }

    #[tokio::test]
    async fn consolidated_shortcut_config_runs_end_to_end() {
        // The S3 scenario through the whole pipeline: shortcut options in,
        // exactly 100 iterations out.
        let script = Config {
            options: Options {
                vus: Setting::Value(10),
                iterations: Setting::Value(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let sources: Vec<&dyn ConfigSource> = vec![&script];
        let config = consolidate(&sources).unwrap();
        let config = derive_and_validate(config).unwrap();

        let (runner, iters) = counting_runner();
        let mut scheduler = ExecutionScheduler::new(&config, runner).unwrap();
        assert_eq!(scheduler.max_possible_vus(), 10);

        let (tx, rx) = mpsc::channel(1024);
        let drained = drain(rx);
        scheduler.run(CancellationToken::new(), tx).await.unwrap();
        drained.await.unwrap();

        assert_eq!(iters.load(Ordering::Relaxed), 100);
        assert_eq!(scheduler.state().full_iterations_count(), 100);
    }
}
