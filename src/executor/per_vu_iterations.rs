//! Every VU running its own fixed number of iterations.
//!
//! The simplest shape, and the one synthesized when a run configures no
//! shape at all (1 VU, 1 iteration). Bounded by `maxDuration` like the
//! shared-iterations executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    hard_stop_after, BaseConfig, BaseExecutor, Executor, ExecutorError, ExecutionStep,
    IterationOutcome, RunContext, DEFAULT_MAX_DURATION,
};
use crate::options::{Setting, TimeSpan};
use crate::progress::{ExecutorPhase, Progress};
use crate::segment::ExecutionSegment;
use crate::state::ExecutionState;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerVuIterationsConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub vus: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub iterations: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub max_duration: Setting<TimeSpan>,
}

impl PerVuIterationsConfig {
    pub fn vus(&self) -> i64 {
        self.vus.unwrap_or(1)
    }

    pub fn iterations(&self) -> i64 {
        self.iterations.unwrap_or(1)
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration.unwrap_or(DEFAULT_MAX_DURATION).duration()
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if self.vus() <= 0 {
            errors.push(format!(
                "executor `{}`: the number of VUs must be positive",
                self.base.name
            ));
        }
        if self.iterations() <= 0 {
            errors.push(format!(
                "executor `{}`: the number of iterations must be positive",
                self.base.name
            ));
        }
        if self.max_duration().is_zero() {
            errors.push(format!(
                "executor `{}`: maxDuration must be positive",
                self.base.name
            ));
        }
    }

    pub(crate) fn execution_requirements(&self, segment: &ExecutionSegment) -> Vec<ExecutionStep> {
        vec![
            ExecutionStep {
                offset: Duration::ZERO,
                planned_vus: segment.scale(self.vus().max(0) as u64),
            },
            ExecutionStep {
                offset: self.max_duration(),
                planned_vus: 0,
            },
        ]
    }
}

pub struct PerVuIterations {
    base: Arc<BaseExecutor>,
    config: PerVuIterationsConfig,
}

impl PerVuIterations {
    pub(crate) fn new(config: PerVuIterationsConfig, state: Arc<ExecutionState>) -> Self {
        PerVuIterations {
            base: Arc::new(BaseExecutor::new(config.base.name.clone(), state)),
            config,
        }
    }
}

#[async_trait]
impl Executor for PerVuIterations {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn progress(&self) -> Arc<Progress> {
        self.base.progress()
    }

    async fn run(&mut self, ctx: RunContext) -> Result<(), ExecutorError> {
        let segment = self
            .config
            .base
            .segment_or(&ctx.state.options().segment());
        let vus = segment.scale(self.config.vus().max(0) as u64);
        let per_vu = self.config.iterations().max(0) as u64;
        let total = vus * per_vu;
        let max_duration = self.config.max_duration();

        let progress = self.base.progress();
        {
            let base = Arc::clone(&self.base);
            progress.set_progress_fn(move || {
                let done = base.local_iters().min(total);
                let fraction = if total == 0 {
                    1.0
                } else {
                    done as f64 / total as f64
                };
                (fraction, format!("{done}/{total} iters, {vus} VUs"))
            });
        }
        progress.advance_phase(ExecutorPhase::Running);
        debug!(executor = %self.base.name(), vus, per_vu, "starting per-VU iterations");

        let stop = ctx.stop.child_token();
        let hard = hard_stop_after(&stop, self.config.base.graceful_stop());
        super::mark_stopping_on(&progress, &stop);
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(max_duration) => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            });
        }

        let mut workers: Vec<tokio::task::JoinHandle<Result<(), ExecutorError>>> =
            Vec::with_capacity(vus as usize);
        for _ in 0..vus {
            let mut vu = match ctx.state.get_planned_vu(&stop).await {
                Ok(vu) => vu,
                Err(_) if stop.is_cancelled() => break,
                Err(err) => return Err(err.into()),
            };
            self.base.next_local_vu_id();
            let base = Arc::clone(&self.base);
            let ctx = ctx.clone();
            let stop = stop.clone();
            let hard = hard.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..per_vu {
                    if stop.is_cancelled() {
                        break;
                    }
                    match base.run_guarded_iteration(&mut vu, &ctx.out, &hard).await? {
                        IterationOutcome::Full(_) => {
                            ctx.state.add_full_iterations(1);
                        }
                        IterationOutcome::Abandoned => {
                            ctx.state.abandon_vu();
                            return Ok(());
                        }
                    }
                }
                ctx.state.relinquish_vu(vu);
                Ok(())
            }));
        }

        for joined in futures::future::join_all(workers).await {
            match joined {
                Ok(res) => res?,
                Err(join_err) => {
                    tracing::error!(executor = %self.base.name(), error = %join_err, "VU worker panicked");
                }
            }
        }
        stop.cancel();
        progress.advance_phase(ExecutorPhase::Done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testutil::{sink, state_with_vus};
    use crate::runner::iteration;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use parking_lot::Mutex;

    fn config(vus: i64, iterations: i64) -> PerVuIterationsConfig {
        PerVuIterationsConfig {
            base: BaseConfig {
                graceful_stop: Setting::Value(TimeSpan::ZERO),
                ..BaseConfig::named("default")
            },
            vus: Setting::Value(vus),
            iterations: Setting::Value(iterations),
            max_duration: Setting::Value(TimeSpan::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn each_vu_runs_exactly_its_budget() {
        let per_vu: Arc<Mutex<BTreeMap<u64, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let tally = Arc::clone(&per_vu);
        let state = state_with_vus(
            move |id| {
                let tally = Arc::clone(&tally);
                iteration(async move {
                    *tally.lock().entry(id).or_insert(0) += 1;
                    Ok(())
                })
            },
            4,
        )
        .await;

        let mut executor = PerVuIterations::new(config(4, 25), Arc::clone(&state));
        let ctx = RunContext {
            stop: CancellationToken::new(),
            state: Arc::clone(&state),
            out: sink(),
        };
        executor.run(ctx).await.unwrap();

        assert_eq!(state.full_iterations_count(), 100);
        let tallies = per_vu.lock();
        assert_eq!(tallies.len(), 4);
        assert!(tallies.values().all(|&n| n == 25));
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_cuts_the_run_short() {
        let done = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&done);
        let state = state_with_vus(
            move |_id| {
                let c = Arc::clone(&c);
                iteration(async move {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            },
            2,
        )
        .await;

        let mut cfg = config(2, 1000);
        cfg.max_duration = Setting::Value(TimeSpan::from_secs(1));
        let mut executor = PerVuIterations::new(cfg, Arc::clone(&state));
        let ctx = RunContext {
            stop: CancellationToken::new(),
            state: Arc::clone(&state),
            out: sink(),
        };
        executor.run(ctx).await.unwrap();

        // Two full 400ms iterations fit per VU; the third is interrupted.
        assert_eq!(state.full_iterations_count(), 4);
        assert_eq!(state.interrupted_iterations_count(), 2);
        assert_eq!(done.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn default_config_is_one_vu_one_iteration() {
        let config = PerVuIterationsConfig {
            base: BaseConfig::named("default"),
            ..Default::default()
        };
        assert_eq!(config.vus(), 1);
        assert_eq!(config.iterations(), 1);
        let mut errors = Vec::new();
        config.validate_into(&mut errors);
        assert!(errors.is_empty());
    }
}
