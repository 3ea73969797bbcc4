//! N VUs collectively working through a shared iteration budget.
//!
//! Workers claim iteration numbers with an atomic compare-and-swap; the
//! claim is never held across the runner call, so a slow iteration cannot
//! starve the other VUs. Once the counter reaches the budget no further
//! iterations are dispatched. The whole executor is bounded by
//! `maxDuration`; on expiry, outstanding iterations are interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
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
pub struct SharedIterationsConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub vus: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub iterations: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub max_duration: Setting<TimeSpan>,
}

impl SharedIterationsConfig {
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
        if self.iterations() < self.vus() {
            errors.push(format!(
                "executor `{}`: the iteration count cannot be below the VU count",
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

/// CAS-claims the next iteration number below `total`.
fn claim_iteration(counter: &AtomicU64, total: u64) -> Option<u64> {
    let mut current = counter.load(Ordering::SeqCst);
    loop {
        if current >= total {
            return None;
        }
        match counter.compare_exchange_weak(
            current,
            current + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return Some(current),
            Err(seen) => current = seen,
        }
    }
}

pub struct SharedIterations {
    base: Arc<BaseExecutor>,
    config: SharedIterationsConfig,
}

impl SharedIterations {
    pub(crate) fn new(config: SharedIterationsConfig, state: Arc<ExecutionState>) -> Self {
        SharedIterations {
            base: Arc::new(BaseExecutor::new(config.base.name.clone(), state)),
            config,
        }
    }
}

#[async_trait]
impl Executor for SharedIterations {
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
        let total = segment.scale(self.config.iterations().max(0) as u64);
        let max_duration = self.config.max_duration();
        let claimed = Arc::new(AtomicU64::new(0));

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
        debug!(executor = %self.base.name(), vus, total, "starting shared iterations");

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
            let claimed = Arc::clone(&claimed);
            workers.push(tokio::spawn(async move {
                loop {
                    if stop.is_cancelled() || claim_iteration(&claimed, total).is_none() {
                        ctx.state.relinquish_vu(vu);
                        return Ok(());
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
