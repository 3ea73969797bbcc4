//! A fixed number of VUs looping for a fixed duration.
//!
//! Each VU schedules its next iteration immediately after the previous
//! one returns; there is no pacing. On stop, in-flight iterations may
//! finish within the graceful window, after which they are abandoned and
//! counted interrupted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    hard_stop_after, BaseConfig, BaseExecutor, Executor, ExecutorError, ExecutionStep,
    IterationOutcome, RunContext,
};
use crate::options::{Setting, TimeSpan};
use crate::progress::{format_fixed_duration, ExecutorPhase, Progress};
use crate::segment::ExecutionSegment;
use crate::state::InitializedVu;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConstantVusConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub vus: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub duration: Setting<TimeSpan>,
}

impl ConstantVusConfig {
    pub fn vus(&self) -> i64 {
        self.vus.unwrap_or(1)
    }

    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or(TimeSpan::ZERO).duration()
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if self.vus() <= 0 {
            errors.push(format!(
                "executor `{}`: the number of VUs must be positive",
                self.base.name
            ));
        }
        match self.duration.value() {
            None => errors.push(format!(
                "executor `{}`: the duration is required",
                self.base.name
            )),
            Some(d) if d.is_zero() => errors.push(format!(
                "executor `{}`: the duration must be positive",
                self.base.name
            )),
            Some(_) => {}
        }
    }

    pub(crate) fn execution_requirements(&self, segment: &ExecutionSegment) -> Vec<ExecutionStep> {
        vec![
            ExecutionStep {
                offset: Duration::ZERO,
                planned_vus: segment.scale(self.vus().max(0) as u64),
            },
            ExecutionStep {
                offset: self.duration(),
                planned_vus: 0,
            },
        ]
    }
}

pub struct ConstantVus {
    base: Arc<BaseExecutor>,
    config: ConstantVusConfig,
}

impl ConstantVus {
    pub(crate) fn new(config: ConstantVusConfig, state: Arc<crate::state::ExecutionState>) -> Self {
        ConstantVus {
            base: Arc::new(BaseExecutor::new(config.base.name.clone(), state)),
            config,
        }
    }
}

#[async_trait]
impl Executor for ConstantVus {
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
        let duration = self.config.duration();
        let started = Instant::now();

        let progress = self.base.progress();
        progress.set_progress_fn(move || {
            let spent = started.elapsed().min(duration);
            let fraction = spent.as_secs_f64() / duration.as_secs_f64();
            let right = format!(
                "{}/{} {vus} VUs",
                format_fixed_duration(spent, duration),
                TimeSpan::new(duration)
            );
            (fraction, right)
        });
        progress.advance_phase(ExecutorPhase::Running);
        debug!(executor = %self.base.name(), vus, ?duration, "starting constant VUs");

        // Soft stop fires at the schedule end or on outside cancellation;
        // the hard token abandons whatever outlives the graceful window.
        let stop = ctx.stop.child_token();
        let hard = hard_stop_after(&stop, self.config.base.graceful_stop());
        super::mark_stopping_on(&progress, &stop);
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            });
        }

        let mut workers = Vec::with_capacity(vus as usize);
        for _ in 0..vus {
            let vu = match ctx.state.get_planned_vu(&stop).await {
                Ok(vu) => vu,
                // Stopped before every VU could even start.
                Err(_) if stop.is_cancelled() => break,
                Err(err) => return Err(err.into()),
            };
            let local_id = self.base.next_local_vu_id();
            debug!(executor = %self.base.name(), vu = vu.id, local_id, "activating VU");
            let base = Arc::clone(&self.base);
            let ctx = ctx.clone();
            let stop = stop.clone();
            let hard = hard.clone();
            workers.push(tokio::spawn(async move {
                looping_worker(base, ctx, stop, hard, vu).await
            }));
        }

        let results = futures::future::join_all(workers).await;
        progress.advance_phase(ExecutorPhase::Done);
        for joined in results {
            match joined {
                Ok(res) => res?,
                Err(join_err) => {
                    tracing::error!(executor = %self.base.name(), error = %join_err, "VU worker panicked");
                }
            }
        }
        Ok(())
    }
}

/// The common loop of VU-holding executors: iterate until `stop`, honor
/// the hard deadline, and hand the VU back when the tenure ends.
pub(crate) async fn looping_worker(
    base: Arc<BaseExecutor>,
    ctx: RunContext,
    stop: CancellationToken,
    hard: CancellationToken,
    mut vu: InitializedVu,
) -> Result<(), ExecutorError> {
    loop {
        if stop.is_cancelled() {
            ctx.state.relinquish_vu(vu);
            return Ok(());
        }
        match base.run_guarded_iteration(&mut vu, &ctx.out, &hard).await? {
            IterationOutcome::Full(_) => {
                ctx.state.add_full_iterations(1);
            }
            IterationOutcome::Abandoned => {
                // The VU's iteration context is torn; drop it instead of
                // returning it to the pool.
                ctx.state.abandon_vu();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testutil::{sink, state_with_vus};
    use crate::runner::iteration;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn config(vus: i64, duration: TimeSpan) -> ConstantVusConfig {
        ConstantVusConfig {
            base: BaseConfig {
                graceful_stop: Setting::Value(TimeSpan::ZERO),
                ..BaseConfig::named("default")
            },
            vus: Setting::Value(vus),
            duration: Setting::Value(duration),
        }
    }

    #[test]
    fn validation_requires_positive_vus_and_duration() {
        let mut errors = Vec::new();
        config(0, TimeSpan::from_secs(1)).validate_into(&mut errors);
        config(1, TimeSpan::ZERO).validate_into(&mut errors);
        assert_eq!(errors.len(), 2);

        let mut ok = Vec::new();
        config(5, TimeSpan::from_secs(2)).validate_into(&mut ok);
        assert!(ok.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn five_vus_for_two_seconds_of_hundred_ms_iterations() {
        let iters = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&iters);
        let state = state_with_vus(
            move |_id| {
                let c = Arc::clone(&c);
                iteration(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            },
            5,
        )
        .await;

        let mut executor = ConstantVus::new(config(5, TimeSpan::from_secs(2)), Arc::clone(&state));
        let ctx = RunContext {
            stop: CancellationToken::new(),
            state: Arc::clone(&state),
            out: sink(),
        };
        executor.run(ctx).await.unwrap();

        // 5 VUs x 20 iterations each fit exactly; the iteration in flight
        // at the deadline is interrupted (graceful stop is zero here).
        let full = state.full_iterations_count();
        assert!(full >= 95, "expected ~100 full iterations, got {full}");
        assert!(state.interrupted_iterations_count() <= 5);
        assert_eq!(state.currently_active_vus(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_lets_iterations_finish() {
        let state = state_with_vus(
            |_id| {
                iteration(async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
            },
            2,
        )
        .await;

        let mut cfg = config(2, TimeSpan::from_secs(1));
        cfg.base.graceful_stop = Setting::Value(TimeSpan::from_secs(5));
        let mut executor = ConstantVus::new(cfg, Arc::clone(&state));
        let ctx = RunContext {
            stop: CancellationToken::new(),
            state: Arc::clone(&state),
            out: sink(),
        };
        executor.run(ctx).await.unwrap();

        // 1s / 300ms = 3 full each before the stop; the 4th in-flight
        // iteration completes inside the 5s graceful window.
        assert_eq!(state.full_iterations_count(), 8);
        assert_eq!(state.interrupted_iterations_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outside_cancellation_stops_the_loop() {
        // Iterations must hit a timer or the paused clock cannot advance.
        let state = state_with_vus(
            |_id| {
                iteration(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                })
            },
            2,
        )
        .await;
        let mut executor = ConstantVus::new(config(2, TimeSpan::from_secs(60)), Arc::clone(&state));
        let stop = CancellationToken::new();
        let ctx = RunContext {
            stop: stop.clone(),
            state: Arc::clone(&state),
            out: sink(),
        };
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        executor.run(ctx).await.unwrap();
        assert_eq!(state.currently_active_vus(), 0);
    }
}
