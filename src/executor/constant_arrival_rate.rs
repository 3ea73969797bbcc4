//! Open-loop iteration dispatch at a constant rate.
//!
//! Iterations start at `rate` per `timeUnit` no matter how long each one
//! takes. Every dispatch pulls a VU from the idle pool; when none is free
//! the iteration is *dropped* (a `dropped_iterations` sample is emitted)
//! rather than queued, preserving the requested rate's open-loop
//! character.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    hard_stop_after, BaseConfig, BaseExecutor, Executor, ExecutorError, ExecutionStep,
    IterationOutcome, RunContext, DEFAULT_TIME_UNIT,
};
use crate::options::{Setting, TimeSpan};
use crate::progress::{format_fixed_duration, ExecutorPhase, Progress};
use crate::sample::{Sample, SampleContainer, METRIC_DROPPED_ITERATIONS};
use crate::segment::ExecutionSegment;
use crate::state::ExecutionState;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConstantArrivalRateConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub rate: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub time_unit: Setting<TimeSpan>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub duration: Setting<TimeSpan>,
    #[serde(rename = "preAllocatedVUs", skip_serializing_if = "Setting::is_unset")]
    pub preallocated_vus: Setting<i64>,
}

impl ConstantArrivalRateConfig {
    pub fn rate(&self) -> i64 {
        self.rate.unwrap_or(0)
    }

    pub fn time_unit(&self) -> Duration {
        self.time_unit.unwrap_or(DEFAULT_TIME_UNIT).duration()
    }

    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or(TimeSpan::ZERO).duration()
    }

    pub fn preallocated_vus(&self) -> i64 {
        self.preallocated_vus.unwrap_or(0)
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if self.rate() <= 0 {
            errors.push(format!(
                "executor `{}`: the arrival rate must be positive",
                self.base.name
            ));
        }
        if self.time_unit().is_zero() {
            errors.push(format!(
                "executor `{}`: timeUnit must be positive",
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
        if self.preallocated_vus() <= 0 {
            errors.push(format!(
                "executor `{}`: preAllocatedVUs must be positive",
                self.base.name
            ));
        }
    }

    pub(crate) fn execution_requirements(&self, segment: &ExecutionSegment) -> Vec<ExecutionStep> {
        vec![
            ExecutionStep {
                offset: Duration::ZERO,
                planned_vus: segment.scale(self.preallocated_vus().max(0) as u64),
            },
            ExecutionStep {
                offset: self.duration(),
                planned_vus: 0,
            },
        ]
    }
}

pub struct ConstantArrivalRate {
    base: Arc<BaseExecutor>,
    config: ConstantArrivalRateConfig,
}

impl ConstantArrivalRate {
    pub(crate) fn new(config: ConstantArrivalRateConfig, state: Arc<ExecutionState>) -> Self {
        ConstantArrivalRate {
            base: Arc::new(BaseExecutor::new(config.base.name.clone(), state)),
            config,
        }
    }
}

#[async_trait]
impl Executor for ConstantArrivalRate {
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
        let rate = segment.scale(self.config.rate().max(0) as u64);
        let duration = self.config.duration();
        let time_unit = self.config.time_unit();
        let period = Duration::from_secs_f64(time_unit.as_secs_f64() / rate.max(1) as f64);
        let started = Instant::now();

        let progress = self.base.progress();
        {
            let per_second = rate as f64 / time_unit.as_secs_f64();
            progress.set_progress_fn(move || {
                let spent = started.elapsed().min(duration);
                let fraction = spent.as_secs_f64() / duration.as_secs_f64();
                let right = format!(
                    "{}/{} {per_second:.02} iters/s",
                    format_fixed_duration(spent, duration),
                    TimeSpan::new(duration)
                );
                (fraction, right)
            });
        }
        progress.advance_phase(ExecutorPhase::Running);
        debug!(executor = %self.base.name(), rate, ?period, ?duration, "starting constant arrival rate");

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

        let mut in_flight: JoinSet<Result<(), ExecutorError>> = JoinSet::new();
        if rate == 0 {
            // This instance's segment share of the rate is nothing; just
            // sit out the schedule.
            stop.cancelled().await;
            progress.advance_phase(ExecutorPhase::Done);
            return Ok(());
        }
        let mut ticker = tokio::time::interval_at(started + period, period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match ctx.state.try_get_planned_vu() {
                Some(mut vu) => {
                    self.base.next_local_vu_id();
                    let base = Arc::clone(&self.base);
                    let ctx = ctx.clone();
                    let hard = hard.clone();
                    in_flight.spawn(async move {
                        match base.run_guarded_iteration(&mut vu, &ctx.out, &hard).await? {
                            IterationOutcome::Full(_) => ctx.state.return_vu(vu, true),
                            IterationOutcome::Abandoned => ctx.state.abandon_vu(),
                        }
                        Ok(())
                    });
                }
                None => {
                    warn!(
                        executor = %self.base.name(),
                        "no free VUs, dropping an iteration"
                    );
                    let sample = Sample::new(METRIC_DROPPED_ITERATIONS, 1.0)
                        .with_tags(self.base.sample_tags(None));
                    ctx.out
                        .send(SampleContainer::from(sample))
                        .await
                        .map_err(|_| ExecutorError::OutputClosed)?;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(res) => res?,
                Err(join_err) => {
                    tracing::error!(executor = %self.base.name(), error = %join_err, "iteration task panicked");
                }
            }
        }
        progress.advance_phase(ExecutorPhase::Done);
        Ok(())
    }
}
