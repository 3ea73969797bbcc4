//! VU count ramping linearly through a list of stages.
//!
//! Each stage moves the active VU count from wherever the previous stage
//! left it toward the stage target. The `|target - current|` transitions
//! are spread evenly across the stage duration, tie-breaking offsets with
//! round-half-to-even. Stages are strictly sequential.
//!
//! Ramped-down VUs get `gracefulRampDown` to finish their current
//! iteration before being forcibly released; making the window counts the
//! iteration as full, overrunning it counts it as interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    hard_stop_after, planned_duration, BaseConfig, BaseExecutor, Executor, ExecutorError,
    ExecutionStep, IterationOutcome, RunContext, DEFAULT_GRACEFUL_RAMP_DOWN,
};
use crate::options::{Setting, Stage, TimeSpan};
use crate::progress::{format_fixed_duration, ExecutorPhase, Progress};
use crate::segment::ExecutionSegment;
use crate::state::{ExecutionState, InitializedVu};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RampingVusConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(rename = "startVUs", skip_serializing_if = "Setting::is_unset")]
    pub start_vus: Setting<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub graceful_ramp_down: Setting<TimeSpan>,
}

impl RampingVusConfig {
    pub fn start_vus(&self) -> i64 {
        self.start_vus.unwrap_or(1)
    }

    pub fn graceful_ramp_down(&self) -> Duration {
        self.graceful_ramp_down
            .unwrap_or(DEFAULT_GRACEFUL_RAMP_DOWN)
            .duration()
    }

    /// Stages with their defaults applied, as `(duration, target)` pairs.
    fn concrete_stages(&self) -> Vec<(Duration, u64)> {
        self.stages
            .iter()
            .filter_map(|s| {
                let duration = s.duration.value()?.duration();
                let target = s.target.unwrap_or(0).max(0) as u64;
                Some((duration, target))
            })
            .collect()
    }

    pub(crate) fn validate_into(&self, errors: &mut Vec<String>) {
        if self.start_vus() < 0 {
            errors.push(format!(
                "executor `{}`: startVUs cannot be negative",
                self.base.name
            ));
        }
        if self.stages.is_empty() {
            errors.push(format!(
                "executor `{}`: at least one stage is required",
                self.base.name
            ));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.duration.value().is_none() {
                errors.push(format!(
                    "executor `{}`: stage {i} is missing a duration",
                    self.base.name
                ));
            }
            match stage.target.value() {
                None => errors.push(format!(
                    "executor `{}`: stage {i} is missing a target",
                    self.base.name
                )),
                Some(t) if *t < 0 => errors.push(format!(
                    "executor `{}`: stage {i} has a negative target",
                    self.base.name
                )),
                Some(_) => {}
            }
        }
        let total: Duration = self.concrete_stages().iter().map(|(d, _)| *d).sum();
        if !self.stages.is_empty() && total.is_zero() {
            errors.push(format!(
                "executor `{}`: the stages must add up to a positive duration",
                self.base.name
            ));
        }
    }

    pub(crate) fn execution_requirements(&self, segment: &ExecutionSegment) -> Vec<ExecutionStep> {
        let start = segment.scale(self.start_vus().max(0) as u64);
        let stages: Vec<(Duration, u64)> = self
            .concrete_stages()
            .into_iter()
            .map(|(d, t)| (d, segment.scale(t)))
            .collect();
        plan_steps(start, &stages)
    }
}

/// Integer division rounding half to even, on nanosecond offsets.
fn round_half_even(num: u128, den: u128) -> u128 {
    let q = num / den;
    let twice_rem = 2 * (num % den);
    if twice_rem > den || (twice_rem == den && q % 2 == 1) {
        q + 1
    } else {
        q
    }
}

/// The timed VU-count plan for a ramp: one step per VU transition, plus
/// the initial count and a final wind-down marker at the total duration.
pub(crate) fn plan_steps(start_vus: u64, stages: &[(Duration, u64)]) -> Vec<ExecutionStep> {
    let mut steps = vec![ExecutionStep {
        offset: Duration::ZERO,
        planned_vus: start_vus,
    }];
    let mut current = start_vus;
    let mut base_offset = Duration::ZERO;

    for &(duration, target) in stages {
        if duration.is_zero() {
            // An instant jump; a single step covers every transition.
            if target != current {
                steps.push(ExecutionStep {
                    offset: base_offset,
                    planned_vus: target,
                });
                current = target;
            }
            continue;
        }
        let transitions = target.abs_diff(current);
        for i in 1..=transitions {
            let nanos = round_half_even(duration.as_nanos() * i as u128, transitions as u128);
            let planned_vus = if target > current {
                current + i
            } else {
                current - i
            };
            steps.push(ExecutionStep {
                offset: base_offset + Duration::from_nanos(nanos as u64),
                planned_vus,
            });
        }
        current = target;
        base_offset += duration;
    }

    steps.push(ExecutionStep {
        offset: base_offset,
        planned_vus: 0,
    });
    steps
}

pub struct RampingVus {
    base: Arc<BaseExecutor>,
    config: RampingVusConfig,
}

impl RampingVus {
    pub(crate) fn new(config: RampingVusConfig, state: Arc<ExecutionState>) -> Self {
        RampingVus {
            base: Arc::new(BaseExecutor::new(config.base.name.clone(), state)),
            config,
        }
    }
}

struct WorkerSlot {
    ramp: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), ExecutorError>>,
}

#[async_trait]
impl Executor for RampingVus {
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
        let steps = self.config.execution_requirements(&segment);
        let total = planned_duration(&steps);
        let ramp_down = self.config.graceful_ramp_down();
        let started = Instant::now();

        let current_target = Arc::new(AtomicU64::new(0));
        let progress = self.base.progress();
        {
            let current_target = Arc::clone(&current_target);
            progress.set_progress_fn(move || {
                let spent = started.elapsed().min(total);
                let fraction = spent.as_secs_f64() / total.as_secs_f64();
                let right = format!(
                    "{}/{} {} VUs",
                    format_fixed_duration(spent, total),
                    TimeSpan::new(total),
                    current_target.load(Ordering::Relaxed)
                );
                (fraction, right)
            });
        }
        progress.advance_phase(ExecutorPhase::Running);
        debug!(executor = %self.base.name(), ?total, steps = steps.len(), "starting VU ramp");

        let stop = ctx.stop.child_token();
        let hard = hard_stop_after(&stop, self.config.base.graceful_stop());
        super::mark_stopping_on(&progress, &stop);

        let mut slots: Vec<WorkerSlot> = Vec::new();
        let mut retired: Vec<tokio::task::JoinHandle<Result<(), ExecutorError>>> = Vec::new();
        // The final plan entry only marks the total duration; the VUs that
        // remain there wind down under the executor-wide graceful stop.
        let transitions = &steps[..steps.len() - 1];
        'plan: for step in transitions {
            tokio::select! {
                _ = tokio::time::sleep_until(started + step.offset) => {}
                _ = stop.cancelled() => break 'plan,
            }
            current_target.store(step.planned_vus, Ordering::Relaxed);
            let want = step.planned_vus as usize;
            while slots.len() > want {
                // Newest VUs are released first.
                let slot = slots.pop().expect("len checked above");
                slot.ramp.cancel();
                retired.push(slot.handle);
            }
            while slots.len() < want {
                let vu = match ctx.state.get_planned_vu(&stop).await {
                    Ok(vu) => vu,
                    Err(_) if stop.is_cancelled() => break 'plan,
                    Err(err) => return Err(err.into()),
                };
                let local_id = self.base.next_local_vu_id();
                debug!(executor = %self.base.name(), vu = vu.id, local_id, "ramping up");
                let ramp = CancellationToken::new();
                let handle = tokio::spawn(ramping_worker(
                    Arc::clone(&self.base),
                    ctx.clone(),
                    stop.clone(),
                    ramp.clone(),
                    hard.clone(),
                    ramp_down,
                    vu,
                ));
                slots.push(WorkerSlot { ramp, handle });
            }
        }

        // End of the schedule (or an early stop): release everyone.
        tokio::select! {
            _ = tokio::time::sleep_until(started + total) => {}
            _ = stop.cancelled() => {}
        }
        stop.cancel();
        current_target.store(0, Ordering::Relaxed);
        retired.extend(slots.into_iter().map(|slot| slot.handle));
        for handle in retired {
            match handle.await {
                Ok(res) => res?,
                Err(join_err) => {
                    tracing::error!(executor = %self.base.name(), error = %join_err, "VU worker panicked");
                }
            }
        }
        progress.advance_phase(ExecutorPhase::Done);
        Ok(())
    }
}

/// A ramping VU loop: like the constant one, but it additionally exits on
/// its personal ramp-down token, whose graceful window is
/// `gracefulRampDown` instead of the executor-wide `gracefulStop`.
async fn ramping_worker(
    base: Arc<BaseExecutor>,
    ctx: RunContext,
    stop: CancellationToken,
    ramp: CancellationToken,
    executor_hard: CancellationToken,
    ramp_down: Duration,
    mut vu: InitializedVu,
) -> Result<(), ExecutorError> {
    let hard = CancellationToken::new();
    {
        let hard = hard.clone();
        let executor_hard = executor_hard.clone();
        let ramp = ramp.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = executor_hard.cancelled() => {}
                _ = async {
                    ramp.cancelled().await;
                    tokio::time::sleep(ramp_down).await;
                } => {}
            }
            hard.cancel();
        });
    }

    loop {
        if stop.is_cancelled() || ramp.is_cancelled() {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testutil::{sink, state_with_vus};
    use crate::runner::iteration;
    use std::sync::atomic::AtomicU64;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn plan_distributes_transitions_evenly() {
        let steps = plan_steps(0, &[(secs(4), 4)]);
        let offsets: Vec<u64> = steps.iter().map(|s| s.offset.as_secs()).collect();
        let vus: Vec<u64> = steps.iter().map(|s| s.planned_vus).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4, 4]);
        assert_eq!(vus, vec![0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn plan_handles_ramp_down_and_holds() {
        // Hold at 5 for 1s, drop instantly to 3, hold for 1s.
        let steps = plan_steps(5, &[(secs(1), 5), (Duration::ZERO, 3), (secs(1), 3)]);
        assert_eq!(
            steps,
            vec![
                ExecutionStep { offset: Duration::ZERO, planned_vus: 5 },
                ExecutionStep { offset: secs(1), planned_vus: 3 },
                ExecutionStep { offset: secs(2), planned_vus: 0 },
            ]
        );
    }

    #[test]
    fn plan_ties_round_half_to_even() {
        // Two transitions over 5ns: raw offsets 2.5ns and 5ns; the tie at
        // 2.5 rounds down to the even 2.
        let steps = plan_steps(0, &[(Duration::from_nanos(5), 2)]);
        assert_eq!(steps[1].offset, Duration::from_nanos(2));
        assert_eq!(steps[2].offset, Duration::from_nanos(5));
    }

    #[test]
    fn plan_max_equals_peak_target() {
        let steps = plan_steps(2, &[(secs(10), 100), (secs(10), 10)]);
        assert_eq!(crate::executor::max_planned_vus(&steps), 100);
        assert_eq!(planned_duration(&steps), secs(20));
    }

    fn test_config() -> RampingVusConfig {
        RampingVusConfig {
            base: BaseConfig {
                graceful_stop: Setting::Value(TimeSpan::ZERO),
                ..BaseConfig::named("default")
            },
            start_vus: Setting::Value(5),
            stages: vec![
                Stage::new(TimeSpan::from_secs(1), 5),
                Stage::new(TimeSpan::ZERO, 3),
                Stage::new(TimeSpan::from_secs(1), 3),
            ],
            graceful_ramp_down: Setting::Value(TimeSpan::ZERO),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn active_vus_track_the_stage_targets() {
        let iter_count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&iter_count);
        // 300ms iterations never land exactly on a stage boundary, so the
        // in-flight iteration at each boundary is deterministically cut.
        let state = state_with_vus(
            move |_id| {
                let c = Arc::clone(&c);
                iteration(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            },
            5,
        )
        .await;

        let mut executor = RampingVus::new(test_config(), Arc::clone(&state));
        let ctx = RunContext {
            stop: CancellationToken::new(),
            state: Arc::clone(&state),
            out: sink(),
        };

        let sampler_state = Arc::clone(&state);
        let sampler = tokio::spawn(async move {
            let mut observed = Vec::new();
            tokio::time::sleep(Duration::from_millis(100)).await;
            observed.push(sampler_state.currently_active_vus());
            tokio::time::sleep(Duration::from_secs(1)).await;
            observed.push(sampler_state.currently_active_vus());
            tokio::time::sleep(Duration::from_secs(1)).await;
            observed.push(sampler_state.currently_active_vus());
            observed
        });

        executor.run(ctx).await.unwrap();
        let observed = sampler.await.unwrap();
        assert_eq!(observed, vec![5, 3, 0]);

        // Every VU completes 3 iterations in the first second. The two
        // ramped-down VUs lose their 4th iteration to the zero
        // graceful-ramp-down; the surviving three run on until the 2s mark
        // for 6 full iterations each, losing their 7th the same way.
        assert_eq!(iter_count.load(Ordering::Relaxed), 24);
        assert_eq!(state.full_iterations_count(), 24);
        assert_eq!(state.interrupted_iterations_count(), 5);
    }

    #[test]
    fn validation_flags_empty_and_malformed_stages() {
        let mut errors = Vec::new();
        RampingVusConfig {
            base: BaseConfig::named("ramp"),
            ..Default::default()
        }
        .validate_into(&mut errors);
        assert!(!errors.is_empty());

        let mut errors = Vec::new();
        RampingVusConfig {
            base: BaseConfig::named("ramp"),
            stages: vec![Stage {
                duration: Setting::Unset,
                target: Setting::Value(-2),
            }],
            ..Default::default()
        }
        .validate_into(&mut errors);
        assert_eq!(errors.len(), 3);
    }
}
