//! Executors — the workload shapes that drive VU cohorts through
//! iterations.
//!
//! An executor translates a declarative config into a timed sequence of
//! iterations against the shared VU pool. The five shapes form a closed
//! set, decoded from JSON by the `"type"` tag of each entry in the
//! execution map and dispatched through the [`Executor`] trait:
//!
//! - [`constant_vus`]: N looping VUs for a fixed duration
//! - [`ramping_vus`]: VU count ramps linearly through stages
//! - [`shared_iterations`]: N VUs share an iteration budget
//! - [`per_vu_iterations`]: every VU runs its own iteration budget
//! - [`constant_arrival_rate`]: open-loop dispatch at a fixed rate

pub mod constant_arrival_rate;
pub mod constant_vus;
pub mod per_vu_iterations;
pub mod ramping_vus;
pub mod shared_iterations;

pub use constant_arrival_rate::{ConstantArrivalRate, ConstantArrivalRateConfig};
pub use constant_vus::{ConstantVus, ConstantVusConfig};
pub use per_vu_iterations::{PerVuIterations, PerVuIterationsConfig};
pub use ramping_vus::{RampingVus, RampingVusConfig};
pub use shared_iterations::{SharedIterations, SharedIterationsConfig};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::options::{Setting, TimeSpan};
use crate::progress::Progress;
use crate::runner::IterationError;
use crate::sample::{Sample, SampleContainer, METRIC_ITERATIONS, METRIC_ITERATION_DURATION};
use crate::segment::ExecutionSegment;
use crate::state::{ExecutionState, InitializedVu, StateError};

/// Name given to the executor synthesized from shortcut options.
pub const DEFAULT_EXECUTOR_NAME: &str = "default";

/// How long in-flight iterations may keep running after a stop signal.
pub const DEFAULT_GRACEFUL_STOP: TimeSpan = TimeSpan::from_secs(30);
/// Like `DEFAULT_GRACEFUL_STOP`, for VUs released during a ramp-down.
pub const DEFAULT_GRACEFUL_RAMP_DOWN: TimeSpan = TimeSpan::from_secs(30);
/// Cap on iteration-counted executors that carry no explicit duration.
pub const DEFAULT_MAX_DURATION: TimeSpan = TimeSpan::from_secs(10 * 60);
/// Denominator of `rate` when no time unit is configured.
pub const DEFAULT_TIME_UNIT: TimeSpan = TimeSpan::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("the sample output channel is closed")]
    OutputClosed,
    #[error(transparent)]
    State(#[from] StateError),
}

/// A planned VU-count change at an offset from executor start. The
/// requirements of an executor are the full list of these events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStep {
    pub offset: Duration,
    pub planned_vus: u64,
}

/// The highest concurrent VU need across a plan.
pub fn max_planned_vus(steps: &[ExecutionStep]) -> u64 {
    steps.iter().map(|s| s.planned_vus).max().unwrap_or(0)
}

/// The offset of the last planned event, i.e. the planned duration.
pub fn planned_duration(steps: &[ExecutionStep]) -> Duration {
    steps.last().map(|s| s.offset).unwrap_or(Duration::ZERO)
}

/// Options shared by every executor shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaseConfig {
    /// Key of this entry in the execution map; not part of the JSON body.
    #[serde(skip)]
    pub name: String,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub start_time: Setting<TimeSpan>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub graceful_stop: Setting<TimeSpan>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub segment: Setting<ExecutionSegment>,
}

impl BaseConfig {
    pub fn named(name: impl Into<String>) -> Self {
        BaseConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn start_time(&self) -> Duration {
        self.start_time.unwrap_or(TimeSpan::ZERO).duration()
    }

    pub fn graceful_stop(&self) -> Duration {
        self.graceful_stop.unwrap_or(DEFAULT_GRACEFUL_STOP).duration()
    }

    /// This executor's segment, or the run-wide one when unset.
    pub fn segment_or(&self, run_segment: &ExecutionSegment) -> ExecutionSegment {
        self.segment.value().cloned().unwrap_or(*run_segment)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("executor names cannot be empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(format!(
                "executor name `{}` may only contain letters, digits, `_` and `-`",
                self.name
            ));
        }
        errors
    }
}

/// The closed sum of the five workload shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutorConfig {
    #[serde(rename = "constant-vus")]
    ConstantVus(ConstantVusConfig),
    #[serde(rename = "ramping-vus")]
    RampingVus(RampingVusConfig),
    #[serde(rename = "shared-iterations")]
    SharedIterations(SharedIterationsConfig),
    #[serde(rename = "per-vu-iterations")]
    PerVuIterations(PerVuIterationsConfig),
    #[serde(rename = "constant-arrival-rate")]
    ConstantArrivalRate(ConstantArrivalRateConfig),
}

impl ExecutorConfig {
    pub fn base(&self) -> &BaseConfig {
        match self {
            ExecutorConfig::ConstantVus(c) => &c.base,
            ExecutorConfig::RampingVus(c) => &c.base,
            ExecutorConfig::SharedIterations(c) => &c.base,
            ExecutorConfig::PerVuIterations(c) => &c.base,
            ExecutorConfig::ConstantArrivalRate(c) => &c.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseConfig {
        match self {
            ExecutorConfig::ConstantVus(c) => &mut c.base,
            ExecutorConfig::RampingVus(c) => &mut c.base,
            ExecutorConfig::SharedIterations(c) => &mut c.base,
            ExecutorConfig::PerVuIterations(c) => &mut c.base,
            ExecutorConfig::ConstantArrivalRate(c) => &mut c.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    /// The wire tag this config decodes from.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorConfig::ConstantVus(_) => "constant-vus",
            ExecutorConfig::RampingVus(_) => "ramping-vus",
            ExecutorConfig::SharedIterations(_) => "shared-iterations",
            ExecutorConfig::PerVuIterations(_) => "per-vu-iterations",
            ExecutorConfig::ConstantArrivalRate(_) => "constant-arrival-rate",
        }
    }

    /// Collects every configuration problem; an empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.base().validate();
        match self {
            ExecutorConfig::ConstantVus(c) => c.validate_into(&mut errors),
            ExecutorConfig::RampingVus(c) => c.validate_into(&mut errors),
            ExecutorConfig::SharedIterations(c) => c.validate_into(&mut errors),
            ExecutorConfig::PerVuIterations(c) => c.validate_into(&mut errors),
            ExecutorConfig::ConstantArrivalRate(c) => c.validate_into(&mut errors),
        }
        errors
    }

    /// The timed VU plan of this executor under `segment`.
    pub fn execution_requirements(&self, segment: &ExecutionSegment) -> Vec<ExecutionStep> {
        let segment = self.base().segment_or(segment);
        match self {
            ExecutorConfig::ConstantVus(c) => c.execution_requirements(&segment),
            ExecutorConfig::RampingVus(c) => c.execution_requirements(&segment),
            ExecutorConfig::SharedIterations(c) => c.execution_requirements(&segment),
            ExecutorConfig::PerVuIterations(c) => c.execution_requirements(&segment),
            ExecutorConfig::ConstantArrivalRate(c) => c.execution_requirements(&segment),
        }
    }

    /// Instantiate the runtime executor for this config.
    pub fn build(&self, state: Arc<ExecutionState>) -> Box<dyn Executor> {
        match self.clone() {
            ExecutorConfig::ConstantVus(c) => Box::new(ConstantVus::new(c, state)),
            ExecutorConfig::RampingVus(c) => Box::new(RampingVus::new(c, state)),
            ExecutorConfig::SharedIterations(c) => Box::new(SharedIterations::new(c, state)),
            ExecutorConfig::PerVuIterations(c) => Box::new(PerVuIterations::new(c, state)),
            ExecutorConfig::ConstantArrivalRate(c) => {
                Box::new(ConstantArrivalRate::new(c, state))
            }
        }
    }
}

/// The execution map: executor configs keyed by their unique names.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ExecutionMap(BTreeMap<String, ExecutorConfig>);

impl ExecutionMap {
    pub fn single(name: impl Into<String>, mut config: ExecutorConfig) -> Self {
        let name = name.into();
        config.base_mut().name = name.clone();
        ExecutionMap(BTreeMap::from([(name, config)]))
    }

    pub fn insert(&mut self, name: impl Into<String>, mut config: ExecutorConfig) {
        let name = name.into();
        config.base_mut().name = name.clone();
        self.0.insert(name, config);
    }

    pub fn get(&self, name: &str) -> Option<&ExecutorConfig> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExecutorConfig)> {
        self.0.iter()
    }

    pub fn configs(&self) -> impl Iterator<Item = &ExecutorConfig> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ExecutionMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = BTreeMap::<String, ExecutorConfig>::deserialize(deserializer)?;
        for (name, config) in map.iter_mut() {
            config.base_mut().name = name.clone();
        }
        Ok(ExecutionMap(map))
    }
}

/// Everything an executor needs while running.
#[derive(Clone)]
pub struct RunContext {
    /// Fires when no new iterations should start; in-flight iterations
    /// then have their executor's graceful window to finish.
    pub stop: CancellationToken,
    pub state: Arc<ExecutionState>,
    pub out: mpsc::Sender<SampleContainer>,
}

/// The dispatch interface over the closed executor sum.
#[async_trait]
pub trait Executor: Send {
    fn name(&self) -> &str;

    fn progress(&self) -> Arc<Progress>;

    /// Preparatory work before the run; usually a no-op because the
    /// scheduler pre-initializes all planned VUs.
    async fn init(&mut self, _token: &CancellationToken) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// The main loop. Blocks until the schedule completes, `ctx.stop`
    /// fires and the graceful window drains, or a fatal error occurs.
    async fn run(&mut self, ctx: RunContext) -> Result<(), ExecutorError>;
}

/// Common plumbing shared by the executor implementations: naming,
/// progress, per-executor counters, and iteration bookkeeping samples.
pub(crate) struct BaseExecutor {
    name: String,
    state: Arc<ExecutionState>,
    progress: Arc<Progress>,
    local_vu_serial: AtomicU64,
    local_iters: AtomicU64,
}

impl BaseExecutor {
    pub(crate) fn new(name: impl Into<String>, state: Arc<ExecutionState>) -> Self {
        let name = name.into();
        BaseExecutor {
            progress: Arc::new(Progress::new(&name)),
            name,
            state,
            local_vu_serial: AtomicU64::new(0),
            local_iters: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Executor-local VU id, distinct from the global pool id.
    pub(crate) fn next_local_vu_id(&self) -> u64 {
        self.local_vu_serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn incr_local_iters(&self) {
        self.local_iters.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn local_iters(&self) -> u64 {
        self.local_iters.load(Ordering::SeqCst)
    }

    /// Tags for samples emitted by this executor, honoring the
    /// consolidated system-tags set.
    pub(crate) fn sample_tags(&self, vu_id: Option<u64>) -> BTreeMap<String, String> {
        let options = self.state.options();
        let mut tags = options.run_tags();
        if options.has_system_tag("scenario") {
            tags.insert("scenario".to_string(), self.name.clone());
        }
        if let Some(id) = vu_id {
            if options.has_system_tag("vu") {
                tags.insert("vu".to_string(), id.to_string());
            }
        }
        tags
    }
}

/// What became of one guarded iteration.
#[derive(Debug)]
pub(crate) enum IterationOutcome {
    /// The iteration ran to completion (possibly with a script error).
    Full(Option<IterationError>),
    /// The hard deadline fired first; the iteration was abandoned.
    Abandoned,
}

/// Flips the progress phase to `Stopping` as soon as `stop` fires.
pub(crate) fn mark_stopping_on(progress: &Arc<Progress>, stop: &CancellationToken) {
    let progress = Arc::clone(progress);
    let stop = stop.clone();
    tokio::spawn(async move {
        stop.cancelled().await;
        progress.advance_phase(crate::progress::ExecutorPhase::Stopping);
    });
}

/// Returns a token that fires `graceful` after `stop` does. The pair forms
/// the two-phase shutdown every executor uses: `stop` blocks new
/// iterations, the returned token abandons in-flight ones.
pub(crate) fn hard_stop_after(stop: &CancellationToken, graceful: Duration) -> CancellationToken {
    let hard = CancellationToken::new();
    let soft = stop.clone();
    let trigger = hard.clone();
    tokio::spawn(async move {
        soft.cancelled().await;
        tokio::time::sleep(graceful).await;
        trigger.cancel();
    });
    hard
}

impl BaseExecutor {
    /// Run one iteration of `ivu`, bounded by `hard`. Emits the iteration
    /// bookkeeping samples and returns how the iteration ended.
    pub(crate) async fn run_guarded_iteration(
        &self,
        ivu: &mut InitializedVu,
        out: &mpsc::Sender<SampleContainer>,
        hard: &CancellationToken,
    ) -> Result<IterationOutcome, ExecutorError> {
        let started = Instant::now();
        let outcome = tokio::select! {
            res = ivu.vu.run_once(out) => IterationOutcome::Full(res.err()),
            _ = hard.cancelled() => IterationOutcome::Abandoned,
        };

        let mut tags = self.sample_tags(Some(ivu.id));
        let elapsed = started.elapsed();
        let mut samples = Vec::with_capacity(2);
        if let IterationOutcome::Full(Some(err)) = &outcome {
            tracing::warn!(executor = %self.name, vu = ivu.id, error = %err, "iteration failed");
            if self.state.options().has_system_tag("error") {
                tags.insert("error".to_string(), err.to_string());
            }
        }
        samples.push(
            Sample::new(METRIC_ITERATION_DURATION, elapsed.as_secs_f64() * 1000.0)
                .with_tags(tags.clone()),
        );
        let container = match &outcome {
            IterationOutcome::Full(_) => {
                samples.push(Sample::new(METRIC_ITERATIONS, 1.0).with_tags(tags));
                self.incr_local_iters();
                SampleContainer::new(samples)
            }
            IterationOutcome::Abandoned => SampleContainer::interrupted(samples),
        };
        out.send(container)
            .await
            .map_err(|_| ExecutorError::OutputClosed)?;
        Ok(outcome)
    }
}
