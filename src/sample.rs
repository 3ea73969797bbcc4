//! The metric sample model shared between executors and sinks.
//!
//! Executors do not know anything about the sinks consuming them; they only
//! push [`SampleContainer`] batches into a caller-provided channel. A batch
//! groups the samples of one event (usually one iteration) so a sink can
//! treat them atomically.

use std::collections::BTreeMap;
use std::time::SystemTime;

/// Count of completed iterations.
pub const METRIC_ITERATIONS: &str = "iterations";
/// Wall-clock duration of one iteration.
pub const METRIC_ITERATION_DURATION: &str = "iteration_duration";
/// Iterations an arrival-rate executor could not dispatch for want of a VU.
pub const METRIC_DROPPED_ITERATIONS: &str = "dropped_iterations";

/// A single time-stamped measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub time: SystemTime,
    pub tags: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Sample {
            metric: metric.into(),
            value,
            time: SystemTime::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// An opaque batch of samples emitted as one unit.
///
/// Batches from a single VU's single iteration preserve their production
/// order on the output channel. A batch produced by an iteration that was
/// cut short by a stop deadline is flagged `interrupted`; its samples are
/// still delivered, never rolled back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleContainer {
    samples: Vec<Sample>,
    interrupted: bool,
}

impl SampleContainer {
    pub fn new(samples: Vec<Sample>) -> Self {
        SampleContainer {
            samples,
            interrupted: false,
        }
    }

    pub fn interrupted(samples: Vec<Sample>) -> Self {
        SampleContainer {
            samples,
            interrupted: true,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Sample> for SampleContainer {
    fn from(sample: Sample) -> Self {
        SampleContainer::new(vec![sample])
    }
}
