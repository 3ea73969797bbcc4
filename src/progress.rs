//! Per-executor progress reporting.
//!
//! Each executor owns a [`Progress`] handle and installs a closure that
//! computes its completion fraction and a short status text. The scheduler
//! ticks every handle periodically; consumers (a progress bar, a test)
//! subscribe to the watch channel and always see the latest snapshot
//! without blocking anything.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::warn;

/// Lifecycle phase of one executor. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExecutorPhase {
    Planned = 0,
    Initializing = 1,
    Waiting = 2,
    Running = 3,
    Stopping = 4,
    Done = 5,
    Failed = 6,
}

impl ExecutorPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExecutorPhase::Planned,
            1 => ExecutorPhase::Initializing,
            2 => ExecutorPhase::Waiting,
            3 => ExecutorPhase::Running,
            4 => ExecutorPhase::Stopping,
            5 => ExecutorPhase::Done,
            _ => ExecutorPhase::Failed,
        }
    }
}

/// The most recent progress observation for one executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub fraction: f64,
    pub right: String,
    pub phase: ExecutorPhase,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        ProgressSnapshot {
            fraction: 0.0,
            right: String::new(),
            phase: ExecutorPhase::Planned,
        }
    }
}

type ProgressFn = Box<dyn Fn() -> (f64, String) + Send + Sync>;

/// Thread-safe progress handle with a pollable snapshot.
pub struct Progress {
    name: String,
    phase: AtomicU8,
    progress_fn: RwLock<Option<ProgressFn>>,
    tx: watch::Sender<ProgressSnapshot>,
}

impl Progress {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Progress {
            name: name.into(),
            phase: AtomicU8::new(ExecutorPhase::Planned as u8),
            progress_fn: RwLock::new(None),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the closure that computes `(fraction, right text)`.
    pub fn set_progress_fn(&self, f: impl Fn() -> (f64, String) + Send + Sync + 'static) {
        *self.progress_fn.write() = Some(Box::new(f));
    }

    /// Subscribe to snapshots; reading the receiver never blocks.
    pub fn observer(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Advance the lifecycle phase; regressions are ignored.
    pub fn advance_phase(&self, phase: ExecutorPhase) {
        self.phase.fetch_max(phase as u8, Ordering::SeqCst);
    }

    pub fn phase(&self) -> ExecutorPhase {
        ExecutorPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Evaluate the installed closure and publish a fresh snapshot.
    pub fn tick(&self) {
        let (mut fraction, right) = match &*self.progress_fn.read() {
            Some(f) => f(),
            None => (0.0, String::new()),
        };
        if !(0.0..=1.0).contains(&fraction) {
            warn!(
                executor = %self.name,
                fraction,
                "progress value exceeds valid range, clamping to [0, 1]"
            );
            fraction = fraction.clamp(0.0, 1.0);
        }
        self.tx.send_replace(ProgressSnapshot {
            fraction,
            right,
            phase: self.phase(),
        });
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Formats a positive duration at fixed width for stable progress text,
/// showing only the units that `max` needs: `"04.3s"`, `"1m04.3s"`,
/// `"0h01m04.3s"`.
pub fn format_fixed_duration(d: Duration, max: Duration) -> String {
    let total = d.as_secs_f64();
    let hours = (total / 3600.0) as u64;
    let mins = ((total / 60.0) as u64) % 60;
    let secs = total % 60.0;

    if max.as_secs() >= 3600 {
        format!("{hours}h{mins:02}m{secs:04.1}s")
    } else if max.as_secs() >= 60 {
        format!("{mins}m{secs:04.1}s")
    } else {
        format!("{secs:04.1}s")
    }
}
