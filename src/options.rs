//! User-tunable options and the three-state values they are built from.
//!
//! Every knob a user can touch is a [`Setting`], so that layered
//! configuration sources (defaults, file, environment, CLI, script) can be
//! folded together without a later source accidentally clobbering an earlier
//! one with a zero value. A missing JSON key stays [`Setting::Unset`], an
//! explicit `null` becomes [`Setting::Null`], and anything else is
//! [`Setting::Value`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::executor::ExecutionMap;
use crate::segment::ExecutionSegment;

/// A three-state configuration value: unset, explicitly null, or set.
///
/// Merging is right-biased on the "is set" predicate: `Unset` loses to
/// anything, while `Null` and `Value` both replace whatever came before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Setting<T> {
    /// The option was never mentioned by any source.
    #[default]
    Unset,
    /// A source explicitly cleared the option.
    Null,
    /// A source supplied a concrete value.
    Value(T),
}

impl<T> Setting<T> {
    /// Whether a source has touched this option, either clearing or setting it.
    pub fn is_set(&self) -> bool {
        !matches!(self, Setting::Unset)
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Setting::Unset)
    }

    /// The concrete value, if one is present.
    pub fn value(&self) -> Option<&T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Right-biased merge: `other` wins unless it is `Unset`.
    pub fn apply(self, other: Self) -> Self {
        if other.is_set() { other } else { self }
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Setting::Value(v) => v,
            _ => default,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Setting<U> {
        match self {
            Setting::Value(v) => Setting::Value(f(v)),
            Setting::Null => Setting::Null,
            Setting::Unset => Setting::Unset,
        }
    }

    pub fn as_ref(&self) -> Setting<&T> {
        match self {
            Setting::Value(v) => Setting::Value(v),
            Setting::Null => Setting::Null,
            Setting::Unset => Setting::Unset,
        }
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Setting::Value(value)
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Setting::Value(v) => v.serialize(serializer),
            // `Unset` fields are skipped at the struct level; if one slips
            // through it degrades to an explicit null.
            Setting::Null | Setting::Unset => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Setting::Value(v),
            None => Setting::Null,
        })
    }
}

/// A duration as users write it: `"2s"`, `"1m30s"`, `"200ms"`, `"0.5s"`.
///
/// Serializes back to the compact string form. Bare JSON numbers are
/// accepted as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeSpan(pub Duration);

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(Duration::ZERO);

    pub fn new(d: Duration) -> Self {
        TimeSpan(d)
    }

    pub fn duration(self) -> Duration {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub const fn from_secs(secs: u64) -> Self {
        TimeSpan(Duration::from_secs(secs))
    }

    pub const fn from_millis(ms: u64) -> Self {
        TimeSpan(Duration::from_millis(ms))
    }
}

impl From<Duration> for TimeSpan {
    fn from(d: Duration) -> Self {
        TimeSpan(d)
    }
}

impl From<TimeSpan> for Duration {
    fn from(ts: TimeSpan) -> Self {
        ts.0
    }
}

impl FromStr for TimeSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".into());
        }
        if s == "0" {
            return Ok(TimeSpan::ZERO);
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("missing unit in duration `{s}`"))?;
            if num_end == 0 {
                return Err(format!("invalid duration `{s}`"));
            }
            let value: f64 = rest[..num_end]
                .parse()
                .map_err(|_| format!("invalid number in duration `{s}`"))?;
            rest = &rest[num_end..];
            let unit_end = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            rest = &rest[unit_end..];
            let scaled = match unit {
                "h" => value * 3600.0,
                "m" => value * 60.0,
                "s" => value,
                "ms" => value / 1000.0,
                other => return Err(format!("unknown duration unit `{other}` in `{s}`")),
            };
            if !scaled.is_finite() || scaled < 0.0 {
                return Err(format!("duration `{s}` is out of range"));
            }
            total += Duration::from_secs_f64(scaled);
        }
        Ok(TimeSpan(total))
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return write!(f, "0s");
        }
        if nanos < 1_000_000_000 && nanos % 1_000_000 == 0 {
            return write!(f, "{}ms", nanos / 1_000_000);
        }
        let mut secs = self.0.as_secs();
        let subsec_ms = self.0.subsec_millis();
        let hours = secs / 3600;
        secs %= 3600;
        let mins = secs / 60;
        secs %= 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if mins > 0 {
            write!(f, "{mins}m")?;
        }
        if subsec_ms > 0 {
            write!(f, "{secs}.{subsec_ms:03}s")
        } else if secs > 0 || (hours == 0 && mins == 0) {
            write!(f, "{secs}s")
        } else {
            Ok(())
        }
    }
}

impl Serialize for TimeSpan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimeSpanVisitor;

        impl Visitor<'_> for TimeSpanVisitor {
            type Value = TimeSpan;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"2s\" or a number of milliseconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TimeSpan, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TimeSpan, E> {
                Ok(TimeSpan(Duration::from_millis(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TimeSpan, E> {
                if v < 0 {
                    return Err(E::custom("durations cannot be negative"));
                }
                Ok(TimeSpan(Duration::from_millis(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<TimeSpan, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("durations cannot be negative"));
                }
                Ok(TimeSpan(Duration::from_secs_f64(v / 1000.0)))
            }
        }

        deserializer.deserialize_any(TimeSpanVisitor)
    }
}

/// A linear ramp segment: hold or move toward `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub duration: Setting<TimeSpan>,
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub target: Setting<i64>,
}

impl Stage {
    pub fn new(duration: TimeSpan, target: i64) -> Self {
        Stage {
            duration: Setting::Value(duration),
            target: Setting::Value(target),
        }
    }
}

/// System-managed sample tags that are attached by default.
pub const DEFAULT_SYSTEM_TAGS: &[&str] = &[
    "proto", "subproto", "status", "method", "url", "name", "group", "check", "error",
    "error_code", "tls_version", "scenario", "vu", "iter",
];

pub fn default_system_tags() -> BTreeSet<String> {
    DEFAULT_SYSTEM_TAGS.iter().map(|t| t.to_string()).collect()
}

/// The user-controllable portion of a run configuration.
///
/// All fields are three-state so the consolidation fold in
/// [`crate::config`] composes them cleanly. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Options {
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub vus: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub duration: Setting<TimeSpan>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub iterations: Setting<i64>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub stages: Setting<Vec<Stage>>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub execution: Setting<ExecutionMap>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub execution_segment: Setting<ExecutionSegment>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub system_tags: Setting<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Setting::is_unset")]
    pub run_tags: Setting<BTreeMap<String, String>>,
}

impl Options {
    /// Right-biased merge with `other`, field by field.
    pub fn apply(mut self, other: Options) -> Options {
        self.vus = self.vus.apply(other.vus);
        self.duration = self.duration.apply(other.duration);
        self.iterations = self.iterations.apply(other.iterations);
        self.stages = self.stages.apply(other.stages);
        self.execution = self.execution.apply(other.execution);
        self.execution_segment = self.execution_segment.apply(other.execution_segment);
        self.system_tags = self.system_tags.apply(other.system_tags);
        self.run_tags = self.run_tags.apply(other.run_tags);
        self
    }

    /// The segment this instance is responsible for; the full `[0,1)` range
    /// when none was configured.
    pub fn segment(&self) -> ExecutionSegment {
        self.execution_segment
            .value()
            .cloned()
            .unwrap_or_else(ExecutionSegment::full)
    }

    pub fn has_system_tag(&self, tag: &str) -> bool {
        self.system_tags
            .value()
            .map(|set| set.contains(tag))
            .unwrap_or(false)
    }

    pub fn run_tags(&self) -> BTreeMap<String, String> {
        self.run_tags.value().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_apply_is_right_biased() {
        let unset: Setting<i64> = Setting::Unset;
        assert_eq!(Setting::Value(10).apply(Setting::Value(20)), Setting::Value(20));
        assert_eq!(Setting::Value(10).apply(Setting::Null), Setting::<i64>::Null);
        assert_eq!(Setting::Value(10).apply(unset), Setting::Value(10));
        assert_eq!(Setting::Null.apply(Setting::Value(7)), Setting::Value(7));
        assert_eq!(unset.apply(unset), unset);
    }

    #[test]
    fn setting_three_state_serde() {
        #[derive(Debug, PartialEq, Serialize, Deserialize, Default)]
        #[serde(default)]
        struct Wrap {
            #[serde(skip_serializing_if = "Setting::is_unset")]
            n: Setting<i64>,
        }

        let missing: Wrap = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.n, Setting::Unset);

        let null: Wrap = serde_json::from_str(r#"{"n":null}"#).unwrap();
        assert_eq!(null.n, Setting::Null);

        let set: Wrap = serde_json::from_str(r#"{"n":5}"#).unwrap();
        assert_eq!(set.n, Setting::Value(5));

        assert_eq!(serde_json::to_string(&missing).unwrap(), "{}");
        assert_eq!(serde_json::to_string(&null).unwrap(), r#"{"n":null}"#);
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"{"n":5}"#);
    }

    #[test]
    fn env_null_overrides_file_value() {
        // File sets vus, env explicitly nulls it, CLI is silent.
        let file = Options {
            vus: Setting::Value(10),
            ..Default::default()
        };
        let env = Options {
            vus: Setting::Null,
            ..Default::default()
        };
        let cli = Options::default();

        let merged = file.apply(env).apply(cli);
        assert_eq!(merged.vus, Setting::Null);
    }

    #[test]
    fn timespan_parses_common_forms() {
        let cases = [
            ("2s", Duration::from_secs(2)),
            ("1m30s", Duration::from_secs(90)),
            ("200ms", Duration::from_millis(200)),
            ("0.5s", Duration::from_millis(500)),
            ("1h", Duration::from_secs(3600)),
            ("1h2m3s", Duration::from_secs(3723)),
            ("0", Duration::ZERO),
        ];
        for (input, expected) in cases {
            let ts: TimeSpan = input.parse().unwrap();
            assert_eq!(ts.duration(), expected, "parsing {input}");
        }
    }

    #[test]
    fn timespan_rejects_garbage() {
        for bad in ["", "10", "s", "10x", "-5s", "1m-2s"] {
            assert!(bad.parse::<TimeSpan>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn timespan_display_round_trips() {
        for input in ["2s", "1m30s", "200ms", "1h2m3s", "0s", "90s"] {
            let ts: TimeSpan = input.parse().unwrap();
            let shown = ts.to_string();
            let back: TimeSpan = shown.parse().unwrap();
            assert_eq!(ts, back, "{input} -> {shown}");
        }
    }

    #[test]
    fn timespan_accepts_millisecond_numbers() {
        let ts: TimeSpan = serde_json::from_str("1500").unwrap();
        assert_eq!(ts.duration(), Duration::from_millis(1500));
    }

    #[test]
    fn options_rejects_unknown_fields() {
        let err = serde_json::from_str::<Options>(r#"{"vus": 5, "bogus": 1}"#).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn options_apply_replaces_stages_wholesale() {
        let a = Options {
            stages: Setting::Value(vec![Stage::new(TimeSpan::from_secs(10), 100)]),
            ..Default::default()
        };
        let b = Options {
            stages: Setting::Value(vec![]),
            ..Default::default()
        };
        // An explicitly-empty stages list still replaces the previous one.
        let merged = a.clone().apply(b);
        assert_eq!(merged.stages, Setting::Value(vec![]));
        // An unset one does not.
        let merged = a.clone().apply(Options::default());
        assert_eq!(merged.stages, a.stages);
    }
}
