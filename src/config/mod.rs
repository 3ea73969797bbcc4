//! Configuration consolidation.
//!
//! A run configuration is assembled from layered sources, evaluated left
//! to right with the later source winning on any option it actually sets:
//! built-in defaults, the JSON config file, `STAMPEDE_*` environment
//! variables, CLI-provided options, and script-exported options. After
//! the fold, defaults are applied only to unset options whose zero value
//! is not meaningful, the shortcut options are rewritten into a proper
//! execution map, and validation reports *all* problems at once.

mod derive;

pub use derive::derive_execution;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::options::{default_system_tags, Options, Setting, Stage, TimeSpan};

/// Environment variables start with this prefix, followed by the
/// snake-cased option path.
pub const ENV_PREFIX: &str = "STAMPEDE_";

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O error on `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(String),
    #[error("there were problems with the specified configuration:{}", join_errors(.0))]
    Validation(Vec<String>),
    /// Reserved for a future strict mode that refuses mixed shortcut and
    /// execution options instead of warning.
    #[error("conflicting execution options: {0}")]
    ExecutionConflict(String),
}

fn join_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("\n\t- {e}"))
        .collect::<String>()
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// The full top-level configuration: user options plus run toggles and
/// the per-sink collector settings the core carries but never interprets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub options: Options,
    /// Sink specifiers (`influxdb=http://...`); replaced wholesale by any
    /// source that supplies a non-empty list.
    pub out: Vec<String>,
    pub linger: Setting<bool>,
    pub no_thresholds: Setting<bool>,
    pub no_summary: Setting<bool>,
    /// Raw per-sink configuration, forwarded to whatever sink consumes it.
    pub collectors: BTreeMap<String, Value>,
}

impl Config {
    /// Right-biased merge: any option `other` sets replaces this one's.
    pub fn apply(mut self, other: Config) -> Config {
        self.options = self.options.apply(other.options);
        if !other.out.is_empty() {
            self.out = other.out;
        }
        self.linger = self.linger.apply(other.linger);
        self.no_thresholds = self.no_thresholds.apply(other.no_thresholds);
        self.no_summary = self.no_summary.apply(other.no_summary);
        for (sink, value) in other.collectors {
            self.collectors.insert(sink, value);
        }
        self
    }

    /// Serializes the configuration as pretty JSON at `path`, creating
    /// parent directories as needed.
    pub fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn take_setting<T: DeserializeOwned>(
    map: &mut Map<String, Value>,
    key: &str,
) -> Result<Setting<T>, serde_json::Error> {
    Ok(match map.remove(key) {
        None => Setting::Unset,
        Some(Value::Null) => Setting::Null,
        Some(value) => Setting::Value(T::deserialize(value)?),
    })
}

impl Serialize for Config {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let options =
            serde_json::to_value(&self.options).map_err(S::Error::custom)?;
        let Value::Object(mut map) = options else {
            return Err(S::Error::custom("options did not serialize to an object"));
        };
        if !self.out.is_empty() {
            map.insert(
                "out".to_string(),
                serde_json::to_value(&self.out).map_err(S::Error::custom)?,
            );
        }
        for (key, setting) in [
            ("linger", &self.linger),
            ("noThresholds", &self.no_thresholds),
            ("noSummary", &self.no_summary),
        ] {
            match setting {
                Setting::Unset => {}
                Setting::Null => {
                    map.insert(key.to_string(), Value::Null);
                }
                Setting::Value(v) => {
                    map.insert(key.to_string(), Value::Bool(*v));
                }
            }
        }
        if !self.collectors.is_empty() {
            map.insert(
                "collectors".to_string(),
                Value::Object(self.collectors.clone().into_iter().collect()),
            );
        }
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = Map::<String, Value>::deserialize(deserializer)?;
        let out = match map.remove("out") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => Vec::<String>::deserialize(value).map_err(de::Error::custom)?,
        };
        let linger = take_setting(&mut map, "linger").map_err(de::Error::custom)?;
        let no_thresholds =
            take_setting(&mut map, "noThresholds").map_err(de::Error::custom)?;
        let no_summary = take_setting(&mut map, "noSummary").map_err(de::Error::custom)?;
        let collectors = match map.remove("collectors") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(sinks)) => sinks.into_iter().collect(),
            Some(_) => {
                return Err(de::Error::custom("`collectors` must be an object"));
            }
        };
        // Everything left is user options; unknown keys are rejected there.
        let options =
            Options::deserialize(Value::Object(map)).map_err(de::Error::custom)?;
        Ok(Config {
            options,
            out,
            linger,
            no_thresholds,
            no_summary,
            collectors,
        })
    }
}

/// One layer of the consolidation fold.
pub trait ConfigSource {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// A literal config is its own source (CLI- and script-provided layers).
impl ConfigSource for Config {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.clone())
    }
}

/// The JSON config file layer.
///
/// With an explicit path, any read failure is an error. With the default
/// location, a missing file is silently an empty layer.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    path: Option<PathBuf>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSource {
            path: Some(path.into()),
        }
    }

    /// The per-user default config location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stampede")
            .join(CONFIG_FILE_NAME)
    }

    fn resolved(&self) -> (PathBuf, bool) {
        match &self.path {
            Some(path) => (path.clone(), true),
            None => (Self::default_path(), false),
        }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Config, ConfigError> {
        let (path, explicit) = self.resolved();
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {
                return Ok(Config::default());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        serde_json::from_str(&data).map_err(ConfigError::from)
    }
}

/// The `STAMPEDE_*` environment layer.
///
/// Keys are the snake-cased option paths. An empty value is the
/// environment's way of writing an explicit `null`.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: Vec<(String, String)>,
}

impl EnvSource {
    pub fn from_os() -> Self {
        EnvSource {
            vars: std::env::vars().collect(),
        }
    }

    pub fn new<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        EnvSource {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn env_setting<T, F>(key: &str, value: &str, parse: F) -> Result<Setting<T>, ConfigError>
where
    F: FnOnce(&str) -> Result<T, String>,
{
    if value.is_empty() {
        return Ok(Setting::Null);
    }
    parse(value)
        .map(Setting::Value)
        .map_err(|reason| ConfigError::Parse(format!("invalid `{key}`: {reason}")))
}

fn parse_env_bool(s: &str) -> Result<bool, String> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("`{other}` is not a boolean")),
    }
}

fn parse_env_stages(s: &str) -> Result<Vec<Stage>, String> {
    s.split(',')
        .map(|part| {
            let (duration, target) = part
                .split_once(':')
                .ok_or_else(|| format!("stage `{part}` is not `duration:target`"))?;
            let duration: TimeSpan = duration.trim().parse()?;
            let target: i64 = target
                .trim()
                .parse()
                .map_err(|_| format!("stage target `{target}` is not an integer"))?;
            Ok(Stage::new(duration, target))
        })
        .collect()
}

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        for (key, value) in &self.vars {
            let Some(option) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match option {
                "VUS" => {
                    config.options.vus = env_setting(key, value, |s| {
                        s.parse().map_err(|_| format!("`{s}` is not an integer"))
                    })?;
                }
                "ITERATIONS" => {
                    config.options.iterations = env_setting(key, value, |s| {
                        s.parse().map_err(|_| format!("`{s}` is not an integer"))
                    })?;
                }
                "DURATION" => {
                    config.options.duration =
                        env_setting(key, value, |s| s.parse::<TimeSpan>())?;
                }
                "STAGES" => {
                    config.options.stages = env_setting(key, value, parse_env_stages)?;
                }
                "EXECUTION_SEGMENT" => {
                    config.options.execution_segment = env_setting(key, value, |s| {
                        s.parse().map_err(|e| format!("{e}"))
                    })?;
                }
                "SYSTEM_TAGS" => {
                    config.options.system_tags = env_setting(key, value, |s| {
                        Ok(s.split(',').map(|t| t.trim().to_string()).collect())
                    })?;
                }
                "OUT" => {
                    if !value.is_empty() {
                        config.out =
                            value.split(',').map(|o| o.trim().to_string()).collect();
                    }
                }
                "LINGER" => {
                    config.linger = env_setting(key, value, parse_env_bool)?;
                }
                "NO_THRESHOLDS" => {
                    config.no_thresholds = env_setting(key, value, parse_env_bool)?;
                }
                "NO_SUMMARY" => {
                    config.no_summary = env_setting(key, value, parse_env_bool)?;
                }
                // Other prefixed variables belong to the sinks.
                _ => {}
            }
        }
        Ok(config)
    }
}

/// Folds the sources left to right, then fills gap defaults.
pub fn consolidate(sources: &[&dyn ConfigSource]) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    for source in sources {
        config = config.apply(source.load()?);
    }
    Ok(apply_defaults(config))
}

/// Defaults for options whose zero value is meaningful enough that the
/// merge cannot distinguish "unset" from "deliberately empty".
fn apply_defaults(mut config: Config) -> Config {
    if config.options.system_tags.is_unset() {
        config.options.system_tags = Setting::Value(default_system_tags());
    }
    config
}

/// Collects every validation problem; never reports just the first.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    if let Some(vus) = config.options.vus.value() {
        if *vus < 0 {
            errors.push("the number of VUs cannot be negative".to_string());
        }
    }
    if let Some(iterations) = config.options.iterations.value() {
        if *iterations < 0 {
            errors.push("the number of iterations cannot be negative".to_string());
        }
    }
    if let Some(stages) = config.options.stages.value() {
        for (i, stage) in stages.iter().enumerate() {
            if let Some(target) = stage.target.value() {
                if *target < 0 {
                    errors.push(format!("stage {i} has a negative target"));
                }
            }
        }
    }
    if let Some(execution) = config.options.execution.value() {
        for exec_config in execution.configs() {
            errors.extend(exec_config.validate());
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors))
    }
}

/// The post-consolidation pipeline: rewrite shortcuts into the execution
/// map, then validate everything at once.
pub fn derive_and_validate(config: Config) -> Result<Config, ConfigError> {
    let config = derive_execution(config);
    validate(&config)?;
    Ok(config)
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unserializable config>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DEFAULT_EXECUTOR_NAME;

    #[test]
    fn consolidation_is_a_right_biased_fold() {
        let file = Config {
            options: Options {
                vus: Setting::Value(10),
                duration: Setting::Value(TimeSpan::from_secs(30)),
                ..Default::default()
            },
            ..Default::default()
        };
        let env = Config {
            options: Options {
                vus: Setting::Value(20),
                ..Default::default()
            },
            out: vec!["influxdb=http://localhost:8086".to_string()],
            ..Default::default()
        };
        let cli = Config {
            linger: Setting::Value(true),
            ..Default::default()
        };

        let sources: Vec<&dyn ConfigSource> = vec![&file, &env, &cli];
        let merged = consolidate(&sources).unwrap();
        assert_eq!(merged.options.vus, Setting::Value(20));
        assert_eq!(
            merged.options.duration,
            Setting::Value(TimeSpan::from_secs(30))
        );
        assert_eq!(merged.out, vec!["influxdb=http://localhost:8086"]);
        assert_eq!(merged.linger, Setting::Value(true));
        // The gap default kicked in.
        assert!(merged.options.system_tags.value().is_some());
    }

    #[test]
    fn explicit_env_null_beats_file_value() {
        let file = Config {
            options: Options {
                vus: Setting::Value(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let env = EnvSource::new([("STAMPEDE_VUS", "")]);
        let cli = Config::default();

        let sources: Vec<&dyn ConfigSource> = vec![&file, &env, &cli];
        let merged = consolidate(&sources).unwrap();
        assert_eq!(merged.options.vus, Setting::Null);
    }

    #[test]
    fn env_source_parses_each_option_shape() {
        let env = EnvSource::new([
            ("STAMPEDE_VUS", "12"),
            ("STAMPEDE_DURATION", "90s"),
            ("STAMPEDE_STAGES", "10s:5,1m:50"),
            ("STAMPEDE_EXECUTION_SEGMENT", "0:1/2"),
            ("STAMPEDE_SYSTEM_TAGS", "url,status"),
            ("STAMPEDE_OUT", "json,influxdb=http://x"),
            ("STAMPEDE_NO_SUMMARY", "true"),
            ("HOME", "/root"),
        ]);
        let config = env.load().unwrap();
        assert_eq!(config.options.vus, Setting::Value(12));
        assert_eq!(
            config.options.duration,
            Setting::Value(TimeSpan::from_secs(90))
        );
        let stages = config.options.stages.value().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].target, Setting::Value(50));
        assert_eq!(config.out.len(), 2);
        assert_eq!(config.no_summary, Setting::Value(true));
    }

    #[test]
    fn env_source_rejects_garbage() {
        let env = EnvSource::new([("STAMPEDE_VUS", "lots")]);
        assert!(matches!(env.load(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_source_distinguishes_default_and_explicit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = FileSource::new(&missing).load().unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        // The default location missing is just an empty layer.
        let config = FileSource::default().load();
        assert!(config.is_ok() || matches!(config, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_source_reads_and_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"vus": 7, "noSummary": true, "collectors": {"influxdb": {"addr": "http://x"}}}"#,
        )
        .unwrap();
        let config = FileSource::new(&path).load().unwrap();
        assert_eq!(config.options.vus, Setting::Value(7));
        assert_eq!(config.no_summary, Setting::Value(true));
        assert!(config.collectors.contains_key("influxdb"));

        std::fs::write(&path, r#"{"vuss": 7}"#).unwrap();
        assert!(matches!(
            FileSource::new(&path).load(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn config_json_round_trips() {
        let config = Config {
            options: Options {
                vus: Setting::Value(3),
                duration: Setting::Value(TimeSpan::from_secs(10)),
                ..Default::default()
            },
            out: vec!["csv=out.csv".to_string()],
            linger: Setting::Null,
            no_summary: Setting::Value(false),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn write_to_disk_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            options: Options {
                vus: Setting::Value(4),
                ..Default::default()
            },
            ..Default::default()
        };
        config.write_to_disk(&path).unwrap();
        let back = FileSource::new(&path).load().unwrap();
        assert_eq!(back.options.vus, Setting::Value(4));
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = Config {
            options: Options {
                vus: Setting::Value(-1),
                iterations: Setting::Value(-5),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = validate(&config).unwrap_err();
        let ConfigError::Validation(errors) = &err else {
            panic!("expected a validation error, got {err}");
        };
        assert_eq!(errors.len(), 2);
        let shown = err.to_string();
        assert!(shown.contains("VUs"));
        assert!(shown.contains("iterations"));
    }

    #[test]
    fn derive_and_validate_produces_a_runnable_default() {
        let config = derive_and_validate(Config::default()).unwrap();
        let execution = config.options.execution.value().unwrap();
        assert_eq!(execution.len(), 1);
        assert!(execution.get(DEFAULT_EXECUTOR_NAME).is_some());
    }
}
