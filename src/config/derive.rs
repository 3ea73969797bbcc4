//! Rewriting the `vus`/`iterations`/`duration`/`stages` shortcut options
//! into a canonical execution map with a single synthetic executor.

use tracing::warn;

use super::Config;
use crate::executor::{
    BaseConfig, ConstantVusConfig, ExecutionMap, ExecutorConfig, PerVuIterationsConfig,
    RampingVusConfig, SharedIterationsConfig, DEFAULT_EXECUTOR_NAME,
};
use crate::options::Setting;

/// Turns whichever shortcut options are present into the `"default"`
/// executor, following a fixed precedence: `iterations` beats `duration`
/// beats `stages`. Mixing `iterations` or `duration` with `stages` is
/// deprecated and logs a warning; the rewrite itself is idempotent.
pub fn derive_execution(config: Config) -> Config {
    let mut result = config;
    let options = &result.options;
    let stages_present = options
        .stages
        .value()
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    let derived: Option<ExecutionMap> = if let Some(&iterations) = options.iterations.value() {
        if stages_present {
            warn!("specifying both iterations and stages is deprecated; iterations wins");
        }
        let mut exec_config = SharedIterationsConfig {
            base: BaseConfig::named(DEFAULT_EXECUTOR_NAME),
            vus: options.vus,
            iterations: Setting::Value(iterations),
            max_duration: Setting::Unset,
        };
        if let Some(&duration) = options.duration.value() {
            exec_config.max_duration = Setting::Value(duration);
        }
        Some(ExecutionMap::single(
            DEFAULT_EXECUTOR_NAME,
            ExecutorConfig::SharedIterations(exec_config),
        ))
    } else if let Some(&duration) = options.duration.value() {
        if stages_present {
            warn!("specifying both duration and stages is deprecated; duration wins");
        }
        if duration.is_zero() {
            warn!("an infinite-duration shortcut is deprecated; configure an executor instead");
            None
        } else {
            Some(ExecutionMap::single(
                DEFAULT_EXECUTOR_NAME,
                ExecutorConfig::ConstantVus(ConstantVusConfig {
                    base: BaseConfig::named(DEFAULT_EXECUTOR_NAME),
                    vus: options.vus,
                    duration: Setting::Value(duration),
                }),
            ))
        }
    } else if stages_present {
        let stages = options
            .stages
            .value()
            .map(|stages| {
                stages
                    .iter()
                    .filter(|s| s.duration.value().is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Some(ExecutionMap::single(
            DEFAULT_EXECUTOR_NAME,
            ExecutorConfig::RampingVus(RampingVusConfig {
                base: BaseConfig::named(DEFAULT_EXECUTOR_NAME),
                start_vus: options.vus,
                stages,
                graceful_ramp_down: Setting::Unset,
            }),
        ))
    } else if options
        .execution
        .value()
        .map(|e| e.is_empty())
        .unwrap_or(true)
    {
        // Nothing at all was configured: one VU, one iteration.
        Some(ExecutionMap::single(
            DEFAULT_EXECUTOR_NAME,
            ExecutorConfig::PerVuIterations(PerVuIterationsConfig {
                base: BaseConfig::named(DEFAULT_EXECUTOR_NAME),
                vus: Setting::Unset,
                iterations: Setting::Unset,
                max_duration: Setting::Unset,
            }),
        ))
    } else {
        None
    };

    if let Some(execution) = derived {
        result.options.execution = Setting::Value(execution);
    }
    result
}
