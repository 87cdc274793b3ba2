//! Key/value configuration, the way generic frontends drive the device.

use crate::error::Result;
use crate::protocol::{ClockSource, SAMPLE_RATES};
use crate::session::DeviceSession;
use crate::transport::Transport;
use crate::trigger_config::TRIGGER_TYPES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    LogicAnalyzer,
    SampleRate,
    LimitSamples,
    ExternalClock,
    TriggerType,
    DeviceOptions,
}

/// Capabilities advertised through [`ConfigKey::DeviceOptions`].
pub const DEVICE_OPTIONS: [ConfigKey; 5] = [
    ConfigKey::LogicAnalyzer,
    ConfigKey::SampleRate,
    ConfigKey::ExternalClock,
    ConfigKey::TriggerType,
    ConfigKey::LimitSamples,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    U64(u64),
    Bool(bool),
    Str(&'static str),
    SampleRates(&'static [u64]),
    Keys(&'static [ConfigKey]),
}

impl ConfigValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::U64(_) => "u64",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Str(_) => "string",
            ConfigValue::SampleRates(_) => "sample rate list",
            ConfigValue::Keys(_) => "key list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Key {0:?} is not applicable")]
    NotApplicable(ConfigKey),

    #[error("Key {key:?} expects a {expected} value, got {actual}")]
    TypeMismatch {
        key: ConfigKey,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Lists the possible values of a key. Needs no device.
pub fn config_list(key: ConfigKey) -> std::result::Result<ConfigValue, ConfigError> {
    match key {
        ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(&DEVICE_OPTIONS)),
        ConfigKey::SampleRate => Ok(ConfigValue::SampleRates(&SAMPLE_RATES)),
        ConfigKey::TriggerType => Ok(ConfigValue::Str(TRIGGER_TYPES)),
        other => Err(ConfigError::NotApplicable(other)),
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn config_get(&self, key: ConfigKey) -> std::result::Result<ConfigValue, ConfigError> {
        match key {
            ConfigKey::SampleRate => Ok(ConfigValue::U64(self.sample_rate().unwrap_or(0))),
            ConfigKey::LimitSamples => Ok(ConfigValue::U64(self.sample_limit())),
            ConfigKey::ExternalClock => Ok(ConfigValue::Bool(self.clock_source().is_external())),
            other => Err(ConfigError::NotApplicable(other)),
        }
    }

    pub fn config_set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<()> {
        match (key, value) {
            (ConfigKey::SampleRate, ConfigValue::U64(rate)) => self.set_sample_rate(rate),
            (ConfigKey::LimitSamples, ConfigValue::U64(limit)) => {
                self.set_sample_limit(limit);
                Ok(())
            }
            (ConfigKey::ExternalClock, ConfigValue::Bool(external)) => {
                if external {
                    log::info!("Enabling external clock.");
                    // The key is a plain bool, so it can only select the rising edge.
                    self.set_clock_source(ClockSource::ExternalRisingEdge)
                } else {
                    log::info!("Disabling external clock.");
                    self.set_clock_source(ClockSource::Internal)
                }
            }
            (key @ (ConfigKey::SampleRate | ConfigKey::LimitSamples), value) => {
                Err(ConfigError::TypeMismatch {
                    key,
                    expected: "u64",
                    actual: value.type_name(),
                }
                .into())
            }
            (ConfigKey::ExternalClock, value) => Err(ConfigError::TypeMismatch {
                key,
                expected: "bool",
                actual: value.type_name(),
            }
            .into()),
            (other, _) => Err(ConfigError::NotApplicable(other).into()),
        }
    }
}
