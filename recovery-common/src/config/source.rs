//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default or the config file.
    Default,
    /// Overridden by an environment variable.
    Environment,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Default => "default",
            Self::Environment => "env",
        };
        write!(f, "{value}")
    }
}

/// A value paired with its source and, for environment values, the variable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    pub var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var: None,
        }
    }

    pub fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var: Some(var),
        }
    }

    pub fn is_from_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }

    /// Transform the value while keeping its provenance.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            var: self.var,
        }
    }

    /// Apply the value to `target` only when it came from the environment.
    pub fn apply_to(self, target: &mut T, field: &'static str, sources: &mut Vec<ConfigValueSource>) {
        if self.source != ConfigSource::Environment {
            return;
        }
        *target = self.value;
        sources.push(ConfigValueSource {
            field,
            source: ConfigSource::Environment,
            detail: self.var,
        });
    }
}

/// Record of an overridden field for `recovery config` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValueSource {
    pub field: &'static str,
    pub source: ConfigSource,
    pub detail: Option<String>,
}
