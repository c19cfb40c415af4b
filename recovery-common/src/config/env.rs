//! `VLLM_RECOVERY_*` overrides.
//!
//! Every option in the config file can be overridden from the environment.
//! Bad values do not abort parsing: the parser keeps the fallback, records
//! an [`EnvError`] and moves on, so a misconfigured unit reports all of its
//! problems in a single startup failure.

use super::source::Sourced;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every recognised environment variable.
pub const ENV_PREFIX: &str = "VLLM_RECOVERY_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Invalid duration for {var}: '{value}' is not a whole number of seconds")]
    SubSecondDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value} (expected one of: {})", LOG_LEVELS.join(", "))]
    InvalidLogLevel { var: String, value: String },
}

/// Reads prefixed variables and collects the errors it meets.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Look up `ENV_PREFIX + name`, returning the full variable name and its value.
    fn lookup(name: &str) -> Option<(String, String)> {
        let var = format!("{ENV_PREFIX}{name}");
        std::env::var(&var).ok().map(|value| (var, value))
    }

    /// Parse a set variable with `parse`; unset or invalid yields `fallback`.
    fn parse<T>(
        &mut self,
        name: &str,
        fallback: T,
        parse: impl FnOnce(&str, String) -> Result<T, EnvError>,
    ) -> Sourced<T> {
        let Some((var, raw)) = Self::lookup(name) else {
            return Sourced::default_value(fallback);
        };
        match parse(&var, raw) {
            Ok(value) => Sourced::from_env(value, var),
            Err(e) => {
                self.errors.push(e);
                Sourced::default_value(fallback)
            }
        }
    }

    pub fn get_string(&mut self, name: &str, fallback: &str) -> Sourced<String> {
        self.parse(name, fallback.to_string(), |_, raw| Ok(raw))
    }

    /// Unset keeps the fallback; set but empty clears the option.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        self.parse(name, None, |_, raw| Ok(Some(raw).filter(|v| !v.is_empty())))
    }

    /// Comma-separated; blank entries are dropped.
    pub fn get_string_list(&mut self, name: &str, fallback: Vec<String>) -> Sourced<Vec<String>> {
        self.parse(name, fallback, |_, raw| {
            Ok(raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect())
        })
    }

    pub fn get_path(&mut self, name: &str, fallback: &str) -> Sourced<PathBuf> {
        self.parse(name, expand_home(fallback), |_, raw| Ok(expand_home(&raw)))
    }

    /// `1/true/yes/on` and `0/false/no/off/""`, case-insensitive.
    pub fn get_bool(&mut self, name: &str, fallback: bool) -> Sourced<bool> {
        self.parse(name, fallback, |var, raw| {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" | "" => Ok(false),
                _ => Err(EnvError::InvalidValue {
                    var: var.to_string(),
                    expected: "boolean (true/false/1/0/yes/no)",
                    value: raw,
                }),
            }
        })
    }

    pub fn get_u32_range(&mut self, name: &str, fallback: u32, min: u32, max: u32) -> Sourced<u32> {
        self.parse(name, fallback, |var, raw| {
            let n = raw.trim().parse::<u32>().map_err(|_| EnvError::InvalidValue {
                var: var.to_string(),
                expected: "unsigned 32-bit integer",
                value: raw.clone(),
            })?;
            in_range(var, n, min, max)
        })
    }

    pub fn get_f64_range(&mut self, name: &str, fallback: f64, min: f64, max: f64) -> Sourced<f64> {
        self.parse(name, fallback, |var, raw| {
            let n = raw.trim().parse::<f64>().map_err(|_| EnvError::InvalidValue {
                var: var.to_string(),
                expected: "floating-point number",
                value: raw.clone(),
            })?;
            in_range(var, n, min, max)
        })
    }

    /// Humantime (`30s`, `5m`, `1h 30m`) or bare seconds, as whole seconds.
    ///
    /// Settings are stored in seconds, so `500ms` or `1500ms` is rejected
    /// rather than truncated.
    pub fn get_duration_secs(&mut self, name: &str, fallback: u64) -> Sourced<u64> {
        self.parse(name, fallback, |var, raw| {
            let Some(duration) = parse_duration(&raw) else {
                return Err(EnvError::InvalidDuration {
                    var: var.to_string(),
                    value: raw,
                });
            };
            if duration.subsec_nanos() != 0 {
                return Err(EnvError::SubSecondDuration {
                    var: var.to_string(),
                    value: raw,
                });
            }
            Ok(duration.as_secs())
        })
    }

    /// One of the `tracing` level names, normalized to lowercase.
    pub fn get_log_level(&mut self, name: &str, fallback: &str) -> Sourced<String> {
        self.parse(name, fallback.to_string(), |var, raw| {
            let level = raw.trim().to_ascii_lowercase();
            if LOG_LEVELS.contains(&level.as_str()) {
                Ok(level)
            } else {
                Err(EnvError::InvalidLogLevel {
                    var: var.to_string(),
                    value: raw,
                })
            }
        })
    }
}

fn in_range<T>(var: &str, n: T, min: T, max: T) -> Result<T, EnvError>
where
    T: PartialOrd + ToString,
{
    if n < min || n > max {
        return Err(EnvError::OutOfRange {
            var: var.to_string(),
            value: n.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(n)
}

/// Parse `30`, `30s`, `5m`, `1h 30m`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(trimmed).ok(),
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).into_owned())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Run `check` with `VLLM_RECOVERY_<name>` set to `value`, then unset it.
    fn with_var(name: &str, value: &str, check: impl FnOnce(&mut EnvParser)) {
        let var = format!("{ENV_PREFIX}{name}");
        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::set_var(&var, value) };
        let mut parser = EnvParser::new();
        check(&mut parser);
        // SAFETY: as above
        unsafe { std::env::remove_var(&var) };
    }

    #[test]
    #[serial]
    fn bool_spellings() {
        for raw in ["1", "true", "YES", "On"] {
            with_var("T_BOOL", raw, |p| {
                assert!(p.get_bool("T_BOOL", false).value, "{raw}");
                assert!(!p.has_errors());
            });
        }
        for raw in ["0", "false", "No", "off", ""] {
            with_var("T_BOOL", raw, |p| assert!(!p.get_bool("T_BOOL", true).value, "{raw}"));
        }
    }

    #[test]
    #[serial]
    fn bad_bool_keeps_fallback_and_records_error() {
        with_var("T_BOOL", "maybe", |p| {
            let got = p.get_bool("T_BOOL", true);
            assert!(got.value);
            assert!(!got.is_from_env());
            assert!(matches!(p.errors(), [EnvError::InvalidValue { .. }]));
        });
    }

    #[test]
    #[serial]
    fn unset_variable_is_default_source() {
        let mut parser = EnvParser::new();
        let got = parser.get_u32_range("T_NEVER_SET", 3, 1, 10);
        assert_eq!(got.value, 3);
        assert!(got.var.is_none());
    }

    #[test]
    #[serial]
    fn max_attempts_range_is_enforced() {
        with_var("T_ATTEMPTS", " 5 ", |p| {
            let got = p.get_u32_range("T_ATTEMPTS", 3, 1, 100);
            assert_eq!(got.value, 5);
            assert_eq!(got.var.as_deref(), Some("VLLM_RECOVERY_T_ATTEMPTS"));
        });
        with_var("T_ATTEMPTS", "0", |p| {
            assert_eq!(p.get_u32_range("T_ATTEMPTS", 3, 1, 100).value, 3);
            assert!(matches!(p.errors(), [EnvError::OutOfRange { .. }]));
        });
    }

    #[test]
    #[serial]
    fn memory_floor_must_be_numeric() {
        with_var("T_FLOOR", "lots", |p| {
            assert_eq!(p.get_f64_range("T_FLOOR", 0.5, 0.05, 1.0).value, 0.5);
            assert!(matches!(p.errors(), [EnvError::InvalidValue { .. }]));
        });
    }

    #[test]
    #[serial]
    fn durations_accept_humantime_and_seconds() {
        for (raw, secs) in [("45", 45), ("2m", 120), ("1h 30m", 5400), ("90s", 90), ("2000ms", 2)] {
            with_var("T_INTERVAL", raw, |p| {
                assert_eq!(p.get_duration_secs("T_INTERVAL", 1).value, secs, "{raw}");
            });
        }
        with_var("T_INTERVAL", "eventually", |p| {
            assert_eq!(p.get_duration_secs("T_INTERVAL", 7).value, 7);
            assert_eq!(p.take_errors().len(), 1);
            assert!(!p.has_errors());
        });
    }

    #[test]
    #[serial]
    fn sub_second_durations_are_rejected_not_truncated() {
        for raw in ["500ms", "1500ms", "1s 250ms"] {
            with_var("T_TIMEOUT", raw, |p| {
                let got = p.get_duration_secs("T_TIMEOUT", 10);
                assert_eq!(got.value, 10, "{raw}");
                assert!(!got.is_from_env());
                assert!(matches!(p.errors(), [EnvError::SubSecondDuration { .. }]), "{raw}");
                assert!(p.errors()[0].to_string().contains("whole number of seconds"));
            });
        }
    }

    #[test]
    #[serial]
    fn recipient_list_trims_and_skips_blanks() {
        with_var("T_RECIPIENTS", "ops@example.com, ,oncall@example.com ", |p| {
            let got = p.get_string_list("T_RECIPIENTS", Vec::new());
            assert_eq!(got.value, vec!["ops@example.com", "oncall@example.com"]);
        });
    }

    #[test]
    #[serial]
    fn empty_optional_string_clears_the_option() {
        with_var("T_WEBHOOK", "", |p| {
            let got = p.get_optional_string("T_WEBHOOK");
            assert!(got.value.is_none());
            assert!(got.is_from_env());
        });
    }

    #[test]
    #[serial]
    fn log_level_is_validated() {
        with_var("T_LEVEL", "DEBUG", |p| assert_eq!(p.get_log_level("T_LEVEL", "info").value, "debug"));
        with_var("T_LEVEL", "chatty", |p| {
            assert_eq!(p.get_log_level("T_LEVEL", "info").value, "info");
            assert!(p.errors()[0].to_string().contains("chatty"));
        });
    }

    #[test]
    fn home_expansion_only_touches_tilde_prefix() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/state.json"), home.join("state.json"));
            assert_eq!(expand_home("~"), home);
        }
        assert_eq!(expand_home("/var/lib/x"), PathBuf::from("/var/lib/x"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
    }

    #[test]
    fn blank_and_negative_durations_are_rejected() {
        assert!(parse_duration("  ").is_none());
        assert!(parse_duration("-5").is_none());
    }
}
