//! Worker configuration loaded from the environment.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Runtime settings for the worker service.
///
/// Environment variables:
/// - `WORKER_CONCURRENCY`: number of concurrent conversions (default: CPU count)
/// - `VTRACER_BIN`: trace with this vtracer executable instead of the
///   built-in library
/// - `LOG_FORMAT`: `json` for JSON log lines, plain text otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub vtracer_bin: Option<PathBuf>,
    pub json_logs: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            vtracer_bin: None,
            json_logs: false,
        }
    }
}

impl WorkerConfig {
    /// Loads the config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `WORKER_CONCURRENCY` is set but not a number
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("WORKER_CONCURRENCY") {
            let concurrency: usize = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid WORKER_CONCURRENCY: {:?}", value))?;
            config.concurrency = concurrency.max(1);
        }
        if let Some(bin) = lookup("VTRACER_BIN").filter(|v| !v.trim().is_empty()) {
            config.vtracer_bin = Some(PathBuf::from(bin));
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.json_logs = format.trim().eq_ignore_ascii_case("json");
        }

        Ok(config)
    }
}

/// One worker per available CPU, never fewer than one.
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.vtracer_bin, None);
        assert!(config.concurrency >= 1);
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_CONCURRENCY", "3"),
            ("VTRACER_BIN", "/opt/vtracer/bin/vtracer"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 3);
        assert_eq!(
            config.vtracer_bin,
            Some(PathBuf::from("/opt/vtracer/bin/vtracer"))
        );
        assert!(config.json_logs);
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let config = WorkerConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_invalid_concurrency() {
        let result = WorkerConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "many")]));
        assert!(result.is_err());
    }
}
