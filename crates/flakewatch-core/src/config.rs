use crate::classify::ClassificationRule;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for scoring, pattern detection and the default query windows.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Run count at which the flakiness score stops being discounted.
    pub confidence_runs: u32,
    /// Histories with fewer runs are never reported as flaky.
    pub min_runs: u32,
    pub flakiness_threshold: f64,
    /// Fraction of status changes above which a history is "alternating".
    pub alternating_ratio: f64,
    /// Spread of per-environment failure rates above which failures are
    /// "environment specific".
    pub environment_spread: f64,
    /// Consecutive failures above this add a recommendation line.
    pub consecutive_failure_hint: u32,
    pub flaky_window_days: u32,
    pub health_window_days: u32,
    pub classification_rule: ClassificationRule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_runs: 10,
            min_runs: 3,
            flakiness_threshold: 0.2,
            alternating_ratio: 0.6,
            environment_spread: 0.5,
            consecutive_failure_hint: 4,
            flaky_window_days: 30,
            health_window_days: 7,
            classification_rule: ClassificationRule::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.confidence_runs == 0 {
            return Err(ConfigError("confidence_runs must be at least 1".into()));
        }
        for (name, value) in [
            ("flakiness_threshold", self.flakiness_threshold),
            ("alternating_ratio", self.alternating_ratio),
            ("environment_spread", self.environment_spread),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.flaky_window_days == 0 || self.health_window_days == 0 {
            return Err(ConfigError("window days must be at least 1".into()));
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str, strict: bool) -> Result<EngineConfig, ConfigError> {
    let mut ignored_keys = std::collections::BTreeSet::new();

    let cfg: EngineConfig = if raw.trim().is_empty() {
        EngineConfig::default()
    } else {
        let deserializer = serde_yaml::Deserializer::from_str(raw);
        serde_ignored::deserialize(deserializer, |path| {
            ignored_keys.insert(path.to_string());
        })
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?
    };

    let meaningful: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();

    if !meaningful.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?}",
                meaningful
            )));
        }
        tracing::warn!(
            event = "flakewatch.config.unknown_fields",
            fields = ?meaningful,
            "ignored unknown config fields"
        );
    }

    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path, strict: bool) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    parse_config(&raw, strict)
        .map_err(|e| ConfigError(format!("{} (file: {})", e.0, path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = parse_config("", true).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.confidence_runs, 10);
        assert_eq!(cfg.min_runs, 3);
        assert_eq!(cfg.flakiness_threshold, 0.2);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let cfg = parse_config(
            "min_runs: 5\nclassification_rule: last_status_wins\n",
            true,
        )
        .unwrap();
        assert_eq!(cfg.min_runs, 5);
        assert_eq!(cfg.classification_rule, ClassificationRule::LastStatusWins);
        assert_eq!(cfg.alternating_ratio, 0.6);
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = parse_config("min_runs: 3\nflaky_treshold: 0.3\n", true).unwrap_err();
        assert!(err.to_string().contains("flaky_treshold"), "{}", err);

        let cfg = parse_config("min_runs: 3\nflaky_treshold: 0.3\n", false).unwrap();
        assert_eq!(cfg.min_runs, 3);
    }

    #[test]
    fn extension_keys_are_tolerated_in_strict_mode() {
        assert!(parse_config("x-owner: qa\nmin_runs: 4\n", true).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(parse_config("confidence_runs: 0\n", false).is_err());
        assert!(parse_config("flakiness_threshold: 1.5\n", false).is_err());
        assert!(parse_config("health_window_days: 0\n", false).is_err());
    }

    #[test]
    fn load_config_reports_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "min_runs: [").unwrap();
        let err = load_config(f.path(), false).unwrap_err();
        assert!(err.to_string().starts_with("ConfigError: failed to parse YAML"));
    }
}
