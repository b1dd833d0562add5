use chrono::FixedOffset;
use rollcall_core::enrollment::EnrollmentSettings;
use rollcall_core::pose::PoseThresholds;
use rollcall_core::scan::ScanTiming;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("utc offset of {0} minutes is out of range")]
    Offset(i32),
    #[error("extractor timeout ({extractor_ms} ms) must be shorter than the request timeout ({request_ms} ms)")]
    Timeouts { extractor_ms: u64, request_ms: u64 },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `ROLLCALL_CONFIG` (if
/// set), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding captured evidence images.
    pub evidence_dir: PathBuf,
    /// Base URL of the descriptor extraction service.
    pub extractor_url: String,
    pub extractor_timeout_secs: u64,
    /// Euclidean distance below which a probe matches.
    pub match_threshold: f32,
    /// Minimum spacing between accepted enrollment captures.
    pub enroll_cooldown_ms: u64,
    pub center_tolerance_deg: f32,
    pub turn_threshold_deg: f32,
    pub settle_cooldown_ms: u64,
    pub failure_reset_ms: u64,
    pub request_timeout_ms: u64,
    /// Offset east of UTC whose midnight starts each attendance day.
    pub utc_offset_minutes: i32,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let enrollment = EnrollmentSettings::default();
        let timing = ScanTiming::default();
        Self {
            db_path: data_dir.join("attendance.db"),
            evidence_dir: data_dir.join("evidence"),
            extractor_url: "http://127.0.0.1:8400".to_string(),
            extractor_timeout_secs: 5,
            match_threshold: rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD,
            enroll_cooldown_ms: enrollment.cooldown.as_millis() as u64,
            center_tolerance_deg: enrollment.thresholds.center_tolerance,
            turn_threshold_deg: enrollment.thresholds.turn_threshold,
            settle_cooldown_ms: timing.settle_cooldown.as_millis() as u64,
            failure_reset_ms: timing.failure_reset.as_millis() as u64,
            request_timeout_ms: timing.request_timeout.as_millis() as u64,
            utc_offset_minutes: 0,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.utc_offset()?;
        let extractor_ms = self.extractor_timeout_secs.saturating_mul(1000);
        if extractor_ms >= self.request_timeout_ms {
            return Err(ConfigError::Timeouts {
                extractor_ms,
                request_ms: self.request_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_EVIDENCE_DIR") {
            self.evidence_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_EXTRACTOR_URL") {
            self.extractor_url = v;
        }
        override_parsed(&lookup, "ROLLCALL_EXTRACTOR_TIMEOUT_SECS", &mut self.extractor_timeout_secs);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_ENROLL_COOLDOWN_MS", &mut self.enroll_cooldown_ms);
        override_parsed(&lookup, "ROLLCALL_CENTER_TOLERANCE_DEG", &mut self.center_tolerance_deg);
        override_parsed(&lookup, "ROLLCALL_TURN_THRESHOLD_DEG", &mut self.turn_threshold_deg);
        override_parsed(&lookup, "ROLLCALL_SETTLE_COOLDOWN_MS", &mut self.settle_cooldown_ms);
        override_parsed(&lookup, "ROLLCALL_FAILURE_RESET_MS", &mut self.failure_reset_ms);
        override_parsed(&lookup, "ROLLCALL_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_parsed(&lookup, "ROLLCALL_UTC_OFFSET_MINUTES", &mut self.utc_offset_minutes);
        match lookup("ROLLCALL_BUS").as_deref() {
            Some("system") => self.bus = BusKind::System,
            Some("session") => self.bus = BusKind::Session,
            _ => {}
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .ok_or(ConfigError::Offset(self.utc_offset_minutes))
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout_secs)
    }

    pub fn enrollment_settings(&self) -> EnrollmentSettings {
        EnrollmentSettings {
            cooldown: Duration::from_millis(self.enroll_cooldown_ms),
            thresholds: PoseThresholds {
                center_tolerance: self.center_tolerance_deg,
                turn_threshold: self.turn_threshold_deg,
            },
        }
    }

    pub fn scan_timing(&self) -> ScanTiming {
        ScanTiming {
            settle_cooldown: Duration::from_millis(self.settle_cooldown_ms),
            failure_reset: Duration::from_millis(self.failure_reset_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = lookup(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_core_constants() {
        let config = Config::default();
        assert_eq!(config.enroll_cooldown_ms, 800);
        assert_eq!(config.settle_cooldown_ms, 3000);
        assert_eq!(config.failure_reset_ms, 1500);
        assert_eq!(config.request_timeout_ms, 8000);
        assert!((config.match_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            extractor_url = "http://faces.local:9000"
            match_threshold = 0.5
            utc_offset_minutes = -360
            bus = "system"
            "#,
        )
        .unwrap();
        assert_eq!(config.extractor_url, "http://faces.local:9000");
        assert!((config.match_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.enroll_cooldown_ms, 800);
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), -6 * 3600);
    }

    #[test]
    fn test_env_overrides_win_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_REQUEST_TIMEOUT_MS", "not-a-number"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/a.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert!((config.match_threshold - 0.45).abs() < f32::EPSILON);
        assert_eq!(config.request_timeout_ms, 8000);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/a.db"));
    }

    #[test]
    fn test_offset_out_of_range() {
        let config = Config {
            utc_offset_minutes: 24 * 60,
            ..Config::default()
        };
        assert!(matches!(config.utc_offset(), Err(ConfigError::Offset(_))));
    }

    #[test]
    fn test_extractor_timeout_must_undercut_request_timeout() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            extractor_timeout_secs: 8,
            request_timeout_ms: 8000,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Timeouts {
                extractor_ms: 8000,
                request_ms: 8000
            })
        ));
    }

    #[test]
    fn test_derived_settings() {
        let config = Config {
            enroll_cooldown_ms: 100,
            request_timeout_ms: 250,
            ..Config::default()
        };
        assert_eq!(config.enrollment_settings().cooldown, Duration::from_millis(100));
        assert_eq!(config.scan_timing().request_timeout, Duration::from_millis(250));
    }
}
