//! Configuration stored in `warden.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use warden_types::retry::BackoffPolicy;
use warden_types::{Result, WardenError};

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Upper bound for every `*_secs` window: 100 years.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// A `*_secs` setting as a chrono duration, capped at [`MAX_WINDOW_SECS`].
pub(crate) fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Top-level configuration. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WardenConfig {
    /// Checkpoints, audit chains, signal inboxes and locks live here.
    pub state_dir: PathBuf,
    /// Retry limit for nodes without their own `max_retries`.
    pub max_retries: u32,
    /// Health reports `warning` once any node has retried this often.
    pub retry_warning_threshold: u32,
    pub poll_interval_ms: u64,
    /// Health reports `stale` when the last checkpoint is older than this.
    pub staleness_window_secs: u64,
    /// New task nodes get a paired gate unless asked otherwise.
    pub auto_gate: bool,
    /// A recorded failure goes straight back to `active` while under the limit.
    pub auto_retry: bool,
    pub guard: GuardConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub max_evidence_age_secs: u64,
    pub max_clock_skew_secs: u64,
    /// Fraction of nodes sampled for deep re-verification, in `[0.0, 1.0]`.
    pub spot_check_rate: f64,
    pub require_evidence: bool,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub attempts: usize,
    pub backoff_ms: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".warden"),
            max_retries: 3,
            retry_warning_threshold: 2,
            poll_interval_ms: 2000,
            staleness_window_secs: 3600,
            auto_gate: true,
            auto_retry: true,
            guard: GuardConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_evidence_age_secs: 24 * 60 * 60,
            max_clock_skew_secs: 60,
            spot_check_rate: 0.1,
            require_evidence: true,
            min_confidence: 0.0,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            backoff_ms: 25,
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(self.backoff_ms),
            max: Duration::from_millis(self.backoff_ms.saturating_mul(40).max(1)),
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(WardenError::Config("state_dir must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(WardenError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.staleness_window_secs == 0 {
            return Err(WardenError::Config("staleness_window_secs must be > 0".into()));
        }
        for (key, secs) in [
            ("staleness_window_secs", self.staleness_window_secs),
            ("guard.max_evidence_age_secs", self.guard.max_evidence_age_secs),
            ("guard.max_clock_skew_secs", self.guard.max_clock_skew_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(WardenError::Config(format!(
                    "{key} must be at most {MAX_WINDOW_SECS}, got {secs}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.guard.spot_check_rate) {
            return Err(WardenError::Config(format!(
                "guard.spot_check_rate must be within [0.0, 1.0], got {}",
                self.guard.spot_check_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.guard.min_confidence) {
            return Err(WardenError::Config(format!(
                "guard.min_confidence must be within [0.0, 1.0], got {}",
                self.guard.min_confidence
            )));
        }
        if self.guard.max_evidence_age_secs == 0 {
            return Err(WardenError::Config("guard.max_evidence_age_secs must be > 0".into()));
        }
        if self.lock.attempts == 0 {
            return Err(WardenError::Config("lock.attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve a relative `state_dir` against `base` (the graph file's directory).
    pub fn state_dir_from(&self, base: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            base.join(&self.state_dir)
        }
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<WardenConfig>(&contents)
            .map_err(|e| WardenError::Config(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            WardenConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    cfg.validate()?;
    Ok(cfg)
}
