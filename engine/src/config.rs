//! Engine configuration.
//!
//! Loaded from /etc/coreup/engine.yaml; every field has a default so the
//! daemon also runs from an empty or missing file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Interval used when check_interval cannot be parsed. `validate()`
/// rejects such a value before the daemon starts, so this only covers
/// callers that skipped validation.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Update engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether periodic update checks run at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base URL of the update server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Release group (stable, beta, alpha).
    #[serde(default = "default_group")]
    pub group: String,

    /// How often to check for updates (e.g., "1h", "30m").
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Path of the post-install finalizer executable.
    #[serde(default = "default_postinst_path")]
    pub postinst_path: PathBuf,

    /// Kernel image name handed to the finalizer.
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,
}

fn default_enabled() -> bool {
    true
}

fn default_server_url() -> String {
    "https://update.release.core-os.net".to_string()
}

fn default_group() -> String {
    "stable".to_string()
}

fn default_check_interval() -> String {
    "1h".to_string()
}

fn default_postinst_path() -> PathBuf {
    PathBuf::from("/usr/sbin/coreup-postinst")
}

fn default_kernel_name() -> String {
    "vmlinuz".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            server_url: default_server_url(),
            group: default_group(),
            check_interval: default_check_interval(),
            postinst_path: default_postinst_path(),
            kernel_name: default_kernel_name(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parsed check interval. Falls back to hourly for an unparseable
    /// field.
    pub fn check_interval_duration(&self) -> Duration {
        parse_interval(&self.check_interval).unwrap_or(DEFAULT_CHECK_INTERVAL)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            bail!("server_url is empty");
        }
        if !matches!(self.group.as_str(), "stable" | "beta" | "alpha") {
            bail!(
                "unknown release group {:?}, expected stable, beta, or alpha",
                self.group
            );
        }
        parse_interval(&self.check_interval).context("check_interval is invalid")?;
        Ok(())
    }
}

/// Intervals are a count plus a unit suffix: "45s", "30m", "6h", "1d".
fn parse_interval(text: &str) -> Result<Duration> {
    let text = text.trim();
    let unit_at = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (count, unit) = text.split_at(unit_at);

    let count: u64 = count
        .parse()
        .map_err(|_| anyhow!("missing count in interval {text:?}"))?;
    if count == 0 {
        bail!("interval {text:?} must be positive");
    }

    let seconds_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => bail!("unknown interval unit in {text:?} (use s, m, h, or d)"),
    };

    Ok(Duration::from_secs(count * seconds_per_unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_unit_suffixes() {
        assert_eq!(parse_interval("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_interval("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_interval(" 6h ").unwrap(), Duration::from_secs(21_600));
        assert_eq!(parse_interval("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_malformed_intervals_are_rejected() {
        for bad in ["", "10", "h", "0m", "-5m", "10 h", "1w"] {
            assert!(parse_interval(bad).is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn test_unparseable_interval_falls_back_to_hourly() {
        let mut config = EngineConfig::default();
        config.check_interval = "whenever".to_string();
        assert_eq!(config.check_interval_duration(), DEFAULT_CHECK_INTERVAL);
    }

    #[test]
    fn test_validation_covers_each_field() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.server_url = "   ".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.group = "nightly".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.check_interval = "0h".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: EngineConfig = serde_yaml::from_str("group: beta\n").unwrap();
        assert_eq!(config.group, "beta");
        assert_eq!(config.server_url, default_server_url());
        assert!(config.enabled);
    }
}
