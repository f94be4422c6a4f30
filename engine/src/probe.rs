//! Booted-slot discovery.
//!
//! The engine writes payloads to the partition slot the system is NOT
//! running from. Which slot that is comes from the kernel command line,
//! and label-to-device resolution goes through /dev/disk/by-partlabel.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Capability interface over block-device probing, so the checker can be
/// tested without a real partition table.
pub trait SlotProber: Send + Sync {
    /// GPT label of the usr partition the running system booted from.
    fn booted_usr_label(&self) -> Result<String>;

    /// Device path of the inactive slot's usr partition.
    fn inactive_partition(&self) -> Result<PathBuf>;
}

/// Extract the booted usr partition label from a kernel command line.
///
/// Recognizes `mount.usr=PARTLABEL=<LABEL>` and the older `usr=PARTLABEL=`
/// spelling.
pub fn parse_usr_label(cmdline: &str) -> Option<&str> {
    cmdline.split_whitespace().find_map(|token| {
        let value = token
            .strip_prefix("mount.usr=")
            .or_else(|| token.strip_prefix("usr="))?;
        value.strip_prefix("PARTLABEL=")
    })
}

/// Production prober: reads /proc/cmdline and resolves labels through the
/// by-partlabel symlink directory.
pub struct CmdlineSlotProber {
    cmdline_path: PathBuf,
    by_partlabel_dir: PathBuf,
}

impl CmdlineSlotProber {
    pub fn new() -> Self {
        Self {
            cmdline_path: PathBuf::from("/proc/cmdline"),
            by_partlabel_dir: PathBuf::from("/dev/disk/by-partlabel"),
        }
    }

    /// Override the probe roots; used by tests against a fake tree.
    pub fn with_roots(cmdline_path: impl Into<PathBuf>, by_partlabel_dir: impl Into<PathBuf>) -> Self {
        Self {
            cmdline_path: cmdline_path.into(),
            by_partlabel_dir: by_partlabel_dir.into(),
        }
    }

    fn resolve_label(&self, label: &str) -> Result<PathBuf> {
        let link = self.by_partlabel_dir.join(label);
        if !link.exists() {
            bail!("no partition with label {} under {}", label, self.by_partlabel_dir.display());
        }
        std::fs::canonicalize(&link)
            .with_context(|| format!("resolving {}", link.display()))
    }
}

impl Default for CmdlineSlotProber {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotProber for CmdlineSlotProber {
    fn booted_usr_label(&self) -> Result<String> {
        let cmdline = std::fs::read_to_string(&self.cmdline_path)
            .with_context(|| format!("reading {}", self.cmdline_path.display()))?;

        match parse_usr_label(&cmdline) {
            Some(label) => {
                debug!(label = %label, "Booted usr partition");
                Ok(label.to_string())
            }
            None => {
                warn!("Kernel command line does not name a usr partition");
                bail!("could not determine booted slot from kernel command line")
            }
        }
    }

    fn inactive_partition(&self) -> Result<PathBuf> {
        let booted = self.booted_usr_label()?;
        let target = match booted.as_str() {
            "USR-A" => "USR-B",
            "USR-B" => "USR-A",
            other => bail!("unexpected usr partition label: {}", other),
        };
        self.resolve_label(target)
    }
}

/// Fixed-answer prober for tests.
pub struct StaticSlotProber {
    pub booted_label: String,
    pub inactive_device: PathBuf,
}

impl StaticSlotProber {
    pub fn new(booted_label: impl Into<String>, inactive_device: impl Into<PathBuf>) -> Self {
        Self {
            booted_label: booted_label.into(),
            inactive_device: inactive_device.into(),
        }
    }
}

impl SlotProber for StaticSlotProber {
    fn booted_usr_label(&self) -> Result<String> {
        Ok(self.booted_label.clone())
    }

    fn inactive_partition(&self) -> Result<PathBuf> {
        Ok(self.inactive_device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usr_label_variants() {
        assert_eq!(
            parse_usr_label("BOOT_IMAGE=/coreos/vmlinuz-a mount.usr=PARTLABEL=USR-A ro quiet"),
            Some("USR-A")
        );
        assert_eq!(parse_usr_label("usr=PARTLABEL=USR-B ro"), Some("USR-B"));
        assert_eq!(parse_usr_label("root=LABEL=ROOT ro"), None);
        // LABEL= names a filesystem label, not a partition label.
        assert_eq!(parse_usr_label("mount.usr=LABEL=USR-A"), None);
    }

    #[test]
    fn test_inactive_partition_flips_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cmdline = dir.path().join("cmdline");
        std::fs::write(&cmdline, "mount.usr=PARTLABEL=USR-A ro\n").unwrap();

        let by_label = dir.path().join("by-partlabel");
        std::fs::create_dir(&by_label).unwrap();
        let device = dir.path().join("vda4");
        std::fs::write(&device, b"").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&device, by_label.join("USR-B")).unwrap();

        let prober = CmdlineSlotProber::with_roots(&cmdline, &by_label);
        assert_eq!(prober.booted_usr_label().unwrap(), "USR-A");
        assert_eq!(
            prober.inactive_partition().unwrap(),
            std::fs::canonicalize(&device).unwrap()
        );
    }

    #[test]
    fn test_missing_label_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmdline = dir.path().join("cmdline");
        std::fs::write(&cmdline, "mount.usr=PARTLABEL=USR-A\n").unwrap();
        let by_label = dir.path().join("by-partlabel");
        std::fs::create_dir(&by_label).unwrap();

        let prober = CmdlineSlotProber::with_roots(&cmdline, &by_label);
        assert!(prober.inactive_partition().is_err());
    }
}
