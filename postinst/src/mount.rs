//! Scoped mounts.
//!
//! Every mount acquired here is paired with a release that runs on all
//! exit paths; a guard that mounted something owes an unmount and a
//! mountpoint removal, a guard adopting an existing mount owes nothing.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to create mountpoint {path}: {source}")]
    Mountpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to run {cmd}: {source}")]
    Spawn {
        cmd: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("mount of {device} at {mountpoint} failed with status {status}: {stderr}")]
    MountFailed {
        device: PathBuf,
        mountpoint: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("unmount of {mountpoint} failed with status {status}")]
    UnmountFailed { mountpoint: PathBuf, status: i32 },
}

/// Find where a device is already mounted, given /proc/self/mounts content.
pub fn find_mountpoint(device: &Path, mounts: &str) -> Option<PathBuf> {
    let device = device.to_string_lossy();
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        (source == device).then(|| PathBuf::from(target))
    })
}

/// A mounted filesystem whose teardown obligation is tracked explicitly.
pub struct MountGuard {
    root: PathBuf,
    owes_teardown: bool,
    released: bool,
}

impl MountGuard {
    /// Mount `device` at `mountpoint`, creating the mountpoint. The guard
    /// owes an unmount and mountpoint removal.
    pub fn mount(device: &Path, mountpoint: &Path, read_only: bool) -> Result<Self, MountError> {
        std::fs::create_dir_all(mountpoint).map_err(|source| MountError::Mountpoint {
            path: mountpoint.to_path_buf(),
            source,
        })?;

        let mut cmd = Command::new("mount");
        if read_only {
            cmd.args(["-o", "ro"]);
        }
        let output = cmd
            .arg(device)
            .arg(mountpoint)
            .output()
            .map_err(|source| MountError::Spawn { cmd: "mount", source })?;

        if !output.status.success() {
            return Err(MountError::MountFailed {
                device: device.to_path_buf(),
                mountpoint: mountpoint.to_path_buf(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(
            device = %device.display(),
            mountpoint = %mountpoint.display(),
            read_only,
            "Mounted"
        );

        Ok(Self {
            root: mountpoint.to_path_buf(),
            owes_teardown: true,
            released: false,
        })
    }

    /// Adopt a filesystem something else already mounted; no teardown owed.
    pub fn adopt(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            owes_teardown: false,
            released: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tear down, if owed. Consumes the guard so the path cannot be used
    /// after the filesystem is gone.
    pub fn release(mut self) -> Result<(), MountError> {
        self.released = true;
        if !self.owes_teardown {
            return Ok(());
        }

        let output = Command::new("umount")
            .arg(&self.root)
            .output()
            .map_err(|source| MountError::Spawn { cmd: "umount", source })?;

        if !output.status.success() {
            return Err(MountError::UnmountFailed {
                mountpoint: self.root.clone(),
                status: output.status.code().unwrap_or(-1),
            });
        }

        let _ = std::fs::remove_dir(&self.root);
        info!(mountpoint = %self.root.display(), "Unmounted");
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.owes_teardown && !self.released {
            warn!(
                mountpoint = %self.root.display(),
                "Mount guard dropped without release, unmounting best-effort"
            );
            let _ = Command::new("umount").arg(&self.root).status();
            let _ = std::fs::remove_dir(&self.root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/vda3 /usr ext4 ro,seclabel 0 0\n\
/dev/vda1 /boot vfat rw,relatime 0 0\n\
tmpfs /tmp tmpfs rw 0 0\n";

    #[test]
    fn test_find_mountpoint() {
        assert_eq!(
            find_mountpoint(Path::new("/dev/vda1"), MOUNTS),
            Some(PathBuf::from("/boot"))
        );
        assert_eq!(find_mountpoint(Path::new("/dev/vdb1"), MOUNTS), None);
    }

    #[test]
    fn test_adopted_mount_owes_nothing() {
        let guard = MountGuard::adopt("/boot");
        assert_eq!(guard.root(), Path::new("/boot"));
        guard.release().unwrap();
    }
}
