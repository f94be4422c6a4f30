//! Vendor hook and pluggable remediations.
//!
//! Platform-specific finalization lives outside this binary: an OEM hook
//! at a well-known path, invoked with the slot identity and the staging
//! root. One-off compatibility fixes plug in as remediations; the core
//! only defines the plug-in point and ships none.

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use crate::slot::SlotId;

/// Where the OEM drops its post-install hook.
pub const VENDOR_HOOK_PATH: &str = "/usr/share/oem/bin/oem-postinst";

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn vendor hook {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vendor hook {path} exited with status {status}: {stderr}")]
    Failed {
        path: String,
        status: i32,
        stderr: String,
    },
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run the vendor hook if one is installed and executable.
///
/// Returns `Ok(false)` when no hook ran; a hook that ran and failed is a
/// hard error, the update is treated as not applied.
pub fn run_vendor_hook(
    hook_path: &Path,
    slot: SlotId,
    staging_root: &Path,
) -> Result<bool, HookError> {
    if !is_executable(hook_path) {
        debug!(path = %hook_path.display(), "No vendor hook installed");
        return Ok(false);
    }

    info!(path = %hook_path.display(), slot = %slot, "Running vendor hook");

    let output = Command::new(hook_path)
        .arg(slot.upper())
        .arg(staging_root)
        .output()
        .map_err(|source| HookError::Spawn {
            path: hook_path.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(HookError::Failed {
            path: hook_path.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!("Vendor hook completed");
    Ok(true)
}

/// Everything a remediation may look at.
pub struct RemediationCtx<'a> {
    pub slot: SlotId,
    pub staging_root: &'a Path,
    pub esp_root: &'a Path,
}

/// A pluggable one-off fix: a predicate plus an effect.
pub trait Remediation: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies(&self, ctx: &RemediationCtx<'_>) -> bool;
    fn apply(&self, ctx: &RemediationCtx<'_>) -> anyhow::Result<()>;
}

/// Remediations compiled into this build. Deliberately empty; the dated
/// hash-gated fixes from earlier generations were not carried forward.
pub fn builtin_remediations() -> Vec<Box<dyn Remediation>> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_hook_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ran = run_vendor_hook(&dir.path().join("absent"), SlotId::A, dir.path()).unwrap();
        assert!(!ran);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_hook_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let hook = dir.path().join("oem-postinst");
        std::fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();
        // File exists but is not executable.
        let ran = run_vendor_hook(&hook, SlotId::A, dir.path()).unwrap();
        assert!(!ran);
    }

    #[cfg(unix)]
    #[test]
    fn test_hook_receives_slot_and_staging_root() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let hook = dir.path().join("oem-postinst");
        let witness = dir.path().join("args");
        std::fs::write(
            &hook,
            format!("#!/bin/sh\necho \"$1 $2\" > {}\n", witness.display()),
        )
        .unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();

        let ran = run_vendor_hook(&hook, SlotId::B, &staging).unwrap();
        assert!(ran);
        assert_eq!(
            std::fs::read_to_string(&witness).unwrap().trim(),
            format!("B {}", staging.display())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_hook_is_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let hook = dir.path().join("oem-postinst");
        std::fs::write(&hook, "#!/bin/sh\necho broken >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = run_vendor_hook(&hook, SlotId::A, dir.path()).unwrap_err();
        match err {
            HookError::Failed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_builtin_remediations() {
        assert!(builtin_remediations().is_empty());
    }
}
