//! Kernel staging onto the ESP.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::slot::SlotId;

/// Copy the slot's kernel from the freshly installed tree into the ESP
/// under the slot's canonical name. The copy goes through a temp file and
/// an atomic rename so the bootloader never sees a half-written kernel.
pub fn stage_kernel(
    staging_root: &Path,
    esp_root: &Path,
    kernel_name: &str,
    slot: SlotId,
) -> io::Result<PathBuf> {
    let source = staging_root.join("boot").join(kernel_name);
    let dest = esp_root.join(slot.kernel_path());

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_dest = dest.with_extension("tmp");
    std::fs::copy(&source, &temp_dest)?;

    let staged = std::fs::File::open(&temp_dest)?;
    staged.sync_all()?;
    drop(staged);

    std::fs::rename(&temp_dest, &dest)?;

    info!(
        source = %source.display(),
        dest = %dest.display(),
        "Staged kernel"
    );

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kernel_under_canonical_name() {
        let tree = tempfile::tempdir().unwrap();
        let staging = tree.path().join("staging");
        let esp = tree.path().join("esp");
        std::fs::create_dir_all(staging.join("boot")).unwrap();
        std::fs::create_dir_all(&esp).unwrap();
        std::fs::write(staging.join("boot/vmlinuz"), b"kernel image bits").unwrap();

        let dest = stage_kernel(&staging, &esp, "vmlinuz", SlotId::B).unwrap();

        assert_eq!(dest, esp.join("coreos/vmlinuz-b"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"kernel image bits");
        assert!(!esp.join("coreos/vmlinuz-b.tmp").exists());
    }

    #[test]
    fn test_missing_kernel_is_an_error() {
        let tree = tempfile::tempdir().unwrap();
        let staging = tree.path().join("staging");
        let esp = tree.path().join("esp");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&esp).unwrap();

        assert!(stage_kernel(&staging, &esp, "vmlinuz", SlotId::A).is_err());
    }

    #[test]
    fn test_restaging_overwrites_previous_kernel() {
        let tree = tempfile::tempdir().unwrap();
        let staging = tree.path().join("staging");
        let esp = tree.path().join("esp");
        std::fs::create_dir_all(staging.join("boot")).unwrap();
        std::fs::create_dir_all(&esp).unwrap();

        std::fs::write(staging.join("boot/vmlinuz"), b"old").unwrap();
        stage_kernel(&staging, &esp, "vmlinuz", SlotId::A).unwrap();

        std::fs::write(staging.join("boot/vmlinuz"), b"new").unwrap();
        let dest = stage_kernel(&staging, &esp, "vmlinuz", SlotId::A).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }
}
