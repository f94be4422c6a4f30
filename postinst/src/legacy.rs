//! Legacy bootloader compatibility.
//!
//! Machines provisioned before the EFI layout carry a marker on the kernel
//! command line; only then do the syslinux and legacy-GRUB configs get
//! written. `syslinux/default.cfg` is left alone when the operator marked
//! it as held, so a hand-customized default entry survives updates.

use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::slot::SlotId;

/// Kernel command line token that switches the legacy path on.
pub const LEGACY_CMDLINE_MARKER: &str = "coreos.legacy_boot=1";

/// Marker token: a default.cfg containing it is never rewritten.
pub const HOLD_MARKER: &str = "# coreup-hold";

pub fn legacy_boot_requested(cmdline: &str) -> bool {
    cmdline.split_whitespace().any(|t| t == LEGACY_CMDLINE_MARKER)
}

/// Per-slot syslinux entry.
pub fn render_root_cfg(slot: SlotId) -> String {
    format!(
        "label coreos-{slot}\n\
         \tmenu label CoreOS {slot}\n\
         \tkernel vmlinuz.{slot}\n\
         \tappend root=LABEL=ROOT mount.usr=PARTLABEL={usr} rootflags=rw noswap console=tty0\n",
        slot = slot.upper(),
        usr = slot.usr_label(),
    )
}

/// Legacy-GRUB menu pointing at the slot's syslinux kernel copy.
pub fn render_menu_lst(slot: SlotId) -> String {
    format!(
        "default 0\n\
         timeout 1\n\
         \n\
         title CoreOS {slot}\n\
         root (hd0,0)\n\
         kernel /syslinux/vmlinuz.{slot} root=LABEL=ROOT mount.usr=PARTLABEL={usr}\n",
        slot = slot.upper(),
        usr = slot.usr_label(),
    )
}

/// Default entry selector handed to syslinux.
pub fn render_default_cfg(slot: SlotId) -> String {
    format!("default coreos-{}\n", slot.upper())
}

/// Whether an existing default.cfg must be preserved.
pub fn default_cfg_held(existing: &str) -> bool {
    existing.lines().any(|line| line.trim() == HOLD_MARKER)
}

/// Write the legacy loader files for `slot` into the ESP.
///
/// The kernel is duplicated under the syslinux name so the legacy loader
/// does not depend on the EFI layout.
pub fn write_legacy_configs(esp_root: &Path, slot: SlotId, kernel: &Path) -> io::Result<()> {
    let syslinux = esp_root.join("syslinux");
    std::fs::create_dir_all(&syslinux)?;

    std::fs::copy(kernel, syslinux.join(format!("vmlinuz.{}", slot.upper())))?;
    std::fs::write(
        syslinux.join(format!("root.{}.cfg", slot.upper())),
        render_root_cfg(slot),
    )?;

    let grub_dir = esp_root.join("boot/grub");
    std::fs::create_dir_all(&grub_dir)?;
    std::fs::write(grub_dir.join("menu.lst"), render_menu_lst(slot))?;

    let default_cfg = syslinux.join("default.cfg");
    let held = match std::fs::read_to_string(&default_cfg) {
        Ok(existing) => default_cfg_held(&existing),
        Err(_) => false,
    };
    if held {
        debug!(path = %default_cfg.display(), "default.cfg held, not rewriting");
    } else {
        std::fs::write(&default_cfg, render_default_cfg(slot))?;
    }

    info!(slot = %slot, "Wrote legacy loader configs");
    Ok(())
}
