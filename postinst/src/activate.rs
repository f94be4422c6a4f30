//! Slot activation.
//!
//! Everything between "the payload is on the inactive slot" and "the
//! bootloader will try it next boot". Ordering matters: all staging and
//! hooks run first, and the GPT priority raise is the last mutation, so a
//! failure anywhere leaves the currently running slot fully bootable. The
//! peer slot's attributes are never touched.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::gpt::{GptError, GptTool};
use crate::hooks::{run_vendor_hook, HookError, Remediation, RemediationCtx};
use crate::kernel::stage_kernel;
use crate::legacy::write_legacy_configs;
use crate::mount::MountError;
use crate::slot::{SlotId, SlotResolutionError};

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("slot resolution failed on {device}: {source}")]
    SlotResolution {
        device: PathBuf,
        #[source]
        source: SlotResolutionError,
    },
    #[error("{0}")]
    Probe(#[from] crate::blockdev::ProbeError),
    #[error("{0}")]
    Mount(#[from] MountError),
    #[error("kernel staging failed: {0}")]
    KernelStaging(#[source] std::io::Error),
    #[error("legacy loader staging failed: {0}")]
    LegacyStaging(#[source] std::io::Error),
    #[error("{0}")]
    Hook(#[from] HookError),
    #[error("remediation {name} failed: {source}")]
    Remediation {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{0}")]
    Gpt(#[from] GptError),
}

impl ActivateError {
    /// Process exit code for the finalizer binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ActivateError::SlotResolution { .. } => 2,
            ActivateError::Probe(crate::blockdev::ProbeError::EspNotFound) => 3,
            ActivateError::Probe(_) => 4,
            ActivateError::Mount(_) => 5,
            ActivateError::KernelStaging(_) | ActivateError::LegacyStaging(_) => 6,
            ActivateError::Hook(_) | ActivateError::Remediation { .. } => 7,
            ActivateError::Gpt(_) => 8,
        }
    }
}

/// Inputs of one activation, with every environment dependency resolved.
pub struct ActivationContext<'a> {
    /// The slot device that just received the payload.
    pub device: &'a Path,
    pub slot: SlotId,
    /// Mounted tree of the freshly written slot.
    pub staging_root: &'a Path,
    /// Mounted EFI System Partition.
    pub esp_root: &'a Path,
    /// Kernel file name inside the staging tree's /boot.
    pub kernel_name: &'a str,
    /// Whether the legacy loader configs must be written too.
    pub legacy_boot: bool,
    /// Vendor hook location; `None` disables the hook entirely.
    pub vendor_hook: Option<&'a Path>,
}

/// Arrange the bootloader to try `ctx.slot` on the next boot.
pub fn activate(
    ctx: &ActivationContext<'_>,
    gpt: &GptTool,
    remediations: &[Box<dyn Remediation>],
) -> Result<(), ActivateError> {
    info!(
        device = %ctx.device.display(),
        slot = %ctx.slot,
        "Activating slot"
    );

    let kernel = stage_kernel(ctx.staging_root, ctx.esp_root, ctx.kernel_name, ctx.slot)
        .map_err(ActivateError::KernelStaging)?;

    if ctx.legacy_boot {
        write_legacy_configs(ctx.esp_root, ctx.slot, &kernel)
            .map_err(ActivateError::LegacyStaging)?;
    }

    if let Some(hook) = ctx.vendor_hook {
        run_vendor_hook(hook, ctx.slot, ctx.staging_root)?;
    }

    let rem_ctx = RemediationCtx {
        slot: ctx.slot,
        staging_root: ctx.staging_root,
        esp_root: ctx.esp_root,
    };
    for remediation in remediations {
        if remediation.applies(&rem_ctx) {
            info!(name = remediation.name(), "Applying remediation");
            remediation
                .apply(&rem_ctx)
                .map_err(|source| ActivateError::Remediation {
                    name: remediation.name(),
                    source,
                })?;
        }
    }

    // Boot attribute flips come last; only the target device is named, so
    // the running slot's attributes cannot change here.
    gpt.repair(ctx.device)?;
    gpt.mark_try_once(ctx.device)?;
    gpt.prioritize(ctx.device)?;

    info!(slot = %ctx.slot, "Slot armed: tries=1, successful=0, top priority");
    Ok(())
}

/// Derive the slot for a device from its partition label, as a fatal
/// operation.
pub fn resolve_slot(device: &Path, label: &str) -> Result<SlotId, ActivateError> {
    SlotId::from_partition_label(label).map_err(|source| {
        warn!(device = %device.display(), label = %label, "Refusing unknown slot label");
        ActivateError::SlotResolution {
            device: device.to_path_buf(),
            source,
        }
    })
}
