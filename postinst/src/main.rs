//! # coreup Post-Install Finalizer
//!
//! Invoked by the update engine with the freshly written slot device:
//!
//! ```bash
//! coreup-postinst /dev/vda4 KERNEL=vmlinuz
//! ```
//!
//! On success the named slot is armed for the next boot (kernel on the
//! ESP, GPT attributes tries=1/successful=0/top priority) and the process
//! exits 0. Any fatal condition prints one diagnostic line on stderr and
//! exits non-zero; the previous slot stays fully bootable because the
//! priority raise is the last mutation performed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use coreup_postinst::activate::{activate, resolve_slot, ActivateError, ActivationContext};
use coreup_postinst::blockdev::{find_esp_device, partition_label};
use coreup_postinst::cli::Args;
use coreup_postinst::gpt::{GptTool, LoaderExec};
use coreup_postinst::hooks::{builtin_remediations, VENDOR_HOOK_PATH};
use coreup_postinst::legacy::legacy_boot_requested;
use coreup_postinst::mount::{find_mountpoint, MountGuard};

fn main() {
    let args = Args::parse();

    if let Err(e) = coreup_common::logging::init(&args.log_level, false) {
        eprintln!("coreup-postinst: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    match run(&args) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("coreup-postinst: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args) -> Result<(), ActivateError> {
    let device = &args.target_device;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %device.display(),
        "Starting post-install finalization"
    );

    let label = partition_label(device)?;
    let slot = resolve_slot(device, &label)?;

    // The freshly written slot is mounted read-only; it is the source of
    // the kernel image and of the GPT tooling run under its own linker.
    let staging = MountGuard::mount(
        device,
        &scratch_mountpoint("usr"),
        true,
    )?;

    let esp = acquire_esp()?;

    let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();

    let usr_root = staging.root().join("usr");
    let gpt_root = if usr_root.join("bin/cgpt").exists() {
        usr_root
    } else {
        staging.root().to_path_buf()
    };
    let gpt = GptTool::new(Arc::new(LoaderExec::cgpt_under(&gpt_root)));

    let ctx = ActivationContext {
        device,
        slot,
        staging_root: staging.root(),
        esp_root: esp.root(),
        kernel_name: args.kernel_name(),
        legacy_boot: legacy_boot_requested(&cmdline),
        vendor_hook: Some(Path::new(VENDOR_HOOK_PATH)),
    };

    let outcome = activate(&ctx, &gpt, &builtin_remediations());

    // Scoped resources go away on every exit path.
    if let Err(e) = staging.release() {
        warn!(error = %e, "Releasing staging mount failed");
    }
    if let Err(e) = esp.release() {
        warn!(error = %e, "Releasing ESP mount failed");
    }

    outcome
}

/// Locate the ESP and make it reachable: reuse an existing mount when the
/// system already has it mounted, otherwise mount it privately.
fn acquire_esp() -> Result<MountGuard, ActivateError> {
    let esp_device = find_esp_device()?;

    let mounts = std::fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    if let Some(existing) = find_mountpoint(&esp_device, &mounts) {
        info!(
            device = %esp_device.display(),
            mountpoint = %existing.display(),
            "Reusing mounted ESP"
        );
        return Ok(MountGuard::adopt(existing));
    }

    Ok(MountGuard::mount(&esp_device, &scratch_mountpoint("esp"), false)?)
}

fn scratch_mountpoint(kind: &str) -> PathBuf {
    std::env::temp_dir().join(format!("coreup-postinst-{}.{}", kind, std::process::id()))
}
