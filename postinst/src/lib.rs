//! # coreup post-install finalizer
//!
//! After the update engine has written a payload onto the inactive
//! partition slot, this crate arranges the bootloader to try that slot on
//! the next boot: it stages the kernel onto the EFI System Partition under
//! the slot's canonical name, runs the vendor hook, and flips the slot's
//! GPT boot attributes to "try once, highest priority". An external agent
//! marks the slot successful after the system proves healthy; until then a
//! failed boot falls back to the previous slot.

pub mod activate;
pub mod blockdev;
pub mod cli;
pub mod gpt;
pub mod hooks;
pub mod kernel;
pub mod legacy;
pub mod mount;
pub mod slot;

pub use activate::{activate, resolve_slot, ActivateError, ActivationContext};
pub use blockdev::{find_esp_device, partition_label, ProbeError, ESP_TYPE_GUID};
pub use gpt::{GptTool, LoaderExec, RecordingRunner, ToolRunner};
pub use hooks::{builtin_remediations, run_vendor_hook, Remediation, RemediationCtx, VENDOR_HOOK_PATH};
pub use mount::MountGuard;
pub use slot::{SlotId, SlotResolutionError};
