//! Finalizer invocation.
//!
//! Once the payload is on the inactive slot, the post-install finalizer
//! arranges the bootloader to try it on next boot. The finalizer is a
//! separate executable; the engine only spawns it and propagates its
//! verdict.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::pipeline::{ExitCode, Stage, StageContext};
use crate::plan::InstallPlan;

/// Capability seam for slot activation, so the service machine can be
/// tested without touching a bootloader.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, plan: &InstallPlan) -> Result<(), ExitCode>;
}

/// Spawns the installed post-install executable with
/// `<target_device> KERNEL=<name>`.
pub struct PostinstFinalizer {
    executable: PathBuf,
    kernel_name: String,
}

impl PostinstFinalizer {
    pub fn new(executable: impl Into<PathBuf>, kernel_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            kernel_name: kernel_name.into(),
        }
    }
}

/// Map the finalizer's documented exit codes back into the error taxonomy.
fn classify_finalizer_exit(status: i32) -> ExitCode {
    match status {
        2 => ExitCode::SlotResolutionError,
        3 => ExitCode::EspNotFound,
        7 => ExitCode::HookError,
        _ => ExitCode::ActivationError,
    }
}

#[async_trait]
impl Finalizer for PostinstFinalizer {
    async fn finalize(&self, plan: &InstallPlan) -> Result<(), ExitCode> {
        info!(
            executable = %self.executable.display(),
            device = %plan.install_path.display(),
            "Running post-install finalizer"
        );

        let output = tokio::process::Command::new(&self.executable)
            .arg(&plan.install_path)
            .arg(format!("KERNEL={}", self.kernel_name))
            .output()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to spawn finalizer");
                ExitCode::ActivationError
            })?;

        if !output.status.success() {
            let status = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status, stderr = %stderr.trim(), "Finalizer failed");
            return Err(classify_finalizer_exit(status));
        }

        info!("Finalizer completed, new slot armed for next boot");
        Ok(())
    }
}

/// Pipeline stage adapter around a [`Finalizer`].
pub struct FinalizeStage {
    finalizer: Arc<dyn Finalizer>,
}

impl FinalizeStage {
    pub fn new(finalizer: Arc<dyn Finalizer>) -> Self {
        Self { finalizer }
    }
}

#[async_trait]
impl Stage for FinalizeStage {
    type Input = InstallPlan;
    type Output = InstallPlan;

    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        ctx: &mut StageContext,
    ) -> Result<InstallPlan, ExitCode> {
        if ctx.cancelled() {
            warn!("Skipping finalization, pipeline stopped");
            return Err(ExitCode::Cancelled);
        }

        self.finalizer.finalize(&plan).await?;
        Ok(plan)
    }
}
