//! GPT attribute operations via the image-bundled tool.
//!
//! The attribute writes go through the cgpt binary shipped INSIDE the new
//! image, run under that image's own dynamic linker and library path. The
//! host's libc may be older than the tool expects; the new image's is, by
//! definition, the right one.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GptError {
    #[error("failed to run GPT tool: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("GPT {op} on {device} failed with status {status}: {stderr}")]
    Failed {
        op: &'static str,
        device: PathBuf,
        status: i32,
        stderr: String,
    },
}

pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes the GPT tool. The production runner prefixes the invocation
/// with a dynamic linker; the recording runner backs the tests.
pub trait ToolRunner: Send + Sync {
    fn run(&self, args: &[String]) -> Result<ToolOutput, GptError>;
}

/// Runs a binary under an explicit loader and library path.
pub struct LoaderExec {
    loader: PathBuf,
    library_path: PathBuf,
    tool: PathBuf,
}

impl LoaderExec {
    pub fn new(
        loader: impl Into<PathBuf>,
        library_path: impl Into<PathBuf>,
        tool: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader: loader.into(),
            library_path: library_path.into(),
            tool: tool.into(),
        }
    }

    /// The cgpt bundled in an installed usr tree, run under that tree's
    /// linker.
    pub fn cgpt_under(usr_root: &Path) -> Self {
        Self::new(
            usr_root.join("lib64/ld-linux-x86-64.so.2"),
            usr_root.join("lib64"),
            usr_root.join("bin/cgpt"),
        )
    }
}

impl ToolRunner for LoaderExec {
    fn run(&self, args: &[String]) -> Result<ToolOutput, GptError> {
        debug!(
            loader = %self.loader.display(),
            tool = %self.tool.display(),
            ?args,
            "Running GPT tool"
        );

        let output = Command::new(&self.loader)
            .arg("--library-path")
            .arg(&self.library_path)
            .arg(&self.tool)
            .args(args)
            .output()
            .map_err(GptError::Spawn)?;

        Ok(ToolOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// The GPT boot-attribute operations the activator needs.
pub struct GptTool {
    runner: std::sync::Arc<dyn ToolRunner>,
}

impl GptTool {
    pub fn new(runner: std::sync::Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    fn invoke(&self, op: &'static str, args: Vec<String>, device: &Path) -> Result<String, GptError> {
        let output = self.runner.run(&args)?;
        if output.status != 0 {
            return Err(GptError::Failed {
                op,
                device: device.to_path_buf(),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Reconcile GPT metadata (backup header, CRCs) before touching
    /// attributes.
    pub fn repair(&self, device: &Path) -> Result<(), GptError> {
        self.invoke(
            "repair",
            vec!["repair".into(), device.to_string_lossy().into_owned()],
            device,
        )?;
        info!(device = %device.display(), "GPT repaired");
        Ok(())
    }

    /// Mark the partition "try once, not yet proven":
    /// `successful=0, tries=1`.
    pub fn mark_try_once(&self, device: &Path) -> Result<(), GptError> {
        self.invoke(
            "add",
            vec![
                "add".into(),
                "-S0".into(),
                "-T1".into(),
                device.to_string_lossy().into_owned(),
            ],
            device,
        )?;
        info!(device = %device.display(), "Slot marked try-once");
        Ok(())
    }

    /// Raise the partition's boot priority above its peer. The tool caps
    /// the 4-bit priority field and breaks ties in favor of this device.
    pub fn prioritize(&self, device: &Path) -> Result<(), GptError> {
        self.invoke(
            "prioritize",
            vec!["prioritize".into(), device.to_string_lossy().into_owned()],
            device,
        )?;
        info!(device = %device.display(), "Slot prioritized for next boot");
        Ok(())
    }

    /// Current GPT state, for diagnostics.
    pub fn show(&self, device: &Path) -> Result<String, GptError> {
        self.invoke(
            "show",
            vec!["show".into(), device.to_string_lossy().into_owned()],
            device,
        )
    }
}

/// Records every invocation; optionally fails one operation. Backs the
/// activation tests.
pub struct RecordingRunner {
    pub calls: std::sync::Mutex<Vec<Vec<String>>>,
    fail_op: Option<&'static str>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            fail_op: None,
        }
    }

    pub fn failing_on(op: &'static str) -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            fail_op: Some(op),
        }
    }

    pub fn recorded(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner for RecordingRunner {
    fn run(&self, args: &[String]) -> Result<ToolOutput, GptError> {
        self.calls.lock().unwrap().push(args.to_vec());

        let failed = self.fail_op.is_some_and(|op| args.first().map(String::as_str) == Some(op));
        Ok(ToolOutput {
            status: if failed { 1 } else { 0 },
            stdout: String::new(),
            stderr: if failed { "injected failure".to_string() } else { String::new() },
        })
    }
}
