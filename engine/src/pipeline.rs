//! Staged execution with typed hand-off.
//!
//! Every update operation (check, download, finalize) is one stage, so
//! progress, cancellation, and error surfacing are handled in one place.
//! Stage N's output object becomes stage N+1's input; the bond is checked
//! where the pipeline is built, so a mis-wired pipeline does not compile.
//! At runtime the hand-off travels through a type-erased slot that is
//! infallible by construction.
//!
//! One stage runs at a time. A stage failing skips everything after it;
//! `stop()` asks the running stage to abort and, once it has completed
//! with any code, the pipeline reports stopped and goes no further.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Authoritative outcome of a stage, and of the pipeline as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    UpdateCheckError,
    DownloadTransportError,
    DownloadWriteError,
    DownloadSizeMismatch,
    DownloadHashMismatch,
    Cancelled,
    SlotResolutionError,
    EspNotFound,
    ActivationError,
    HookError,
    Internal,
}

impl ExitCode {
    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitCode::Success => "success",
            ExitCode::UpdateCheckError => "update_check_error",
            ExitCode::DownloadTransportError => "download_transport_error",
            ExitCode::DownloadWriteError => "download_write_error",
            ExitCode::DownloadSizeMismatch => "download_size_mismatch",
            ExitCode::DownloadHashMismatch => "download_hash_mismatch",
            ExitCode::Cancelled => "cancelled",
            ExitCode::SlotResolutionError => "slot_resolution_error",
            ExitCode::EspNotFound => "esp_not_found",
            ExitCode::ActivationError => "activation_error",
            ExitCode::HookError => "hook_error",
            ExitCode::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handed to every stage; carries the cooperative cancel signal.
pub struct StageContext {
    cancel: watch::Receiver<bool>,
}

impl StageContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once `stop()` has been requested. Pends forever if the
    /// pipeline can no longer be stopped.
    pub async fn wait_cancelled(&mut self) {
        loop {
            if *self.cancel.borrow_and_update() {
                return;
            }
            if self.cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One unit of pipeline work with statically declared hand-off types.
#[async_trait]
pub trait Stage: Send {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// `Ok` is a success completion carrying the output object; `Err` is
    /// the stage's non-success exit code.
    async fn run(
        &mut self,
        input: Self::Input,
        ctx: &mut StageContext,
    ) -> Result<Self::Output, ExitCode>;
}

/// Lifecycle callbacks from a pipeline run.
pub trait PipelineHooks: Send {
    fn on_stage_complete(&mut self, _stage: &'static str, _code: ExitCode) {}
    fn on_pipeline_done(&mut self, _code: ExitCode) {}
    fn on_pipeline_stopped(&mut self) {}
}

struct NoopHooks;

impl PipelineHooks for NoopHooks {}

/// Seeds the hand-off slot with a prebuilt object, so pipelines whose real
/// first stage wants an input can start from one.
pub struct ObjectFeederStage<T> {
    object: Option<T>,
}

impl<T> ObjectFeederStage<T> {
    pub fn new(object: T) -> Self {
        Self { object: Some(object) }
    }
}

#[async_trait]
impl<T: Send + 'static> Stage for ObjectFeederStage<T> {
    type Input = ();
    type Output = T;

    fn name(&self) -> &'static str {
        "feed"
    }

    async fn run(&mut self, _input: (), _ctx: &mut StageContext) -> Result<T, ExitCode> {
        self.object.take().ok_or(ExitCode::Internal)
    }
}

#[async_trait]
trait ErasedStage: Send {
    fn name(&self) -> &'static str;

    async fn run_erased(
        &mut self,
        input: Box<dyn Any + Send>,
        ctx: &mut StageContext,
    ) -> Result<Box<dyn Any + Send>, ExitCode>;
}

struct TypedStage<S>(S);

#[async_trait]
impl<S: Stage> ErasedStage for TypedStage<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn run_erased(
        &mut self,
        input: Box<dyn Any + Send>,
        ctx: &mut StageContext,
    ) -> Result<Box<dyn Any + Send>, ExitCode> {
        // The builder only bonds matching types; a failed downcast means
        // the pipeline itself is broken.
        let input = match input.downcast::<S::Input>() {
            Ok(input) => *input,
            Err(_) => {
                warn!(stage = self.0.name(), "Hand-off object has the wrong type");
                return Err(ExitCode::Internal);
            }
        };

        let output = self.0.run(input, ctx).await?;
        Ok(Box::new(output))
    }
}

/// Builds a pipeline one bonded stage at a time.
///
/// The type parameter tracks the pending hand-off type: `then` only accepts
/// a stage whose input matches the previous stage's output.
pub struct PipelineBuilder<T> {
    stages: Vec<Box<dyn ErasedStage>>,
    hooks: Box<dyn PipelineHooks>,
    _handoff: PhantomData<fn() -> T>,
}

impl PipelineBuilder<()> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            hooks: Box::new(NoopHooks),
            _handoff: PhantomData,
        }
    }
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Bond the next stage. Its input type must equal the current hand-off
    /// type, or this does not compile.
    pub fn then<S>(mut self, stage: S) -> PipelineBuilder<S::Output>
    where
        S: Stage<Input = T> + 'static,
    {
        self.stages.push(Box::new(TypedStage(stage)));
        PipelineBuilder {
            stages: self.stages,
            hooks: self.hooks,
            _handoff: PhantomData,
        }
    }

    pub fn hooks(mut self, hooks: impl PipelineHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn build(self) -> Pipeline {
        let (cancel, _) = watch::channel(false);
        Pipeline {
            stages: self.stages,
            hooks: self.hooks,
            cancel: Arc::new(cancel),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Control handle usable while (and after) the pipeline runs.
#[derive(Clone)]
pub struct PipelineHandle {
    cancel: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Request cooperative cancellation. Idempotent.
    pub fn stop(&self) {
        // send_replace stores the flag even before any stage subscribed.
        self.cancel.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// An ordered list of bonded stages plus lifecycle hooks.
pub struct Pipeline {
    stages: Vec<Box<dyn ErasedStage>>,
    hooks: Box<dyn PipelineHooks>,
    cancel: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            cancel: self.cancel.clone(),
            running: self.running.clone(),
        }
    }

    /// Drive the stages to completion and return the pipeline's final code.
    pub async fn run(mut self) -> ExitCode {
        self.running.store(true, Ordering::SeqCst);
        let code = self.run_stages().await;
        self.running.store(false, Ordering::SeqCst);
        code
    }

    async fn run_stages(&mut self) -> ExitCode {
        let mut ctx = StageContext { cancel: self.cancel.subscribe() };
        let mut handoff: Box<dyn Any + Send> = Box::new(());

        for stage in &mut self.stages {
            if ctx.cancelled() {
                self.hooks.on_pipeline_stopped();
                return ExitCode::Cancelled;
            }

            let name = stage.name();
            debug!(stage = name, "Starting stage");

            let input = std::mem::replace(&mut handoff, Box::new(()));
            let result = stage.run_erased(input, &mut ctx).await;

            let code = match &result {
                Ok(_) => ExitCode::Success,
                Err(code) => *code,
            };
            debug!(stage = name, code = %code, "Stage complete");
            self.hooks.on_stage_complete(name, code);

            if ctx.cancelled() {
                self.hooks.on_pipeline_stopped();
                return ExitCode::Cancelled;
            }

            match result {
                Ok(output) => handoff = output,
                Err(code) => {
                    self.hooks.on_pipeline_done(code);
                    return code;
                }
            }
        }

        self.hooks.on_pipeline_done(ExitCode::Success);
        ExitCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Double;

    #[async_trait]
    impl Stage for Double {
        type Input = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "double"
        }

        async fn run(&mut self, input: u64, _ctx: &mut StageContext) -> Result<u64, ExitCode> {
            Ok(input * 2)
        }
    }

    struct FailWith(ExitCode);

    #[async_trait]
    impl Stage for FailWith {
        type Input = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "fail"
        }

        async fn run(&mut self, _input: u64, _ctx: &mut StageContext) -> Result<u64, ExitCode> {
            Err(self.0)
        }
    }

    struct Capture(Arc<Mutex<Option<u64>>>);

    #[async_trait]
    impl Stage for Capture {
        type Input = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "capture"
        }

        async fn run(&mut self, input: u64, _ctx: &mut StageContext) -> Result<u64, ExitCode> {
            *self.0.lock().unwrap() = Some(input);
            Ok(input)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingHooks {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl PipelineHooks for RecordingHooks {
        fn on_stage_complete(&mut self, stage: &'static str, code: ExitCode) {
            self.events.lock().unwrap().push(format!("stage:{stage}:{code}"));
        }

        fn on_pipeline_done(&mut self, code: ExitCode) {
            self.events.lock().unwrap().push(format!("done:{code}"));
        }

        fn on_pipeline_stopped(&mut self) {
            self.events.lock().unwrap().push("stopped".to_string());
        }
    }

    #[tokio::test]
    async fn test_typed_handoff_flows_through() {
        let seen = Arc::new(Mutex::new(None));
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(21u64))
            .then(Double)
            .then(Capture(seen.clone()))
            .build();

        assert_eq!(pipeline.run().await, ExitCode::Success);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_failure_skips_later_stages() {
        let seen = Arc::new(Mutex::new(None));
        let hooks = RecordingHooks::default();
        let events = hooks.events.clone();

        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(1u64))
            .then(FailWith(ExitCode::DownloadTransportError))
            .then(Capture(seen.clone()))
            .hooks(hooks)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::DownloadTransportError);
        assert_eq!(*seen.lock().unwrap(), None);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "stage:feed:success",
                "stage:fail:download_transport_error",
                "done:download_transport_error",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_before_start_reports_stopped_once() {
        let hooks = RecordingHooks::default();
        let events = hooks.events.clone();

        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(1u64))
            .then(Double)
            .hooks(hooks)
            .build();
        let handle = pipeline.handle();
        handle.stop();
        handle.stop(); // idempotent

        assert_eq!(pipeline.run().await, ExitCode::Cancelled);
        assert_eq!(*events.lock().unwrap(), vec!["stopped"]);
    }

    #[tokio::test]
    async fn test_is_running_tracks_lifecycle() {
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(1u64))
            .build();
        let handle = pipeline.handle();

        assert!(!handle.is_running());
        pipeline.run().await;
        assert!(!handle.is_running());
    }
}
