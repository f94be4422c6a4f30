//! Update service state machine.
//!
//! The top-level controller: accepts `attempt_update`/`reset_status`,
//! drives the check → download → finalize pipeline, and exposes a
//! consistent status snapshot at any point in between. One update attempt
//! runs at a time; everything else observes.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::checker::UpdateChecker;
use crate::download::{DownloadDelegate, DownloadStage};
use crate::fetcher::{HttpFetcher, PayloadFetcher};
use crate::finalize::{FinalizeStage, Finalizer};
use crate::pipeline::{ExitCode, ObjectFeederStage, PipelineBuilder, PipelineHandle, PipelineHooks};
use crate::plan::InstallPlan;

/// Externally visible state of the updater.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceState {
    Idle,
    CheckingForUpdate,
    UpdateAvailable { version: String },
    Downloading { received: u64, total: u64 },
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingError { kind: ExitCode },
}

impl ServiceState {
    /// Canonical wire string, as surfaced through the manager interface.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "UPDATE_STATUS_IDLE",
            ServiceState::CheckingForUpdate => "UPDATE_STATUS_CHECKING_FOR_UPDATE",
            ServiceState::UpdateAvailable { .. } => "UPDATE_STATUS_UPDATE_AVAILABLE",
            ServiceState::Downloading { .. } => "UPDATE_STATUS_DOWNLOADING",
            ServiceState::Verifying => "UPDATE_STATUS_VERIFYING",
            ServiceState::Finalizing => "UPDATE_STATUS_FINALIZING",
            ServiceState::UpdatedNeedReboot => "UPDATE_STATUS_UPDATED_NEED_REBOOT",
            ServiceState::ReportingError { .. } => "UPDATE_STATUS_REPORTING_ERROR_EVENT",
        }
    }

    /// True while an update attempt is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ServiceState::CheckingForUpdate
                | ServiceState::UpdateAvailable { .. }
                | ServiceState::Downloading { .. }
                | ServiceState::Verifying
                | ServiceState::Finalizing
        )
    }
}

/// One consistent observation of the service.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Unix seconds of the last completed update check; 0 if none yet.
    pub last_checked_unix_s: i64,
    /// Download progress in `0.0..=1.0`.
    pub progress: f64,
    pub state: ServiceState,
    pub new_version: String,
    pub new_size_bytes: u64,
}

struct StatusInner {
    state: ServiceState,
    last_checked: Option<DateTime<Utc>>,
    new_version: String,
    new_size: u64,
}

impl StatusInner {
    fn snapshot(&self) -> StatusSnapshot {
        let progress = match &self.state {
            ServiceState::Downloading { received, total } if *total > 0 => {
                *received as f64 / *total as f64
            }
            ServiceState::Verifying
            | ServiceState::Finalizing
            | ServiceState::UpdatedNeedReboot => 1.0,
            _ => 0.0,
        };

        StatusSnapshot {
            last_checked_unix_s: self.last_checked.map(|t| t.timestamp()).unwrap_or(0),
            progress,
            state: self.state.clone(),
            new_version: self.new_version.clone(),
            new_size_bytes: self.new_size,
        }
    }
}

/// Builds the payload fetcher for a plan; injectable so tests run without a
/// network.
pub type FetcherFactory =
    Box<dyn Fn(&InstallPlan) -> Box<dyn PayloadFetcher> + Send + Sync>;

/// Drives update attempts and owns the status snapshot.
pub struct UpdateService {
    checker: Arc<dyn UpdateChecker>,
    finalizer: Arc<dyn Finalizer>,
    fetcher_factory: FetcherFactory,
    status: Arc<RwLock<StatusInner>>,
    active: Mutex<Option<PipelineHandle>>,
}

/// Feeds download progress into the status snapshot.
struct ProgressSink {
    status: Arc<RwLock<StatusInner>>,
}

impl DownloadDelegate for ProgressSink {
    fn set_download_status(&mut self, active: bool) {
        info!(active, "Download transfer status changed");
    }

    fn bytes_received(&mut self, _count: u64, progress: u64, total: u64) {
        let mut inner = self.status.write().unwrap();
        if total > 0 && progress >= total {
            // All payload bytes are in; the stage is checking the digest.
            inner.state = ServiceState::Verifying;
        } else {
            inner.state = ServiceState::Downloading {
                received: progress.min(total),
                total,
            };
        }
    }
}

/// Flips the snapshot to Finalizing once the download stage has succeeded.
struct ServiceHooks {
    status: Arc<RwLock<StatusInner>>,
}

impl PipelineHooks for ServiceHooks {
    fn on_stage_complete(&mut self, stage: &'static str, code: ExitCode) {
        if stage == "download" && code.is_success() {
            self.status.write().unwrap().state = ServiceState::Finalizing;
        }
    }
}

impl UpdateService {
    pub fn new(checker: Arc<dyn UpdateChecker>, finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            checker,
            finalizer,
            fetcher_factory: Box::new(|plan| {
                Box::new(HttpFetcher::new(plan.url.clone())) as Box<dyn PayloadFetcher>
            }),
            status: Arc::new(RwLock::new(StatusInner {
                state: ServiceState::Idle,
                last_checked: None,
                new_version: String::new(),
                new_size: 0,
            })),
            active: Mutex::new(None),
        }
    }

    /// Replace the fetcher factory; used by tests.
    pub fn with_fetcher_factory(mut self, factory: FetcherFactory) -> Self {
        self.fetcher_factory = factory;
        self
    }

    /// Start an update attempt if idle; otherwise a no-op that returns the
    /// current state.
    pub fn attempt_update(self: &Arc<Self>) -> StatusSnapshot {
        {
            let mut inner = self.status.write().unwrap();
            if inner.state != ServiceState::Idle {
                info!(state = inner.state.as_str(), "Update attempt ignored, not idle");
                return inner.snapshot();
            }
            inner.state = ServiceState::CheckingForUpdate;
        }

        let service = self.clone();
        tokio::spawn(async move {
            service.run_update().await;
        });

        self.get_status()
    }

    /// Clear a terminal state back to idle. Idempotent; an in-flight
    /// attempt is left alone.
    pub fn reset_status(&self) -> StatusSnapshot {
        let mut inner = self.status.write().unwrap();
        match inner.state {
            ServiceState::ReportingError { .. } | ServiceState::UpdatedNeedReboot => {
                info!(from = inner.state.as_str(), "Resetting status to idle");
                inner.state = ServiceState::Idle;
                inner.new_version = String::new();
                inner.new_size = 0;
            }
            _ => {}
        }
        inner.snapshot()
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.status.read().unwrap().snapshot()
    }

    /// Ask the in-flight pipeline, if any, to stop. Used on daemon
    /// shutdown.
    pub fn stop_current(&self) {
        if let Some(handle) = self.active.lock().unwrap().as_ref() {
            info!("Stopping in-flight update pipeline");
            handle.stop();
        }
    }

    /// Wait until no update attempt is in flight.
    pub async fn wait_until_settled(&self) -> StatusSnapshot {
        loop {
            let snapshot = self.get_status();
            if !snapshot.state.is_busy() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[instrument(skip(self))]
    async fn run_update(&self) {
        let checked = match self.checker.check().await {
            Ok(checked) => {
                self.stamp_checked();
                checked
            }
            Err(e) => {
                error!(error = %e, "Update check failed: {:#}", e);
                self.stamp_checked();
                self.finish(ExitCode::UpdateCheckError);
                return;
            }
        };

        let Some(update) = checked else {
            info!("No update available");
            self.status.write().unwrap().state = ServiceState::Idle;
            return;
        };

        info!(version = %update.version, plan = ?update.plan, "Update available");
        {
            let mut inner = self.status.write().unwrap();
            inner.state = ServiceState::UpdateAvailable {
                version: update.version.clone(),
            };
            inner.new_version = update.version.clone();
            inner.new_size = update.plan.payload_size;
        }

        let plan = update.plan;
        let fetcher = (self.fetcher_factory)(&plan);

        let mut download = DownloadStage::new(fetcher);
        download.set_delegate(Box::new(ProgressSink {
            status: self.status.clone(),
        }));

        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(download)
            .then(FinalizeStage::new(self.finalizer.clone()))
            .hooks(ServiceHooks {
                status: self.status.clone(),
            })
            .build();

        *self.active.lock().unwrap() = Some(pipeline.handle());
        let code = pipeline.run().await;
        *self.active.lock().unwrap() = None;

        self.finish(code);
    }

    fn stamp_checked(&self) {
        self.status.write().unwrap().last_checked = Some(Utc::now());
    }

    fn finish(&self, code: ExitCode) {
        let mut inner = self.status.write().unwrap();
        inner.state = match code {
            ExitCode::Success => {
                info!("Update applied, reboot required");
                ServiceState::UpdatedNeedReboot
            }
            ExitCode::Cancelled => {
                // A stopped attempt leaves no trace.
                info!("Update attempt cancelled");
                inner.new_version = String::new();
                inner.new_size = 0;
                ServiceState::Idle
            }
            kind => {
                warn!(kind = %kind, "Update attempt failed");
                ServiceState::ReportingError { kind }
            }
        };
    }
}
