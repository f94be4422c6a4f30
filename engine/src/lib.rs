//! # coreup update engine
//!
//! Core of the A/B system updater: a staged, resumable, cancellable
//! pipeline that fetches an update payload, verifies its identity, writes
//! it to the inactive partition slot, and hands off to the post-install
//! finalizer that arms the bootloader to try the new slot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   InstallPlan   ┌──────────────┐   InstallPlan   ┌──────────────┐
//! │ UpdateChecker│ ───────────────►│ DownloadStage│ ───────────────►│ FinalizeStage│
//! └──────────────┘                 └──────────────┘                 └──────────────┘
//!        ▲                                │                               │
//!        │          UpdateService drives the pipeline and exposes        │
//!        └────────── status/control through the Manager surface ─────────┘
//! ```

pub mod checker;
pub mod cli;
pub mod config;
pub mod download;
pub mod fetcher;
pub mod finalize;
pub mod hash;
pub mod manager;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod service;
pub mod writer;

pub use checker::{CheckedUpdate, ManifestChecker, UpdateChecker};
pub use config::EngineConfig;
pub use download::{DownloadDelegate, DownloadStage};
pub use fetcher::{Chunk, FetchError, HttpFetcher, MockPayloadFetcher, PayloadFetcher, CHUNK_MAX};
pub use finalize::{FinalizeStage, Finalizer, PostinstFinalizer};
pub use hash::HashCalculator;
pub use manager::Manager;
pub use pipeline::{
    ExitCode, ObjectFeederStage, Pipeline, PipelineBuilder, PipelineHandle, PipelineHooks, Stage,
    StageContext,
};
pub use plan::InstallPlan;
pub use probe::{CmdlineSlotProber, SlotProber, StaticSlotProber};
pub use service::{ServiceState, StatusSnapshot, UpdateService};
pub use writer::{BufferedFileWriter, DirectFileWriter, FaultInjectingWriter, FileWriter};
