//! Download stage: fetch, write, and verify one payload.
//!
//! Composes a payload fetcher, a file writer, and the hash calculator under
//! the pipeline contract. The install plan passes through unchanged so the
//! finalization stage can read it.

use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::fetcher::{FetchError, PayloadFetcher};
use crate::hash::HashCalculator;
use crate::pipeline::{ExitCode, Stage, StageContext};
use crate::plan::InstallPlan;
use crate::writer::{DirectFileWriter, FileWriter};

/// Progress observer for one download run.
///
/// `set_download_status(true)` is called exactly once when the transfer
/// becomes active and `set_download_status(false)` exactly once on every
/// exit path after that. `bytes_received(count, progress, total)` carries
/// the chunk size, the absolute end position of the chunk (strictly
/// increasing across calls), and the plan's payload size.
pub trait DownloadDelegate: Send {
    fn set_download_status(&mut self, active: bool);
    fn bytes_received(&mut self, count: u64, progress: u64, total: u64);
}

/// Pipeline stage that downloads and verifies the payload described by the
/// incoming install plan.
pub struct DownloadStage {
    fetcher: Option<Box<dyn PayloadFetcher>>,
    writer: Option<Box<dyn FileWriter>>,
    delegate: Option<Box<dyn DownloadDelegate>>,
    resume_offset: Option<u64>,
}

impl DownloadStage {
    /// Takes unique ownership of the fetcher; the stage releases it on
    /// every exit path.
    pub fn new(fetcher: Box<dyn PayloadFetcher>) -> Self {
        Self {
            fetcher: Some(fetcher),
            writer: None,
            delegate: None,
            resume_offset: None,
        }
    }

    pub fn set_delegate(&mut self, delegate: Box<dyn DownloadDelegate>) {
        self.delegate = Some(delegate);
    }

    /// Inject a writer instead of opening a `DirectFileWriter` at the
    /// plan's install path. Used by fault tests.
    pub fn set_test_writer(&mut self, writer: Box<dyn FileWriter>) {
        self.writer = Some(writer);
    }

    /// Resume an interrupted transfer: the fetcher starts at `offset`, the
    /// sink is positioned there, and the hash state is pre-fed from the
    /// partial file so the final digest covers the whole payload.
    pub fn resume_from(&mut self, offset: u64) {
        self.resume_offset = Some(offset);
    }

    async fn transfer(
        fetcher: &mut dyn PayloadFetcher,
        writer: &mut dyn FileWriter,
        mut hasher: HashCalculator,
        mut delegate: Option<&mut Box<dyn DownloadDelegate>>,
        plan: &InstallPlan,
        resumed_from: u64,
        ctx: &mut StageContext,
    ) -> Result<(), ExitCode> {
        let total = plan.payload_size;
        // A resumed transfer counts the bytes already on disk toward the
        // plan's payload size.
        let mut received: u64 = resumed_from;

        loop {
            tokio::select! {
                biased;

                _ = ctx.wait_cancelled() => {
                    info!("Download cancelled");
                    fetcher.terminate().await;
                    let _ = writer.close().await;
                    return Err(ExitCode::Cancelled);
                }

                next = fetcher.next_chunk() => match next {
                    Ok(Some(chunk)) => {
                        if let Err(e) = writer.write(&chunk.data).await {
                            warn!(error = %e, "Payload write failed");
                            fetcher.terminate().await;
                            let _ = writer.close().await;
                            return Err(ExitCode::DownloadWriteError);
                        }

                        hasher.update(&chunk.data);
                        received += chunk.data.len() as u64;

                        if let Some(d) = delegate.as_deref_mut() {
                            d.bytes_received(chunk.data.len() as u64, chunk.end_offset(), total);
                        }
                    }
                    Ok(None) => {
                        if received != total {
                            warn!(received, expected = total, "Payload size mismatch");
                            let _ = writer.close().await;
                            return Err(ExitCode::DownloadSizeMismatch);
                        }

                        let digest = hasher.finalize();
                        if digest != plan.payload_hash {
                            warn!(
                                expected = %plan.short_hash(),
                                actual = %hex::encode(&digest[..digest.len().min(6)]),
                                "Payload hash mismatch"
                            );
                            let _ = writer.close().await;
                            return Err(ExitCode::DownloadHashMismatch);
                        }

                        if let Err(e) = writer.close().await {
                            warn!(error = %e, "Closing payload sink failed");
                            return Err(ExitCode::DownloadWriteError);
                        }

                        info!(bytes = received, "Payload downloaded and verified");
                        return Ok(());
                    }
                    Err(FetchError::Terminated) => {
                        let _ = writer.close().await;
                        return Err(ExitCode::Cancelled);
                    }
                    Err(e) => {
                        warn!(error = %e, "Transfer failed");
                        let _ = writer.close().await;
                        return Err(ExitCode::DownloadTransportError);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Stage for DownloadStage {
    type Input = InstallPlan;
    type Output = InstallPlan;

    fn name(&self) -> &'static str {
        "download"
    }

    async fn run(
        &mut self,
        plan: InstallPlan,
        ctx: &mut StageContext,
    ) -> Result<InstallPlan, ExitCode> {
        let mut fetcher = self.fetcher.take().ok_or(ExitCode::Internal)?;
        let mut writer = self
            .writer
            .take()
            .unwrap_or_else(|| Box::new(DirectFileWriter::new()));

        if let Err(e) = writer.open(&plan.install_path).await {
            warn!(path = %plan.install_path.display(), error = %e, "Opening payload sink failed");
            return Err(ExitCode::DownloadWriteError);
        }

        let mut hasher = HashCalculator::new();

        if let Some(offset) = self.resume_offset {
            debug!(offset, "Resuming transfer");
            fetcher.set_offset(offset);
            let positioned = writer.seek(offset).await.and(
                match hasher.update_from_file(&plan.install_path, offset).await {
                    Ok(fed) if fed == offset => Ok(()),
                    Ok(_) => Err(std::io::Error::other("partial file shorter than resume offset")),
                    Err(e) => Err(e),
                },
            );
            if let Err(e) = positioned {
                warn!(error = %e, "Resume positioning failed");
                let _ = writer.close().await;
                return Err(ExitCode::DownloadWriteError);
            }
        }

        if let Some(d) = self.delegate.as_mut() {
            d.set_download_status(true);
        }

        let outcome = Self::transfer(
            fetcher.as_mut(),
            writer.as_mut(),
            hasher,
            self.delegate.as_mut(),
            &plan,
            self.resume_offset.unwrap_or(0),
            ctx,
        )
        .await;

        if let Some(d) = self.delegate.as_mut() {
            d.set_download_status(false);
        }

        outcome.map(|()| plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::MockPayloadFetcher;
    use crate::pipeline::{ObjectFeederStage, PipelineBuilder};

    #[tokio::test]
    async fn test_download_writes_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data = b"some payload bytes".to_vec();

        let plan = InstallPlan::new(
            false,
            "",
            data.len() as u64,
            HashCalculator::hash_of_bytes(&data),
            &path,
        );

        let stage = DownloadStage::new(Box::new(MockPayloadFetcher::new(data.clone())));
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(stage)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::Success);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data = b"some payload bytes".to_vec();

        let plan = InstallPlan::new(
            false,
            "",
            data.len() as u64,
            HashCalculator::hash_of_bytes(b"different bytes"),
            &path,
        );

        let stage = DownloadStage::new(Box::new(MockPayloadFetcher::new(data)));
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(stage)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::DownloadHashMismatch);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data = b"short".to_vec();

        let plan = InstallPlan::new(
            false,
            "",
            data.len() as u64 + 1,
            HashCalculator::hash_of_bytes(&data),
            &path,
        );

        let stage = DownloadStage::new(Box::new(MockPayloadFetcher::new(data)));
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(stage)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::DownloadSizeMismatch);
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data = vec![1u8; crate::fetcher::CHUNK_MAX * 2];

        let plan = InstallPlan::new(
            false,
            "",
            data.len() as u64,
            HashCalculator::hash_of_bytes(&data),
            &path,
        );

        let fetcher = MockPayloadFetcher::new(data).fail_after_chunks(1);
        let stage = DownloadStage::new(Box::new(fetcher));
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(stage)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::DownloadTransportError);
    }

    #[tokio::test]
    async fn test_resume_covers_whole_payload_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data = b"0123456789".to_vec();

        // First half already on disk from an interrupted run.
        std::fs::write(&path, &data[..5]).unwrap();

        let plan = InstallPlan::new(
            false,
            "",
            data.len() as u64,
            HashCalculator::hash_of_bytes(&data),
            &path,
        );

        let mut stage = DownloadStage::new(Box::new(MockPayloadFetcher::new(data.clone())));
        stage.resume_from(5);
        let pipeline = PipelineBuilder::new()
            .then(ObjectFeederStage::new(plan))
            .then(stage)
            .build();

        assert_eq!(pipeline.run().await, ExitCode::Success);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
