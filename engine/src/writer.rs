//! Payload sinks.
//!
//! A writer owns the open sink handle for the duration of its stage and is
//! released on every exit path. Writes within one transfer are sequential;
//! `seek` exists only so a resumed transfer can start at the right byte
//! position before the first write.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "writer is not open")
}

/// Byte sink with paired open/close.
///
/// `close` is idempotent; on `Ok` every acknowledged byte has been handed
/// to the OS. A writer never silently truncates.
#[async_trait]
pub trait FileWriter: Send {
    async fn open(&mut self, path: &Path) -> io::Result<()>;

    /// Position the sink before the first write of a resumed transfer.
    async fn seek(&mut self, offset: u64) -> io::Result<()>;

    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

/// Writes straight through to a file or block device.
///
/// Opens without truncation so an existing partition device (or a partial
/// file being resumed) keeps its contents outside the written range.
#[derive(Default)]
pub struct DirectFileWriter {
    file: Option<File>,
}

impl DirectFileWriter {
    pub fn new() -> Self {
        Self { file: None }
    }
}

#[async_trait]
impl FileWriter for DirectFileWriter {
    async fn open(&mut self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        self.file = Some(file);
        Ok(())
    }

    async fn seek(&mut self, offset: u64) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(not_open)?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(not_open)?;
        file.write_all(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Buffered variant for payloads written to ordinary files.
#[derive(Default)]
pub struct BufferedFileWriter {
    inner: Option<BufWriter<File>>,
}

impl BufferedFileWriter {
    pub fn new() -> Self {
        Self { inner: None }
    }
}

#[async_trait]
impl FileWriter for BufferedFileWriter {
    async fn open(&mut self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        self.inner = Some(BufWriter::new(file));
        Ok(())
    }

    async fn seek(&mut self, offset: u64) -> io::Result<()> {
        let inner = self.inner.as_mut().ok_or_else(not_open)?;
        inner.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let inner = self.inner.as_mut().ok_or_else(not_open)?;
        inner.write_all(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.flush().await?;
            inner.get_ref().sync_all().await?;
        }
        Ok(())
    }
}

/// Wraps another writer and fails the Nth `write` call (1-based).
///
/// Shipped as library code so fault tests in dependent crates can exercise
/// the download stage's write-error paths.
pub struct FaultInjectingWriter<W> {
    inner: W,
    fail_at_write: usize,
    writes_seen: usize,
}

impl<W: FileWriter> FaultInjectingWriter<W> {
    /// `fail_at_write == 0` disables the fault.
    pub fn new(inner: W, fail_at_write: usize) -> Self {
        Self { inner, fail_at_write, writes_seen: 0 }
    }
}

#[async_trait]
impl<W: FileWriter> FileWriter for FaultInjectingWriter<W> {
    async fn open(&mut self, path: &Path) -> io::Result<()> {
        self.inner.open(path).await
    }

    async fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(offset).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writes_seen += 1;
        if self.fail_at_write != 0 && self.writes_seen == self.fail_at_write {
            return Err(io::Error::other("injected write failure"));
        }
        self.inner.write(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_writer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");

        let mut writer = DirectFileWriter::new();
        writer.open(&path).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");

        let mut writer = DirectFileWriter::new();
        writer.open(&path).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_seek_positions_resumed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut writer = DirectFileWriter::new();
        writer.open(&path).await.unwrap();
        writer.seek(4).await.unwrap();
        writer.write(b"XY").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123XY6789");
    }

    #[tokio::test]
    async fn test_write_before_open_is_rejected() {
        let mut writer = DirectFileWriter::new();
        let err = writer.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_fault_injection_fails_nth_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");

        let mut writer = FaultInjectingWriter::new(DirectFileWriter::new(), 2);
        writer.open(&path).await.unwrap();
        writer.write(b"aa").await.unwrap();
        assert!(writer.write(b"bb").await.is_err());
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"aa");
    }
}
