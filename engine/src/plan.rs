//! Install plan: the immutable descriptor of one update application.
//!
//! Produced by the update checker, consumed by the download stage, and
//! re-emitted unchanged so downstream stages (finalization) can read it.

use std::fmt;
use std::path::PathBuf;

/// Everything the pipeline needs to know to fetch, verify, and place an
/// update payload. Construct once, never mutate.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Whether this payload is a full image (as opposed to a delta).
    pub is_full_update: bool,
    /// Where to fetch the payload from.
    pub url: String,
    /// Expected number of payload bytes for this transfer.
    pub payload_size: u64,
    /// Expected SHA-256 digest of the payload byte stream (raw bytes).
    pub payload_hash: Vec<u8>,
    /// Where the payload is written: a file path or the inactive slot's
    /// block device.
    pub install_path: PathBuf,
}

impl InstallPlan {
    pub fn new(
        is_full_update: bool,
        url: impl Into<String>,
        payload_size: u64,
        payload_hash: Vec<u8>,
        install_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            is_full_update,
            url: url.into(),
            payload_size,
            payload_hash,
            install_path: install_path.into(),
        }
    }

    /// Short hex prefix of the expected digest, for log lines.
    pub fn short_hash(&self) -> String {
        let prefix: Vec<u8> = self.payload_hash.iter().copied().take(6).collect();
        hex::encode(prefix)
    }
}

impl fmt::Debug for InstallPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallPlan")
            .field("is_full_update", &self.is_full_update)
            .field("url", &self.url)
            .field("payload_size", &self.payload_size)
            .field("payload_hash", &self.short_hash())
            .field("install_path", &self.install_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        let plan = InstallPlan::new(false, "http://e/u", 3, vec![0xde, 0xad, 0xbe, 0xef], "/tmp/x");
        assert_eq!(plan.short_hash(), "deadbeef");
    }

    #[test]
    fn test_debug_does_not_dump_full_hash() {
        let plan = InstallPlan::new(true, "http://e/u", 10, vec![0xab; 32], "/dev/null");
        let rendered = format!("{:?}", plan);
        assert!(rendered.contains("ababab"));
        assert!(!rendered.contains(&"ab".repeat(32)));
    }
}
