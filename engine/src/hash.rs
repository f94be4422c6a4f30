//! Incremental payload hashing.
//!
//! The engine verifies every payload by hashing the byte stream as it is
//! received and comparing the final digest against the install plan. The
//! update server transports digests as base64 of the raw SHA-256 bytes.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Incremental SHA-256 over a payload byte stream.
#[derive(Default)]
pub struct HashCalculator {
    hasher: Sha256,
}

impl HashCalculator {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Feed the next run of payload bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Pre-feed the calculator from the first `limit` bytes of an existing
    /// file. Used when resuming a transfer so the final digest still covers
    /// the whole payload.
    pub async fn update_from_file(&mut self, path: &Path, limit: u64) -> std::io::Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; 64 * 1024];
        let mut remaining = limit;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buffer[..n]);
            remaining -= n as u64;
        }

        Ok(limit - remaining)
    }

    /// Finish the digest and return the raw bytes.
    pub fn finalize(self) -> Vec<u8> {
        self.hasher.finalize().to_vec()
    }

    /// Digest of a complete in-memory buffer.
    pub fn hash_of_bytes(data: &[u8]) -> Vec<u8> {
        let mut calc = Self::new();
        calc.update(data);
        calc.finalize()
    }
}

/// Encode a raw digest the way the update server transports it.
pub fn encode_digest(digest: &[u8]) -> String {
    BASE64.encode(digest)
}

/// Decode a wire-encoded digest back to raw bytes.
pub fn decode_digest(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_of_bytes_matches_known_vector() {
        // sha256("abc")
        let digest = HashCalculator::hash_of_bytes(b"abc");
        assert_eq!(
            hex::encode(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_equals_oneshot() {
        let mut calc = HashCalculator::new();
        calc.update(b"hello ");
        calc.update(b"world");
        assert_eq!(calc.finalize(), HashCalculator::hash_of_bytes(b"hello world"));
    }

    #[test]
    fn test_digest_round_trip() {
        let digest = HashCalculator::hash_of_bytes(b"payload");
        let encoded = encode_digest(&digest);
        assert_eq!(decode_digest(&encoded).unwrap(), digest);
    }

    #[tokio::test]
    async fn test_update_from_file_respects_limit() {
        let mut scratch = tempfile::NamedTempFile::new().unwrap();
        scratch.write_all(b"0123456789").unwrap();

        let mut calc = HashCalculator::new();
        let fed = calc.update_from_file(scratch.path(), 4).await.unwrap();
        assert_eq!(fed, 4);
        assert_eq!(calc.finalize(), HashCalculator::hash_of_bytes(b"0123"));
    }
}
