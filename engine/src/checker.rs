//! Update check: asks the update server whether a newer payload exists and
//! turns the answer into an install plan.
//!
//! The server protocol is deliberately thin here; everything downstream
//! only ever sees the install plan.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::hash::decode_digest;
use crate::plan::InstallPlan;
use crate::probe::SlotProber;

/// A positive update-check answer: the version on offer and the plan that
/// fetches and places it.
#[derive(Debug, Clone)]
pub struct CheckedUpdate {
    pub version: String,
    pub plan: InstallPlan,
}

/// The update-check collaborator, modeled by its output contract.
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// `Ok(None)` means the system is up to date.
    async fn check(&self) -> Result<Option<CheckedUpdate>>;
}

/// Response document served by the update server.
#[derive(Debug, Deserialize)]
struct UpdateResponse {
    version: String,
    url: String,
    size_bytes: u64,
    /// Base64 of the raw SHA-256 payload digest.
    sha256_b64: String,
    #[serde(default = "default_full_update")]
    full_update: bool,
}

fn default_full_update() -> bool {
    true
}

/// Production checker against the HTTP update server.
pub struct ManifestChecker {
    client: reqwest::Client,
    server_url: String,
    group: String,
    current_version: String,
    session_id: Uuid,
    prober: Arc<dyn SlotProber>,
}

impl ManifestChecker {
    pub fn new(
        server_url: impl Into<String>,
        group: impl Into<String>,
        current_version: impl Into<String>,
        prober: Arc<dyn SlotProber>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            server_url: server_url.into(),
            group: group.into(),
            current_version: current_version.into(),
            session_id: Uuid::new_v4(),
            prober,
        }
    }

    fn build_plan(&self, response: &UpdateResponse) -> Result<InstallPlan> {
        let payload_hash = decode_digest(&response.sha256_b64)
            .context("update response carries an undecodable payload digest")?;
        if payload_hash.len() != 32 {
            bail!(
                "update response digest has {} bytes, expected 32",
                payload_hash.len()
            );
        }

        let install_path: PathBuf = self
            .prober
            .inactive_partition()
            .context("resolving the inactive partition slot")?;

        Ok(InstallPlan::new(
            response.full_update,
            response.url.clone(),
            response.size_bytes,
            payload_hash,
            install_path,
        ))
    }
}

#[async_trait]
impl UpdateChecker for ManifestChecker {
    #[instrument(skip(self))]
    async fn check(&self) -> Result<Option<CheckedUpdate>> {
        let url = format!(
            "{}/v1/update?group={}&session={}",
            self.server_url, self.group, self.session_id
        );

        info!(url = %url, "Checking for updates");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to update server")?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Update server returned error {}: {}", status, body);
        }

        let manifest: UpdateResponse = response
            .json()
            .await
            .context("Failed to parse update response")?;

        if manifest.version == self.current_version {
            info!(version = %manifest.version, "Already running the offered version");
            return Ok(None);
        }

        info!(
            version = %manifest.version,
            size = manifest.size_bytes,
            "Update available"
        );

        let plan = self.build_plan(&manifest)?;
        Ok(Some(CheckedUpdate { version: manifest.version, plan }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{encode_digest, HashCalculator};
    use crate::probe::StaticSlotProber;

    fn checker_with_static_prober() -> ManifestChecker {
        ManifestChecker::new(
            "http://updates.invalid",
            "stable",
            "1.0.0",
            Arc::new(StaticSlotProber::new("USR-A", "/dev/vda4")),
        )
    }

    #[test]
    fn test_build_plan_targets_inactive_slot() {
        let digest = HashCalculator::hash_of_bytes(b"payload");
        let response = UpdateResponse {
            version: "1.1.0".to_string(),
            url: "http://updates.invalid/payload.bin".to_string(),
            size_bytes: 7,
            sha256_b64: encode_digest(&digest),
            full_update: true,
        };

        let plan = checker_with_static_prober().build_plan(&response).unwrap();
        assert_eq!(plan.install_path, PathBuf::from("/dev/vda4"));
        assert_eq!(plan.payload_hash, digest);
        assert_eq!(plan.payload_size, 7);
        assert!(plan.is_full_update);
    }

    #[test]
    fn test_build_plan_rejects_bad_digest() {
        let response = UpdateResponse {
            version: "1.1.0".to_string(),
            url: "http://updates.invalid/payload.bin".to_string(),
            size_bytes: 7,
            sha256_b64: "not!valid!base64!".to_string(),
            full_update: true,
        };

        assert!(checker_with_static_prober().build_plan(&response).is_err());
    }

    #[test]
    fn test_build_plan_rejects_short_digest() {
        let response = UpdateResponse {
            version: "1.1.0".to_string(),
            url: "http://updates.invalid/payload.bin".to_string(),
            size_bytes: 7,
            sha256_b64: encode_digest(b"short"),
            full_update: true,
        };

        assert!(checker_with_static_prober().build_plan(&response).is_err());
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "version": "2584.0.0",
            "url": "https://updates.invalid/payloads/2584.0.0.bin",
            "size_bytes": 268435456,
            "sha256_b64": "3q2+7wAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        }"#;

        let response: UpdateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.version, "2584.0.0");
        assert!(response.full_update);
    }
}
