//! Bus-facing manager surface.
//!
//! The updater is controlled over the system bus as the
//! `com.coreos.update1.Manager` object. The bus binding and its access
//! policy live at the process boundary; this adapter is the method surface
//! that binding calls into.

use std::sync::Arc;

use crate::service::UpdateService;

/// Well-known bus name the daemon claims.
pub const BUS_SERVICE: &str = "com.coreos.update1";
/// Interface exposing the updater's control methods.
pub const BUS_INTERFACE: &str = "com.coreos.update1.Manager";

/// Method surface of the manager object.
pub struct Manager {
    service: Arc<UpdateService>,
}

impl Manager {
    pub fn new(service: Arc<UpdateService>) -> Self {
        Self { service }
    }

    /// `AttemptUpdate()`: starts a check when idle, otherwise a no-op.
    pub fn attempt_update(&self) {
        self.service.attempt_update();
    }

    /// `ResetStatus()`: clears a terminal state back to idle. Idempotent.
    pub fn reset_status(&self) {
        self.service.reset_status();
    }

    /// `GetStatus()` wire tuple:
    /// `(last_checked_unix_s, progress_0_to_1, current_state, new_version,
    /// new_size_bytes)`.
    pub fn get_status(&self) -> (i64, f64, String, String, u64) {
        let snapshot = self.service.get_status();
        (
            snapshot.last_checked_unix_s,
            snapshot.progress,
            snapshot.state.as_str().to_string(),
            snapshot.new_version,
            snapshot.new_size_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckedUpdate, UpdateChecker};
    use crate::finalize::Finalizer;
    use crate::pipeline::ExitCode;
    use crate::plan::InstallPlan;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NoUpdate;

    #[async_trait]
    impl UpdateChecker for NoUpdate {
        async fn check(&self) -> Result<Option<CheckedUpdate>> {
            Ok(None)
        }
    }

    struct NeverRuns;

    #[async_trait]
    impl Finalizer for NeverRuns {
        async fn finalize(&self, _plan: &InstallPlan) -> Result<(), ExitCode> {
            Err(ExitCode::Internal)
        }
    }

    #[tokio::test]
    async fn test_get_status_tuple_shape() {
        let service = Arc::new(UpdateService::new(Arc::new(NoUpdate), Arc::new(NeverRuns)));
        let manager = Manager::new(service.clone());

        let (last_checked, progress, state, version, size) = manager.get_status();
        assert_eq!(last_checked, 0);
        assert_eq!(progress, 0.0);
        assert_eq!(state, "UPDATE_STATUS_IDLE");
        assert!(version.is_empty());
        assert_eq!(size, 0);

        manager.attempt_update();
        service.wait_until_settled().await;

        let (last_checked, _, state, _, _) = manager.get_status();
        assert!(last_checked > 0);
        assert_eq!(state, "UPDATE_STATUS_IDLE");
    }
}
