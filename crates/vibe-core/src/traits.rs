//! Small cross-cutting traits shared by the engine crate.

use async_trait::async_trait;

use crate::error::OrchestratorResult;

/// Implemented by long-running components (the Execution Coordinator's tick
/// loop, the Adaptive Timeout Manager) so an embedding application can poll
/// their liveness without this crate owning an HTTP surface itself.
#[async_trait]
pub trait HealthCheck
where
    Self: Send + Sync,
{
    async fn check(&self) -> OrchestratorResult<HealthStatus>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            details: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_has_no_message() {
        let status = HealthStatus::healthy();
        assert!(status.healthy);
        assert!(status.message.is_none());
    }

    #[test]
    fn unhealthy_carries_message() {
        let status = HealthStatus::unhealthy("tick loop stalled");
        assert!(!status.healthy);
        assert_eq!(status.message.unwrap(), "tick loop stalled");
    }

    #[test]
    fn with_details_attaches_json() {
        let status = HealthStatus::healthy().with_details(serde_json::json!({"in_flight": 3}));
        assert!(status.details.is_some());
    }
}
