use async_trait::async_trait;

use crate::tenant::TenantId;

/// Trait for the business handler invoked by pool workers.
///
/// Implementors receive the raw delivery body; the message has already been
/// acknowledged by the time the handler runs, so a failure here is terminal
/// for the job (logged, never requeued).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one message payload for the given tenant.
    async fn handle(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
    ) -> anyhow::Result<()>;
}

/// Default handler: parses the payload as JSON and logs it.
///
/// A payload that is not valid JSON is reported as a failed job.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLogHandler;

#[async_trait]
impl JobHandler for JsonLogHandler {
    async fn handle(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let message: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|err| {
                anyhow::anyhow!("failed to parse message payload: {err}")
            })?;
        tracing::info!(%tenant_id, %message, "processing message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_json_is_accepted() {
        let handler = JsonLogHandler;
        let result = handler
            .handle(TenantId::new(), br#"{"message_id":1,"data":"test"}"#)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invalid_json_is_reported_as_failure() {
        let handler = JsonLogHandler;
        let result = handler.handle(TenantId::new(), b"not json").await;
        assert!(result.is_err());
    }
}
