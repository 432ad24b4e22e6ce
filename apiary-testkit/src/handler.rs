use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apiary::handler::JobHandler;
use apiary::tenant::TenantId;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Configurable handler for integration tests.
///
/// Counts completed jobs, optionally sleeps to simulate work, and can be
/// made to fail every job.
#[derive(Clone, Default)]
pub struct TestHandler {
    delay: Option<Duration>,
    fail: bool,
    processed: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` before completing each job.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail every job after recording it.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of jobs that ran to completion (including failed ones).
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Payloads seen so far, in completion order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    async fn handle(
        &self,
        _tenant_id: TenantId,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.payloads.lock().push(payload.to_vec());
        self.processed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("test handler configured to fail");
        }
        Ok(())
    }
}

/// Handler that panics on every job, for panic-containment tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(
        &self,
        _tenant_id: TenantId,
        _payload: &[u8],
    ) -> anyhow::Result<()> {
        panic!("test handler panicked");
    }
}
