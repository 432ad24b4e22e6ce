use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::DeliveryStream;
use crate::metrics;
use crate::pool::WorkerPool;
use crate::shutdown::StopToken;
use crate::tenant::TenantId;

/// In-memory pairing of one tenant's delivery stream and worker pool.
///
/// Acknowledgement policy is ack-on-submit: a delivery is acknowledged the
/// moment the pool accepts it, which trades at-least-once for at-most-once
/// across a process crash. A rejected submission is nacked without requeue
/// and lands in the tenant's dead-letter queue.
pub struct TenantRuntime {
    tenant_id: TenantId,
    pool: Arc<WorkerPool>,
    stop: StopToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TenantRuntime {
    /// Bind the stream to the pool and start pumping deliveries.
    pub fn start(
        tenant_id: TenantId,
        stream: DeliveryStream,
        pool: WorkerPool,
    ) -> Self {
        let pool = Arc::new(pool);
        let stop = StopToken::new();

        let pump = tokio::spawn(pump_loop(
            tenant_id,
            stream,
            Arc::clone(&pool),
            stop.clone(),
        ));

        Self {
            tenant_id,
            pool,
            stop,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// The runtime's worker pool, for resizing.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stop the runtime: cancel the delivery stream first, then drain and
    /// stop the pool. Idempotent.
    pub async fn stop(&self) {
        self.stop.stop();

        if let Some(pump) = self.pump.lock().await.take() {
            match tokio::time::timeout(
                tokio::time::Duration::from_secs(30),
                pump,
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        "delivery pump task failed: {:?}",
                        err
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        "delivery pump did not stop in time"
                    );
                }
            }
        }

        self.pool.stop().await;
    }
}

impl std::fmt::Debug for TenantRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRuntime")
            .field("tenant_id", &self.tenant_id)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

async fn pump_loop(
    tenant_id: TenantId,
    mut stream: DeliveryStream,
    pool: Arc<WorkerPool>,
    stop: StopToken,
) {
    loop {
        tokio::select! {
            _ = stop.stopped() => {
                stream.cancel().await;
                break;
            }
            delivery = stream.next() => {
                let Some(mut delivery) = delivery else {
                    tracing::info!(
                        tenant_id = %tenant_id,
                        "delivery stream ended"
                    );
                    break;
                };

                let body = delivery.take_body();
                match pool.submit(body) {
                    Ok(()) => {
                        if let Err(err) = delivery.ack().await {
                            tracing::warn!(
                                tenant_id = %tenant_id,
                                "failed to ack delivery: {err}"
                            );
                        }
                    }
                    Err(reason) => {
                        tracing::warn!(
                            tenant_id = %tenant_id,
                            %reason,
                            "delivery rejected, sending to dead-letter queue"
                        );
                        metrics::record_message_processed(
                            &tenant_id.to_string(),
                            "dead_lettered",
                        );
                        if let Err(err) = delivery.nack(false).await {
                            tracing::warn!(
                                tenant_id = %tenant_id,
                                "failed to nack delivery: {err}"
                            );
                        }
                    }
                }
            }
        }
    }
    tracing::debug!(tenant_id = %tenant_id, "delivery pump exited");
}
