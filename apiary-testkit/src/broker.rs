use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use apiary::broker::{
    Delivery, DeliveryAcker, DeliveryStream, MessageBroker,
};
use apiary::error::{ApiaryError, ApiaryResult};
use apiary::tenant::TenantId;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// In-memory stand-in for the AMQP broker.
///
/// Tracks per-tenant topology, acknowledgement counts, and dead-lettered
/// bodies so tests can assert on broker-side effects.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<TenantId, TenantQueues>,
    broken_topologies: HashSet<TenantId>,
}

struct TenantQueues {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    counters: Arc<QueueCounters>,
}

#[derive(Default)]
struct QueueCounters {
    acked: Mutex<usize>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tenant's queues are currently declared.
    pub fn has_topology(&self, tenant_id: TenantId) -> bool {
        self.inner.lock().queues.contains_key(&tenant_id)
    }

    /// Number of acknowledged deliveries for the tenant.
    pub fn acked_count(&self, tenant_id: TenantId) -> usize {
        self.inner
            .lock()
            .queues
            .get(&tenant_id)
            .map(|queues| *queues.counters.acked.lock())
            .unwrap_or_default()
    }

    /// Bodies nacked without requeue for the tenant.
    pub fn dead_letters(&self, tenant_id: TenantId) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(&tenant_id)
            .map(|queues| queues.counters.dead_letters.lock().clone())
            .unwrap_or_default()
    }

    /// Make topology declaration fail for the tenant until cleared.
    pub fn inject_topology_failure(&self, tenant_id: TenantId) {
        self.inner.lock().broken_topologies.insert(tenant_id);
    }

    /// Clear all injected topology failures.
    pub fn clear_topology_failures(&self) {
        self.inner.lock().broken_topologies.clear();
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn ensure_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<DeliveryStream> {
        let mut state = self.inner.lock();

        if state.broken_topologies.contains(&tenant_id) {
            return Err(ApiaryError::validation(
                "injected topology failure",
            ));
        }

        let queues =
            state.queues.entry(tenant_id).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                TenantQueues {
                    tx,
                    rx: Some(rx),
                    counters: Arc::new(QueueCounters::default()),
                }
            });

        // A consumer may already hold the receiver from a previous run;
        // redeclaring swaps in a fresh channel, ending the old stream.
        let rx = match queues.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                queues.tx = tx;
                rx
            }
        };

        let counters = Arc::clone(&queues.counters);
        let tx = queues.tx.clone();

        let deliveries =
            UnboundedReceiverStream::new(rx).map(move |body| {
                let acker = InMemoryAcker {
                    body: body.clone(),
                    counters: Arc::clone(&counters),
                    requeue_tx: tx.clone(),
                };
                Delivery::new(body, Box::new(acker))
            });

        Ok(DeliveryStream::new(deliveries, None))
    }

    async fn delete_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<()> {
        self.inner.lock().queues.remove(&tenant_id);
        Ok(())
    }

    async fn publish(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
    ) -> ApiaryResult<()> {
        let state = self.inner.lock();
        let queues = state
            .queues
            .get(&tenant_id)
            .ok_or(ApiaryError::NotFound("tenant queue"))?;
        queues
            .tx
            .send(payload.to_vec())
            .map_err(|_| ApiaryError::NotFound("tenant queue"))?;
        Ok(())
    }

    async fn close(&self) -> ApiaryResult<()> {
        Ok(())
    }
}

struct InMemoryAcker {
    body: Vec<u8>,
    counters: Arc<QueueCounters>,
    requeue_tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> ApiaryResult<()> {
        *self.counters.acked.lock() += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> ApiaryResult<()> {
        if requeue {
            let _ = self.requeue_tx.send(self.body);
        } else {
            self.counters.dead_letters.lock().push(self.body);
        }
        Ok(())
    }
}
