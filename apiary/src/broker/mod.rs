use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::ApiaryResult;
use crate::shutdown::StopToken;
use crate::tenant::TenantId;

/// AMQP-backed broker implementation.
pub mod amqp;

pub use amqp::AmqpBroker;

/// Name of a tenant's primary queue.
///
/// Tenant ids render as hyphenated UUIDs, so derived names contain only
/// `[0-9a-f_-]` and are safe to pass to the broker verbatim.
pub fn primary_queue_name(tenant_id: TenantId) -> String {
    format!("tenant_{}_queue", tenant_id)
}

/// Name of a tenant's dead-letter queue.
pub fn dead_letter_queue_name(tenant_id: TenantId) -> String {
    format!("tenant_{}_dlq", tenant_id)
}

/// Trait for broker backends that manage per-tenant queue topology.
///
/// Implementors own the connection and reconnection policy; callers open
/// one delivery stream per tenant and route publishes by tenant id.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotently declare the tenant's primary and dead-letter queues and
    /// open a manual-acknowledgement consumer on the primary queue.
    ///
    /// Re-invocation for an existing tenant succeeds without duplicating
    /// topology; this is what makes startup recovery safe.
    async fn ensure_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<DeliveryStream>;

    /// Delete the tenant's queues. Best-effort: failures are logged by the
    /// implementation and not surfaced, since the broker may already have
    /// pruned them.
    async fn delete_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<()>;

    /// Publish a durable JSON payload onto the tenant's primary queue.
    async fn publish(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
    ) -> ApiaryResult<()>;

    /// Terminate the underlying broker session.
    async fn close(&self) -> ApiaryResult<()>;
}

/// One message drawn from a tenant queue, awaiting acknowledgement.
pub struct Delivery {
    /// Raw message body.
    pub body: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn DeliveryAcker>) -> Self {
        Self { body, acker }
    }

    /// Take the body out of the delivery, leaving it empty.
    ///
    /// The acknowledgement methods do not need the body, so the consumer can
    /// move it into the pool without copying.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Acknowledge the message.
    pub async fn ack(self) -> ApiaryResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the message. With `requeue` false the broker
    /// routes it to the tenant's dead-letter queue.
    pub async fn nack(self, requeue: bool) -> ApiaryResult<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Backend-specific acknowledgement for a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send {
    async fn ack(self: Box<Self>) -> ApiaryResult<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> ApiaryResult<()>;
}

/// Backend-specific consumer cancellation, invoked once when a stream is
/// cancelled.
#[async_trait]
pub trait StreamCanceller: Send {
    async fn cancel(self: Box<Self>);
}

/// A cancellable sequence of deliveries from one tenant queue.
///
/// `next` yields deliveries until the stream is cancelled or the underlying
/// consumer terminates; after cancellation it returns `None` promptly even
/// if the backend is mid-poll.
pub struct DeliveryStream {
    inner: Pin<Box<dyn Stream<Item = Delivery> + Send>>,
    stop: StopToken,
    canceller: Option<Box<dyn StreamCanceller>>,
}

impl DeliveryStream {
    pub fn new(
        inner: impl Stream<Item = Delivery> + Send + 'static,
        canceller: Option<Box<dyn StreamCanceller>>,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            stop: StopToken::new(),
            canceller,
        }
    }

    /// Next delivery, or `None` once the stream is cancelled or exhausted.
    pub async fn next(&mut self) -> Option<Delivery> {
        tokio::select! {
            _ = self.stop.stopped() => None,
            delivery = self.inner.next() => delivery,
        }
    }

    /// Cancel the stream. Subsequent `next` calls return `None`.
    pub async fn cancel(&mut self) {
        self.stop.stop();
        if let Some(canceller) = self.canceller.take() {
            canceller.cancel().await;
        }
    }
}

impl std::fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("cancelled", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}
