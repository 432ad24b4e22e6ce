use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions,
    BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::warn;

use super::{
    dead_letter_queue_name, primary_queue_name, Delivery, DeliveryAcker,
    DeliveryStream, MessageBroker, StreamCanceller,
};
use crate::error::ApiaryResult;
use crate::tenant::TenantId;

/// RabbitMQ-backed broker adapter.
///
/// The connection is shared for the lifetime of the process; each operation
/// opens its own channel, so a failed channel never poisons the adapter.
pub struct AmqpBroker {
    conn: Connection,
}

impl AmqpBroker {
    /// Connect to the broker at the given AMQP URL.
    pub async fn connect(url: &str) -> ApiaryResult<Self> {
        let conn =
            Connection::connect(url, ConnectionProperties::default()).await?;
        Ok(Self { conn })
    }

    async fn declare_tenant_queues(
        &self,
        channel: &Channel,
        tenant_id: TenantId,
    ) -> ApiaryResult<()> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        // Nacked-without-requeue messages route through the default exchange
        // straight into the tenant's dead-letter queue.
        let mut primary_args = FieldTable::default();
        primary_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        primary_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_queue_name(tenant_id).into()),
        );

        channel
            .queue_declare(
                &primary_queue_name(tenant_id),
                options,
                primary_args,
            )
            .await?;
        channel
            .queue_declare(
                &dead_letter_queue_name(tenant_id),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("status", &self.conn.status().state())
            .finish()
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn ensure_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<DeliveryStream> {
        let channel = self.conn.create_channel().await?;
        self.declare_tenant_queues(&channel, tenant_id).await?;

        let consumer_tag = format!("consumer_{}", tenant_id);
        let consumer = channel
            .basic_consume(
                &primary_queue_name(tenant_id),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.filter_map(move |item| async move {
            match item {
                Ok(delivery) => {
                    let lapin::message::Delivery { data, acker, .. } =
                        delivery;
                    Some(Delivery::new(data, Box::new(AmqpAcker { acker })))
                }
                Err(err) => {
                    warn!("delivery error on tenant queue: {err}");
                    None
                }
            }
        });

        Ok(DeliveryStream::new(
            deliveries,
            Some(Box::new(AmqpCanceller {
                channel,
                consumer_tag,
            })),
        ))
    }

    async fn delete_tenant_topology(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<()> {
        let channel = self.conn.create_channel().await?;

        for name in [
            primary_queue_name(tenant_id),
            dead_letter_queue_name(tenant_id),
        ] {
            if let Err(err) = channel
                .queue_delete(&name, QueueDeleteOptions::default())
                .await
            {
                warn!("failed to delete queue {name}: {err}");
            }
        }

        if let Err(err) = channel.close(200, "topology deleted").await {
            warn!("failed to close channel after queue deletion: {err}");
        }
        Ok(())
    }

    async fn publish(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
    ) -> ApiaryResult<()> {
        let channel = self.conn.create_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        channel
            .basic_publish(
                "",
                &primary_queue_name(tenant_id),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        if let Err(err) = channel.close(200, "publish complete").await {
            warn!("failed to close publish channel: {err}");
        }
        Ok(())
    }

    async fn close(&self) -> ApiaryResult<()> {
        self.conn.close(200, "shutting down").await?;
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> ApiaryResult<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> ApiaryResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

struct AmqpCanceller {
    channel: Channel,
    consumer_tag: String,
}

#[async_trait]
impl StreamCanceller for AmqpCanceller {
    async fn cancel(self: Box<Self>) {
        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!("failed to cancel consumer {}: {err}", self.consumer_tag);
        }
        if let Err(err) = self.channel.close(200, "consumer stopped").await {
            warn!("failed to close consumer channel: {err}");
        }
    }
}
