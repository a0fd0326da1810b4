use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use postrelay_common::config::BrokerConfig;
use postrelay_common::Signal;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::QueueError;
use crate::message::MailMessage;
use crate::retry::{retry_count_from_headers, retry_delay, MAX_BROKER_RETRIES};

const CONNECT_DEADLINE: Duration = Duration::from_secs(20);
const PUBLISH_DEADLINE: Duration = Duration::from_secs(10);
const PREFETCH: u16 = 10;
const MAIN_QUEUE_TTL_MS: i32 = 24 * 60 * 60 * 1000;

/// How the delivery handler disposed of a message. Only transient failures
/// are eligible for the delay-queue retry path; permanent failures and
/// poison messages are dropped to the dead-letter topology.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The message could not be decoded, or the handler panicked.
    #[error("poison message: {0}")]
    Poison(String),
}

impl ConsumeError {
    const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Process-wide broker handle. Initialized once at startup, shared by the
/// ingress server and the delivery workers; all operations are safe to call
/// concurrently.
pub struct Broker {
    connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
    routing_key: String,
}

impl Broker {
    /// Connect to the broker and declare the full topology. Declarations
    /// are idempotent; reconnecting re-runs them before any publish or
    /// consume resumes.
    ///
    /// # Errors
    /// Returns an error if the broker is unreachable or a declaration is
    /// rejected.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, QueueError> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::default())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = timeout(CONNECT_DEADLINE, Connection::connect(&config.url, options))
            .await
            .map_err(|_| QueueError::Deadline(CONNECT_DEADLINE))??;

        connection.on_error(|err| {
            error!("broker connection broken: {err}");
        });

        let channel = connection.create_channel().await?;

        let broker = Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            routing_key: config.routing_key.clone(),
        };

        broker.declare_topology().await?;

        info!(exchange = %broker.exchange, queue = %broker.queue, "broker topology ready");
        Ok(broker)
    }

    fn dlx_name(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    fn delay_queue_name(&self) -> String {
        format!("{}.delay", self.queue)
    }

    fn failed_queue_name(&self) -> String {
        format!("{}.failed", self.queue)
    }

    /// Declare the exchange, the main queue, the delay (parking) queue, and
    /// the dead-letter exchange with its failed queue. Safe to re-run.
    ///
    /// # Errors
    /// Returns an error if any declaration is rejected.
    pub async fn declare_topology(&self) -> Result<(), QueueError> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .exchange_declare(
                self.exchange.as_str(),
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;

        // Main queue: bounded by a 24h TTL; expired or dropped messages
        // dead-letter into the failed queue.
        let mut main_args = FieldTable::default();
        main_args.insert("x-message-ttl".into(), AMQPValue::LongInt(MAIN_QUEUE_TTL_MS));
        main_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dlx_name().into()),
        );
        main_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString("failed".into()),
        );

        let queue_options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .queue_declare(self.queue.as_str(), queue_options, main_args)
            .await?;
        self.channel
            .queue_bind(
                self.queue.as_str(),
                self.exchange.as_str(),
                self.routing_key.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Dead-letter exchange and the terminal failed queue.
        self.channel
            .exchange_declare(
                self.dlx_name().as_str(),
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_declare(
                self.failed_queue_name().as_str(),
                queue_options,
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_bind(
                self.failed_queue_name().as_str(),
                self.dlx_name().as_str(),
                "failed",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Delay queue: no consumers, no exchange binding. Parked messages
        // expire per-message and dead-letter back onto the main exchange.
        let mut delay_args = FieldTable::default();
        delay_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.exchange.clone().into()),
        );
        delay_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.routing_key.clone().into()),
        );
        self.channel
            .queue_declare(self.delay_queue_name().as_str(), queue_options, delay_args)
            .await?;

        Ok(())
    }

    fn base_properties(message: &MailMessage, broker_message_id: &str) -> BasicProperties {
        BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_priority(message.priority)
            .with_message_id(broker_message_id.into())
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
    }

    /// Publish a message to the main queue.
    ///
    /// # Errors
    /// Returns an error if serialization fails or the broker refuses the
    /// publish within its deadline.
    pub async fn publish(
        &self,
        message: &MailMessage,
        broker_message_id: &str,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(message)?;

        timeout(
            PUBLISH_DEADLINE,
            self.channel.basic_publish(
                self.exchange.as_str(),
                self.routing_key.as_str(),
                BasicPublishOptions::default(),
                &payload,
                Self::base_properties(message, broker_message_id),
            ),
        )
        .await
        .map_err(|_| QueueError::Deadline(PUBLISH_DEADLINE))??;

        info!(
            mail_log_id = message.mail_log_id,
            broker_message_id,
            priority = message.priority,
            "message enqueued"
        );
        Ok(())
    }

    /// Park a message in the delay queue. After `delay` the broker
    /// dead-letters it back onto the main queue for redelivery with the
    /// bumped `retry-count` header.
    ///
    /// # Errors
    /// Returns an error if serialization fails or the broker refuses the
    /// publish within its deadline.
    pub async fn publish_delayed(
        &self,
        message: &MailMessage,
        broker_message_id: &str,
        delay: Duration,
        retry_count: u32,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(message)?;

        let mut headers = FieldTable::default();
        headers.insert(
            "retry-count".into(),
            AMQPValue::LongInt(i32::try_from(retry_count).unwrap_or(i32::MAX)),
        );

        let properties = Self::base_properties(message, broker_message_id)
            .with_expiration(delay.as_millis().to_string().into())
            .with_headers(headers);

        // Published through the default exchange straight to the delay
        // queue, which has no consumers.
        timeout(
            PUBLISH_DEADLINE,
            self.channel.basic_publish(
                "",
                self.delay_queue_name().as_str(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            ),
        )
        .await
        .map_err(|_| QueueError::Deadline(PUBLISH_DEADLINE))??;

        info!(
            mail_log_id = message.mail_log_id,
            retry_count,
            delay_secs = delay.as_secs(),
            "message parked for retry"
        );
        Ok(())
    }

    /// Consume the main queue until shutdown, invoking `handler` once per
    /// delivery. Acknowledgment is manual: a successful handler acks; a
    /// transient failure under the retry budget re-publishes a copy to the
    /// delay queue before the original is nacked without requeue; permanent
    /// and poison outcomes are nacked without requeue so only the
    /// dead-letter topology sees them again.
    ///
    /// # Errors
    /// Returns an error if the subscription itself fails.
    pub async fn consume<F, Fut>(
        &self,
        consumer_tag: &str,
        mut shutdown: broadcast::Receiver<Signal>,
        handler: F,
    ) -> Result<(), QueueError>
    where
        F: Fn(MailMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), ConsumeError>>,
    {
        self.channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                self.queue.as_str(),
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(consumer_tag, queue = %self.queue, "consuming");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(consumer_tag, "cancelling consumer");
                    self.channel
                        .basic_cancel(consumer_tag, BasicCancelOptions::default())
                        .await?;
                    return Ok(());
                }
                next = consumer.next() => {
                    let Some(delivery) = next else {
                        return Ok(());
                    };
                    let delivery = delivery?;

                    let message: MailMessage = match serde_json::from_slice(&delivery.data) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(%err, "dropping undecodable message");
                            delivery
                                .nack(BasicNackOptions { requeue: false, ..Default::default() })
                                .await?;
                            continue;
                        }
                    };

                    let broker_message_id = delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string())
                        .unwrap_or_default();

                    match handler(message.clone()).await {
                        Ok(()) => {
                            delivery.ack(BasicAckOptions::default()).await?;
                        }
                        Err(outcome) => {
                            warn!(
                                mail_log_id = message.mail_log_id,
                                %outcome,
                                "delivery handler failed"
                            );

                            if outcome.is_retryable() {
                                let retries =
                                    retry_count_from_headers(delivery.properties.headers().as_ref());
                                if retries < MAX_BROKER_RETRIES {
                                    if let Err(err) = self
                                        .publish_delayed(
                                            &message,
                                            &broker_message_id,
                                            retry_delay(retries),
                                            retries + 1,
                                        )
                                        .await
                                    {
                                        error!(%err, "failed to park message for retry");
                                    }
                                } else {
                                    warn!(
                                        mail_log_id = message.mail_log_id,
                                        "retry budget exhausted, routing to dead letter"
                                    );
                                }
                            }

                            delivery
                                .nack(BasicNackOptions { requeue: false, ..Default::default() })
                                .await?;
                        }
                    }
                }
            }
        }
    }

    /// Close the channel and connection. Called once on shutdown.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the close.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.channel.close(200, "shutting down").await?;
        self.connection.close(200, "shutting down").await?;
        Ok(())
    }
}
