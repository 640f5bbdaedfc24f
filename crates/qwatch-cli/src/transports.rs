//! Production `EventSource` adapters (spec.md §1, §4.1): the one place this
//! binary consumes the out-of-scope broker client library directly. Both
//! adapters decode each message's payload as the event JSON object spec.md
//! §6 documents as the wire contract — unwrapping whatever envelope the
//! transport itself adds is the broker client library's job, not the
//! exporter's.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use qwatch_core::{Event, ExporterError};
use qwatch_events::source::{EventSource, EventStream};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Strip user/password from a connection URL before it ever reaches a log
/// line.
fn scrub_credentials(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw) else {
        return "<unparseable-broker-url>".to_string();
    };
    let _ = url.set_password(None);
    let _ = url.set_username("");
    url.to_string()
}

/// Redis and Sentinel transports: events are published by the broker on a
/// well-known pub/sub channel (the transport's simulation of the topic
/// exchange a full AMQP-style event bus would use).
pub struct RedisEventSource {
    client: redis::Client,
    channel: String,
    pidbox_channel: String,
    display_uri: String,
}

impl RedisEventSource {
    pub fn connect(url: &str, namespace: &str) -> Result<Self, ExporterError> {
        let client = redis::Client::open(url).map_err(|e| ExporterError::broker_control(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            channel: format!("{namespace}ev"),
            pidbox_channel: format!("{namespace}pidbox"),
            display_uri: scrub_credentials(url),
        })
    }
}

#[async_trait]
impl EventSource for RedisEventSource {
    async fn capture(&self, wakeup: bool) -> Result<EventStream, ExporterError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis subscribe({}) failed: {e}", self.channel)))?;

        if wakeup {
            let client = self.client.clone();
            let pidbox_channel = self.pidbox_channel.clone();
            tokio::spawn(async move {
                let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
                    return;
                };
                let command = serde_json::json!({"method": "heartbeat", "arguments": {}}).to_string();
                let _: Result<(), _> = conn.publish(&pidbox_channel, command).await;
            });
        }

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, "malformed redis pub/sub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Event>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "dropping undecodable event message"),
                }
            }
        });

        Ok(EventStream::new(rx))
    }

    fn display_uri(&self) -> String {
        self.display_uri.clone()
    }
}

/// AMQP-family transports: events are published to a non-durable topic
/// exchange; a fresh exclusive queue bound with the catch-all routing key
/// `#` captures every event kind.
pub struct AmqpEventSource {
    connection: lapin::Connection,
    exchange: String,
    display_uri: String,
}

impl AmqpEventSource {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, ExporterError> {
        let options = lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = lapin::Connection::connect(url, options)
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp connect failed: {e}")))?;
        Ok(Self {
            connection,
            exchange: format!("{namespace}ev"),
            display_uri: scrub_credentials(url),
        })
    }
}

#[async_trait]
impl EventSource for AmqpEventSource {
    async fn capture(&self, wakeup: bool) -> Result<EventStream, ExporterError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp channel open failed: {e}")))?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ExporterError::broker_control(format!("exchange.declare({}) failed: {e}", self.exchange)))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ExporterError::broker_control(format!("event queue.declare failed: {e}")))?;
        let queue_name = queue.name().to_string();

        channel
            .queue_bind(&queue_name, &self.exchange, "#", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ExporterError::broker_control(format!("queue.bind({queue_name}) failed: {e}")))?;

        if wakeup {
            let _ = channel
                .basic_publish(
                    &self.exchange,
                    "mingle",
                    BasicPublishOptions::default(),
                    serde_json::json!({"method": "heartbeat", "arguments": {}}).to_string().as_bytes(),
                    lapin::BasicProperties::default(),
                )
                .await;
        }

        let consumer = channel
            .basic_consume(&queue_name, "event-receiver", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ExporterError::broker_control(format!("basic.consume({queue_name}) failed: {e}")))?;

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else {
                    warn!("amqp event consumer error");
                    break;
                };
                match serde_json::from_slice::<Event>(&delivery.data) {
                    Ok(event) => {
                        let _ = delivery.ack(lapin::options::BasicAckOptions::default()).await;
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "dropping undecodable event message");
                        let _ = delivery.ack(lapin::options::BasicAckOptions::default()).await;
                    }
                }
            }
        });

        Ok(EventStream::new(rx))
    }

    fn display_uri(&self) -> String {
        self.display_uri.clone()
    }
}
