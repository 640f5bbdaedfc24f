//! Concrete [`QueueIntrospector`] and [`BrokerControl`] implementations for
//! the two transport families spec.md §4.6 distinguishes: Redis-family
//! (`LLEN`, pub/sub-simulated broadcast) and AMQP-family/in-memory (passive
//! queue declaration, pidbox fanout broadcast).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use qwatch_core::ExporterError;
use redis::AsyncCommands;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::control::{ActiveQueuesEntry, BrokerControl, QueueIntrospector, QueueStats, WorkerStatsEntry};

/// How long a control-channel broadcast waits for worker replies before
/// treating the round as complete. Mirrors the default `Inspect` timeout
/// used by broadcast-style control commands.
const DEFAULT_REPLY_WINDOW: Duration = Duration::from_secs(1);

/// Split one broadcast reply's JSON body, `{hostname: payload}`, into its
/// two parts. Every reply to a pidbox-style broadcast carries exactly one
/// key.
fn split_reply(value: JsonValue) -> Option<(String, JsonValue)> {
    let object = value.as_object()?;
    let (hostname, payload) = object.iter().next()?;
    Some((hostname.clone(), payload.clone()))
}

fn pool_processes_from_stats_payload(payload: &JsonValue) -> Vec<String> {
    payload
        .get("pool")
        .and_then(|pool| pool.get("processes"))
        .and_then(JsonValue::as_array)
        .map(|processes| processes.iter().map(|p| p.to_string()).collect())
        .unwrap_or_default()
}

fn queue_names_from_active_queues_payload(payload: &JsonValue) -> Vec<String> {
    payload
        .as_array()
        .map(|queues| {
            queues
                .iter()
                .filter_map(|q| q.get("name").and_then(JsonValue::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Redis and Sentinel transports: a queue is a Redis list, so its depth is
/// simply `LLEN`. Redis has no broker-side consumer-count concept, so
/// `consumer_count` is always `None`.
pub struct RedisIntrospector {
    conn: redis::aio::ConnectionManager,
}

impl RedisIntrospector {
    pub async fn connect(url: &str) -> Result<Self, ExporterError> {
        let client = redis::Client::open(url)
            .map_err(|e| ExporterError::broker_control(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl QueueIntrospector for RedisIntrospector {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, ExporterError> {
        let mut conn = self.conn.clone();
        let length: i64 = conn
            .llen(queue)
            .await
            .map_err(|e| ExporterError::broker_control(format!("LLEN {queue} failed: {e}")))?;
        Ok(QueueStats {
            length: length.max(0) as u64,
            consumer_count: None,
        })
    }
}

/// AMQP-family (and in-memory, which speaks the same passive-declare
/// semantics in this implementation) transports: a passive `queue.declare`
/// returns `message_count` and `consumer_count` without creating the queue.
/// A `NOT_FOUND` channel close means the queue doesn't exist yet — spec.md
/// §4.6 step 4 calls for publishing zeroes rather than propagating an
/// error in that one case.
pub struct AmqpIntrospector {
    channel: lapin::Channel,
}

impl AmqpIntrospector {
    pub async fn connect(url: &str) -> Result<Self, ExporterError> {
        let options = lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = lapin::Connection::connect(url, options)
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp channel open failed: {e}")))?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl QueueIntrospector for AmqpIntrospector {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, ExporterError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        match self.channel.queue_declare(queue, options, FieldTable::default()).await {
            Ok(declared) => Ok(QueueStats {
                length: declared.message_count() as u64,
                consumer_count: Some(declared.consumer_count() as u64),
            }),
            Err(err) if format!("{err}").contains("NOT_FOUND") => Ok(QueueStats {
                length: 0,
                consumer_count: Some(0),
            }),
            Err(err) => Err(ExporterError::broker_control(format!(
                "passive queue.declare({queue}) failed: {err}"
            ))),
        }
    }
}

/// Redis and Sentinel transports' control channel. Redis has no native
/// broadcast RPC, so this mirrors the virtual-transport fanout scheme a
/// Redis-backed message broker uses: a command is `PUBLISH`ed on the
/// well-known pidbox channel, and every online worker publishes its reply
/// back on a fresh per-request reply channel named by a ticket.
pub struct RedisBrokerControl {
    client: redis::Client,
    namespace: String,
    reply_window: Duration,
}

impl RedisBrokerControl {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, ExporterError> {
        let client = redis::Client::open(url)
            .map_err(|e| ExporterError::broker_control(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            reply_window: DEFAULT_REPLY_WINDOW,
        })
    }

    async fn broadcast(&self, method: &str) -> Result<Vec<(String, JsonValue)>, ExporterError> {
        let ticket = Uuid::new_v4();
        let reply_channel = format!("reply.{}pidbox.{ticket}", self.namespace);
        let control_channel = format!("{}pidbox", self.namespace);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(&reply_channel)
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis subscribe({reply_channel}) failed: {e}")))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis connect failed: {e}")))?;
        let command = serde_json::json!({
            "method": method,
            "arguments": {},
            "reply_to": reply_channel,
        });
        let _: () = conn
            .publish(&control_channel, command.to_string())
            .await
            .map_err(|e| ExporterError::broker_control(format!("redis publish({control_channel}) failed: {e}")))?;

        let mut replies = Vec::new();
        let mut stream = pubsub.on_message();
        let deadline = tokio::time::sleep(self.reply_window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if let Ok(value) = serde_json::from_str::<JsonValue>(&payload) {
                        if let Some(reply) = split_reply(value) {
                            replies.push(reply);
                        }
                    }
                }
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl BrokerControl for RedisBrokerControl {
    async fn worker_stats(&self) -> Result<Vec<WorkerStatsEntry>, ExporterError> {
        let replies = self.broadcast("stats").await?;
        Ok(replies
            .into_iter()
            .map(|(hostname, payload)| WorkerStatsEntry {
                pool_processes: pool_processes_from_stats_payload(&payload),
                hostname,
            })
            .collect())
    }

    async fn active_queues(&self) -> Result<Vec<ActiveQueuesEntry>, ExporterError> {
        let replies = self.broadcast("active_queues").await?;
        Ok(replies
            .into_iter()
            .map(|(hostname, payload)| ActiveQueuesEntry {
                queues: queue_names_from_active_queues_payload(&payload),
                hostname,
            })
            .collect())
    }
}

/// AMQP-family transports' control channel: a pidbox broadcast over a
/// fanout exchange, collected on an exclusive reply queue bound by a
/// per-request ticket routing key.
pub struct AmqpBrokerControl {
    channel: lapin::Channel,
    namespace: String,
    reply_window: Duration,
}

impl AmqpBrokerControl {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, ExporterError> {
        let options = lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = lapin::Connection::connect(url, options)
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ExporterError::broker_control(format!("amqp channel open failed: {e}")))?;
        Ok(Self {
            channel,
            namespace: namespace.into(),
            reply_window: DEFAULT_REPLY_WINDOW,
        })
    }

    async fn broadcast(&self, method: &str) -> Result<Vec<(String, JsonValue)>, ExporterError> {
        let ticket = Uuid::new_v4().to_string();
        let control_exchange = format!("{}.pidbox", self.namespace);
        let reply_exchange = format!("reply.{}.pidbox", self.namespace);

        self.channel
            .exchange_declare(&control_exchange, ExchangeKind::Fanout, ExchangeDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ExporterError::broker_control(format!("exchange.declare({control_exchange}) failed: {e}")))?;
        self.channel
            .exchange_declare(
                &reply_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ExporterError::broker_control(format!("exchange.declare({reply_exchange}) failed: {e}")))?;

        let reply_queue = self
            .channel
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
            .map_err(|e| ExporterError::broker_control(format!("reply queue.declare failed: {e}")))?;
        let reply_queue_name = reply_queue.name().to_string();

        self.channel
            .queue_bind(&reply_queue_name, &reply_exchange, &ticket, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ExporterError::broker_control(format!("queue.bind({reply_queue_name}) failed: {e}")))?;

        let body = serde_json::json!({
            "method": method,
            "arguments": {},
            "destination": JsonValue::Null,
        })
        .to_string();
        let properties = BasicProperties::default()
            .with_correlation_id(ticket.clone().into())
            .with_reply_to(ticket.clone().into());
        self.channel
            .basic_publish(&control_exchange, "", BasicPublishOptions::default(), body.as_bytes(), properties)
            .await
            .map_err(|e| ExporterError::broker_control(format!("basic.publish({control_exchange}) failed: {e}")))?
            .await
            .map_err(|e| ExporterError::broker_control(format!("publisher confirm failed: {e}")))?;

        let mut consumer = self
            .channel
            .basic_consume(&reply_queue_name, "control-reply", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| ExporterError::broker_control(format!("basic.consume({reply_queue_name}) failed: {e}")))?;

        let mut replies = Vec::new();
        let deadline = tokio::time::sleep(self.reply_window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    let Ok(delivery) = delivery else { continue };
                    if let Ok(value) = serde_json::from_slice::<JsonValue>(&delivery.data) {
                        if let Some(reply) = split_reply(value) {
                            replies.push(reply);
                        }
                    }
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl BrokerControl for AmqpBrokerControl {
    async fn worker_stats(&self) -> Result<Vec<WorkerStatsEntry>, ExporterError> {
        let replies = self.broadcast("stats").await?;
        Ok(replies
            .into_iter()
            .map(|(hostname, payload)| WorkerStatsEntry {
                pool_processes: pool_processes_from_stats_payload(&payload),
                hostname,
            })
            .collect())
    }

    async fn active_queues(&self) -> Result<Vec<ActiveQueuesEntry>, ExporterError> {
        let replies = self.broadcast("active_queues").await?;
        Ok(replies
            .into_iter()
            .map(|(hostname, payload)| ActiveQueuesEntry {
                queues: queue_names_from_active_queues_payload(&payload),
                hostname,
            })
            .collect())
    }
}
