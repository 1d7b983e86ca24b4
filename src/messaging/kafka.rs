use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use uuid::Uuid;

use super::Transport;
use crate::rpc::{CallError, RemoteErrorBody};

// ============================================================================
// Kafka / Redpanda Request-Reply Transport
// ============================================================================
//
// Requests are produced to the topic named after the operation pattern with a
// correlation id and a reply topic (`<pattern>.reply`) in the headers. The
// remote handler answers on the reply topic with a `ReplyEnvelope` carrying
// the same correlation id. A reply loop routes answers to waiting callers.
//
// ============================================================================

pub const CORRELATION_HEADER: &str = "correlation_id";
pub const REPLY_TOPIC_HEADER: &str = "reply_topic";

pub fn reply_topic_for(pattern: &str) -> String {
    format!("{}.reply", pattern)
}

#[derive(Clone, Debug)]
pub struct KafkaTransportConfig {
    pub brokers: String,
    pub client_id: String,
    /// Unique per transport instance so every replica sees its own replies
    pub group_id: String,
    /// Patterns this service calls; one reply topic is subscribed per pattern
    pub reply_patterns: Vec<String>,
    pub delivery_timeout: Duration,
    /// Wait after subscribing so the consumer group can settle
    pub ready_grace: Duration,
}

impl KafkaTransportConfig {
    pub fn new(brokers: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            brokers: brokers.into(),
            group_id: format!("{}-replies-{}", client_id, Uuid::new_v4()),
            client_id,
            reply_patterns: Vec::new(),
            delivery_timeout: Duration::from_secs(5),
            ready_grace: Duration::from_millis(1000),
        }
    }

    pub fn with_reply_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_grace(mut self, grace: Duration) -> Self {
        self.ready_grace = grace;
        self
    }
}

/// Wire shape of a reply: either `response` or `err` is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<RemoteErrorBody>,
}

impl ReplyEnvelope {
    pub fn into_result(self) -> Result<Value, CallError> {
        match self.err {
            Some(err) => Err(err.into()),
            None => Ok(self.response.unwrap_or(Value::Null)),
        }
    }

    fn malformed(reason: impl std::fmt::Display) -> Self {
        Self {
            response: None,
            err: Some(RemoteErrorBody {
                status: None,
                message: format!("Malformed reply: {}", reason),
            }),
        }
    }
}

type PendingReplies = DashMap<String, oneshot::Sender<ReplyEnvelope>>;

/// Removes the waiting slot when the caller stops waiting (reply, error or
/// an abandoned timed-out attempt).
struct PendingSlot<'a> {
    correlation_id: String,
    pending: &'a PendingReplies,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct KafkaTransport {
    config: KafkaTransportConfig,
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    pending: Arc<PendingReplies>,
    reply_topics: HashSet<String>,
    connected: OnceCell<()>,
}

impl KafkaTransport {
    pub fn new(config: KafkaTransportConfig) -> Result<Self, CallError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.delivery_timeout.as_millis().to_string())
            .create()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;

        let reply_topics = config
            .reply_patterns
            .iter()
            .map(|p| reply_topic_for(p))
            .collect();

        Ok(Self {
            config,
            producer,
            consumer: Arc::new(consumer),
            pending: Arc::new(DashMap::new()),
            reply_topics,
            connected: OnceCell::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.initialized()
    }

    async fn establish(&self) -> Result<(), CallError> {
        if !self.reply_topics.is_empty() {
            let topics: Vec<&str> = self.reply_topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&topics)?;

            tokio::spawn(run_reply_loop(self.consumer.clone(), self.pending.clone()));

            tracing::info!(
                brokers = %self.config.brokers,
                reply_topics = ?topics,
                "Subscribed to reply topics"
            );
        }

        tokio::time::sleep(self.config.ready_grace).await;
        Ok(())
    }
}

async fn run_reply_loop(consumer: Arc<StreamConsumer>, pending: Arc<PendingReplies>) {
    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Reply consumer error");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let correlation_id = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == CORRELATION_HEADER)
                .and_then(|h| h.value)
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_owned)
        });

        let Some(correlation_id) = correlation_id else {
            tracing::warn!(topic = %message.topic(), "Reply without correlation id dropped");
            continue;
        };

        let envelope = match message.payload() {
            Some(bytes) => serde_json::from_slice::<ReplyEnvelope>(bytes)
                .unwrap_or_else(ReplyEnvelope::malformed),
            None => ReplyEnvelope::default(),
        };

        match pending.remove(&correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(envelope);
            }
            None => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    topic = %message.topic(),
                    "Late reply dropped, caller stopped waiting"
                );
            }
        }
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn connect(&self) -> Result<(), CallError> {
        self.connected
            .get_or_try_init(|| self.establish())
            .await
            .map(|_| ())
    }

    async fn send(&self, pattern: &str, payload: Value) -> Result<Value, CallError> {
        if !self.is_connected() {
            return Err(CallError::BrokerNotReady("transport not connected".to_string()));
        }

        let reply_topic = reply_topic_for(pattern);
        if !self.reply_topics.contains(&reply_topic) {
            return Err(CallError::Unknown(format!(
                "no reply subscription for {}",
                pattern
            )));
        }

        let body = serde_json::to_vec(&payload)
            .map_err(|e| CallError::Unknown(format!("Unserializable payload: {}", e)))?;

        let correlation_id = Uuid::new_v4().to_string();
        let (waiter, reply) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), waiter);
        let _slot = PendingSlot {
            correlation_id: correlation_id.clone(),
            pending: &self.pending,
        };

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: CORRELATION_HEADER,
                value: Some(correlation_id.as_str()),
            })
            .insert(Header {
                key: REPLY_TOPIC_HEADER,
                value: Some(reply_topic.as_str()),
            });

        let record = FutureRecord::to(pattern)
            .key(&correlation_id)
            .payload(&body)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(self.config.delivery_timeout))
            .await
            .map_err(|(e, _)| CallError::from(e))?;

        tracing::debug!(
            pattern = %pattern,
            correlation_id = %correlation_id,
            "Request published, awaiting reply"
        );

        match reply.await {
            Ok(envelope) => envelope.into_result(),
            Err(_) => Err(CallError::Connection("reply channel closed".to_string())),
        }
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), CallError> {
        let body = serde_json::to_vec(&payload)
            .map_err(|e| CallError::Unknown(format!("Unserializable payload: {}", e)))?;

        let record = FutureRecord::<(), Vec<u8>>::to(event).payload(&body);

        self.producer
            .send(record, Timeout::After(self.config.delivery_timeout))
            .await
            .map_err(|(e, _)| CallError::from(e))?;

        tracing::info!(event = %event, "Event published");
        Ok(())
    }
}

impl From<KafkaError> for CallError {
    fn from(error: KafkaError) -> Self {
        let message = error.to_string();
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageTimedOut)
            | Some(RDKafkaErrorCode::RequestTimedOut)
            | Some(RDKafkaErrorCode::OperationTimedOut) => CallError::Timeout(message),
            Some(RDKafkaErrorCode::BrokerTransportFailure)
            | Some(RDKafkaErrorCode::AllBrokersDown)
            | Some(RDKafkaErrorCode::BrokerNotAvailable) => CallError::Connection(message),
            Some(RDKafkaErrorCode::LeaderNotAvailable)
            | Some(RDKafkaErrorCode::NotLeaderForPartition)
            | Some(RDKafkaErrorCode::UnknownTopicOrPartition)
            | Some(RDKafkaErrorCode::UnknownTopic)
            | Some(RDKafkaErrorCode::UnknownPartition) => CallError::BrokerNotReady(message),
            _ => CallError::Unknown(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::is_retriable;

    #[test]
    fn test_kafka_errors_map_to_call_error_tags() {
        let timeout = CallError::from(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut));
        assert!(matches!(timeout, CallError::Timeout(_)));

        let down = CallError::from(KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown));
        assert!(matches!(down, CallError::Connection(_)));

        let leader = CallError::from(KafkaError::MessageProduction(RDKafkaErrorCode::LeaderNotAvailable));
        assert!(matches!(leader, CallError::BrokerNotReady(_)));
        assert!(is_retriable(&leader));

        let invalid = CallError::from(KafkaError::MessageProduction(RDKafkaErrorCode::InvalidMessage));
        assert!(matches!(invalid, CallError::Unknown(_)));
        assert!(!is_retriable(&invalid));
    }

    #[test]
    fn test_reply_envelope_results() {
        let ok: ReplyEnvelope = serde_json::from_str(r#"{"response":{"id":"u-1"}}"#).unwrap();
        assert_eq!(ok.into_result().unwrap()["id"], "u-1");

        let err: ReplyEnvelope =
            serde_json::from_str(r#"{"err":{"status":403,"message":"forbidden"}}"#).unwrap();
        assert_eq!(err.into_result(), Err(CallError::remote(403, "forbidden")));

        let empty = ReplyEnvelope::default();
        assert_eq!(empty.into_result(), Ok(Value::Null));
    }

    #[test]
    fn test_malformed_reply_is_unknown_error() {
        let envelope = ReplyEnvelope::malformed("expected value at line 1");
        assert!(matches!(envelope.into_result(), Err(CallError::Unknown(_))));
    }

    #[test]
    fn test_reply_topic_naming() {
        assert_eq!(reply_topic_for("users.get_user"), "users.get_user.reply");
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_ready() {
        let config = KafkaTransportConfig::new("127.0.0.1:9092", "test-client")
            .with_reply_patterns(["users.get_user"]);
        let transport = KafkaTransport::new(config).unwrap();

        let result = transport.send("users.get_user", serde_json::json!({})).await;

        assert!(matches!(result, Err(CallError::BrokerNotReady(_))));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_replicas_get_distinct_reply_groups() {
        let first = KafkaTransportConfig::new("127.0.0.1:9092", "orders");
        let second = KafkaTransportConfig::new("127.0.0.1:9092", "orders");

        assert_ne!(first.group_id, second.group_id);
        assert!(first.group_id.starts_with("orders-replies-"));
    }

    #[tokio::test]
    async fn test_unsubscribed_pattern_is_not_retriable() {
        let config = KafkaTransportConfig::new("127.0.0.1:9092", "test-client")
            .with_ready_grace(Duration::ZERO);
        let transport = KafkaTransport::new(config).unwrap();
        transport.connect().await.unwrap();

        let result = transport.send("billing.invoice", serde_json::json!({})).await;

        assert!(matches!(result, Err(CallError::Unknown(_))));
        assert!(!is_retriable(&result.unwrap_err()));
    }
}
