// libs/consultation-call-cell/src/services/relay.rs
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::error::SignalingError;

pub type RelayStream = BoxStream<'static, String>;

/// Low-level publish/subscribe transport. A relay delivers every payload
/// published on a topic to every current subscriber of that topic, the
/// publisher included; self-filtering is the channel's job.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<RelayStream, SignalingError>;

    async fn publish(&self, topic: &str, payload: String) -> Result<(), SignalingError>;
}

const TOPIC_CAPACITY: usize = 256;

/// Process-local relay: one broadcast channel per topic.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().await;
        topics.get(topic).map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Drops the topic once its last subscriber is gone.
    async fn prune(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if topics.get(topic).is_some_and(|s| s.receiver_count() == 0) {
            topics.remove(topic);
            debug!("Removed idle relay topic {}", topic);
        }
    }
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelayStream, SignalingError> {
        // Subscribe under the write lock; prune takes it too.
        let receiver = {
            let mut topics = self.topics.write().await;
            topics.retain(|_, sender| sender.receiver_count() > 0);
            topics
                .entry(topic.to_string())
                .or_insert_with(|| {
                    debug!("Created relay topic {}", topic);
                    broadcast::channel(TOPIC_CAPACITY).0
                })
                .subscribe()
        };
        let topic = topic.to_string();

        let stream = stream::unfold(receiver, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, {} envelopes dropped", topic, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), SignalingError> {
        let delivered = match self.topics.read().await.get(topic) {
            Some(sender) => sender.send(payload).is_ok(),
            None => false,
        };
        if !delivered {
            // Nobody is listening; delivery is best-effort.
            debug!("Published to {} with no subscribers", topic);
            self.prune(topic).await;
        }
        Ok(())
    }
}

/// Redis PUBLISH/SUBSCRIBE relay. Publishing goes through a pooled
/// connection; each subscription holds a dedicated pub/sub connection.
pub struct RedisRelay {
    client: redis::Client,
    pool: Pool,
}

impl RedisRelay {
    pub async fn new(config: &AppConfig) -> Result<Self, SignalingError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let client = redis::Client::open(redis_url.as_str()).map_err(|e| {
            SignalingError::SubscribeFailed {
                topic: "*".to_string(),
                message: format!("Invalid Redis URL: {}", e),
            }
        })?;

        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SignalingError::SendFailed {
                message: format!("Pool creation error: {}", e),
            })?;

        // Test connection
        let mut conn = pool.get().await.map_err(|e| SignalingError::SendFailed {
            message: format!("Connection error: {}", e),
        })?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis signaling relay initialized successfully");

        Ok(Self { client, pool })
    }
}

#[async_trait]
impl SignalingRelay for RedisRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelayStream, SignalingError> {
        let subscribe_failed = |e: redis::RedisError| SignalingError::SubscribeFailed {
            topic: topic.to_string(),
            message: e.to_string(),
        };

        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(subscribe_failed)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(topic).await.map_err(subscribe_failed)?;
        debug!("Subscribed to Redis channel {}", topic);

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Ignoring non-text payload on {}: {}", msg.get_channel_name(), e);
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), SignalingError> {
        let mut conn = self.pool.get().await.map_err(|e| SignalingError::SendFailed {
            message: format!("Connection error: {}", e),
        })?;
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }
}
