// libs/consultation-call-cell/src/services/signaling.rs
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SignalingError;
use crate::models::{ConsultationSession, SignalEnvelope, SignalKind};
use crate::services::relay::SignalingRelay;

pub type SignalHandler = Box<dyn Fn(SignalEnvelope) + Send + Sync>;

/// Handlers keyed by envelope kind. Registered before the channel opens so
/// nothing delivered right after subscribing is lost.
#[derive(Default)]
pub struct SignalDispatcher {
    handlers: HashMap<SignalKind, Vec<SignalHandler>>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(&mut self, kind: SignalKind, handler: F) -> &mut Self
    where
        F: Fn(SignalEnvelope) + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
        self
    }

    /// Returns `false` when no handler is registered for the envelope's kind.
    pub fn dispatch(&self, envelope: SignalEnvelope) -> bool {
        match self.handlers.get(&envelope.kind()) {
            Some(handlers) if !handlers.is_empty() => {
                for handler in handlers {
                    handler(envelope.clone());
                }
                true
            }
            _ => false,
        }
    }
}

/// Outbound half of a channel. Cheap to clone; sends are awaited in order,
/// which keeps one participant's envelopes FIFO on the relay.
#[derive(Clone)]
pub struct SignalSender {
    relay: Arc<dyn SignalingRelay>,
    topic: String,
    local_id: Uuid,
    closed: Arc<AtomicBool>,
}

impl SignalSender {
    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed);
        }

        let payload = serde_json::to_string(envelope)?;
        self.relay.publish(&self.topic, payload).await?;
        debug!("Sent {} on {}", envelope.kind(), self.topic);
        Ok(())
    }
}

/// Bidirectional channel scoped to one consultation.
pub struct SignalingChannel {
    sender: SignalSender,
    reader: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Subscribes to the consultation topic, starts dispatching and announces
    /// presence once.
    pub async fn open(
        relay: Arc<dyn SignalingRelay>,
        session: &ConsultationSession,
        topic_prefix: &str,
        dispatcher: SignalDispatcher,
    ) -> Result<Self, SignalingError> {
        let topic = session.topic(topic_prefix);
        let local_id = session.participant_id;

        let mut incoming = relay.subscribe(&topic).await?;
        info!("Participant {} subscribed to {}", local_id, topic);

        let reader_topic = topic.clone();
        let reader = tokio::spawn(async move {
            while let Some(payload) = incoming.next().await {
                let envelope = match serde_json::from_str::<SignalEnvelope>(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Dropping undecodable envelope on {}: {}", reader_topic, e);
                        continue;
                    }
                };

                if envelope.sender_id() == local_id {
                    continue;
                }

                let kind = envelope.kind();
                if !dispatcher.dispatch(envelope) {
                    debug!("No handler for {} on {}", kind, reader_topic);
                }
            }
            debug!("Subscription to {} ended", reader_topic);
        });

        let channel = Self {
            sender: SignalSender {
                relay,
                topic,
                local_id,
                closed: Arc::new(AtomicBool::new(false)),
            },
            reader: Some(reader),
        };

        // Dropping the channel on error aborts the reader.
        channel.sender.send(&SignalEnvelope::joined(local_id)).await?;

        Ok(channel)
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn topic(&self) -> &str {
        self.sender.topic()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Announces departure (best-effort) and unsubscribes. Idempotent.
    pub async fn close(&mut self) {
        if self.sender.is_closed() {
            return;
        }

        let left = SignalEnvelope::left(self.sender.local_id);
        if let Err(e) = self.sender.send(&left).await {
            warn!("Failed to announce departure on {}: {}", self.sender.topic, e);
        }
        self.sender.closed.store(true, Ordering::SeqCst);

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!("Closed signaling channel {}", self.sender.topic);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.sender.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
