//! Message bus seam used by the emitter and the syncer

use crate::{CoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A message delivered to a subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    pub sid: u64,
    pub receiver: mpsc::UnboundedReceiver<BusMessage>,
}

/// Publish/subscribe over named subjects
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, sid: u64) -> Result<()>;
}

struct LocalSubscriber {
    subject: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// In-process bus delivering publishes to matching subscribers
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<HashMap<u64, LocalSubscriber>>>,
    next_sid: Arc<AtomicU64>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.values().filter(|s| s.subject == subject).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Vec<u8>) -> Result<()> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| CoreError::Internal("local bus lock poisoned".to_string()))?;

        // Receivers dropped without unsubscribing are pruned here
        subs.retain(|_, sub| {
            if sub.subject != subject {
                return true;
            }
            sub.sender
                .send(BusMessage {
                    subject: subject.to_string(),
                    reply_to: reply_to.map(str::to_string),
                    payload: payload.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| CoreError::Internal("local bus lock poisoned".to_string()))?
            .insert(
                sid,
                LocalSubscriber {
                    subject: subject.to_string(),
                    sender,
                },
            );
        debug!(sid, subject, "Subscribed on local bus");
        Ok(Subscription { sid, receiver })
    }

    async fn unsubscribe(&self, sid: u64) -> Result<()> {
        self.subscribers
            .lock()
            .map_err(|_| CoreError::Internal("local bus lock poisoned".to_string()))?
            .remove(&sid);
        Ok(())
    }
}
