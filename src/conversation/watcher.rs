//! # Completion Watcher
//!
//! Dispatch is fire-and-forget; the generated reply reaches the controller through
//! a push subscription scoped to one conversation id. This module defines that
//! subscription contract and the in-process [`ReplyHub`] implementation, which is
//! fed by the reply webhook.
//!
//! ## Unsubscription:
//! [`SubscriptionHandle::unsubscribe`] is synchronous. Once it returns, the hub
//! stops delivering to that subscriber. Anything already buffered in the channel is
//! filtered by the controller's own shutdown check.

use crate::conversation::state::ReplyEvent;
use crate::error::TurnError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered replies per subscriber before new ones are dropped.
pub const SUBSCRIBER_BUFFER: usize = 32;

/// Cancels one subscription. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the subscription is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A live subscription: the reply stream plus the handle that ends it.
#[derive(Debug)]
pub struct ReplySubscription {
    events: mpsc::Receiver<ReplyEvent>,
    handle: SubscriptionHandle,
}

impl ReplySubscription {
    pub fn new(events: mpsc::Receiver<ReplyEvent>, handle: SubscriptionHandle) -> Self {
        Self { events, handle }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ReplyEvent>, SubscriptionHandle) {
        (self.events, self.handle)
    }
}

#[async_trait]
pub trait CompletionWatcher: Send + Sync {
    /// Subscribe to generated replies for `conversation_id`.
    ///
    /// The event stream ends (`recv` returns `None`) if the channel is lost.
    async fn subscribe(&self, conversation_id: &str) -> Result<ReplySubscription, TurnError>;
}

struct Subscriber {
    tx: mpsc::Sender<ReplyEvent>,
    handle: SubscriptionHandle,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        self.handle.is_active() && !self.tx.is_closed()
    }
}

/// In-process reply fan-out keyed by conversation id.
#[derive(Clone, Default)]
pub struct ReplyHub {
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
}

impl ReplyHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every live subscriber of `conversation_id`.
    /// Returns how many subscribers received it.
    pub fn publish(&self, conversation_id: &str, event: ReplyEvent) -> usize {
        let mut table = self.table();
        let Some(subscribers) = table.get_mut(conversation_id) else {
            debug!(conversation_id, reply_id = %event.reply_id, "No subscribers for reply");
            return 0;
        };

        subscribers.retain(Subscriber::is_live);

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(conversation_id, error = %err, "Dropping reply for slow subscriber"),
            }
        }

        if subscribers.is_empty() {
            table.remove(conversation_id);
        }

        delivered
    }

    /// Drop dead subscribers of `conversation_id`, and the key once none are left.
    fn prune(&self, conversation_id: &str) {
        let mut table = self.table();
        if let Some(subscribers) = table.get_mut(conversation_id) {
            subscribers.retain(Subscriber::is_live);
            if subscribers.is_empty() {
                table.remove(conversation_id);
            }
        }
    }

    /// Conversations with at least one registered subscriber.
    pub fn conversation_count(&self) -> usize {
        self.table().len()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.table()
            .get(conversation_id)
            .map(|subs| subs.iter().filter(|s| s.is_live()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CompletionWatcher for ReplyHub {
    async fn subscribe(&self, conversation_id: &str) -> Result<ReplySubscription, TurnError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let handle = SubscriptionHandle::new();

        {
            let mut table = self.table();
            // Sweeps receivers that were dropped without unsubscribing
            table.retain(|_, subscribers| {
                subscribers.retain(Subscriber::is_live);
                !subscribers.is_empty()
            });
            table
                .entry(conversation_id.to_string())
                .or_default()
                .push(Subscriber {
                    tx,
                    handle: handle.clone(),
                });
        }

        let hub = self.clone();
        let reaped = handle.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            reaped.cancelled().await;
            hub.prune(&id);
        });

        debug!(conversation_id, "Reply subscription registered");
        Ok(ReplySubscription::new(rx, handle))
    }
}
