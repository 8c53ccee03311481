use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use travel_api::{Conversation, Message};

use crate::conversations;
use crate::db::DbPool;
use crate::error::{CoreError, Result};
use crate::messages;
use crate::services::notify::{Notification, NotificationSink};

/// Per-conversation broadcast of newly written messages, keyed by document id.
pub struct MessageFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    capacity: usize,
}

impl MessageFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Receive every message published for `document_id` from now on.
    /// Channels left without receivers are dropped first.
    pub fn subscribe(&self, document_id: &str) -> broadcast::Receiver<Message> {
        let mut channels = self.channels.lock();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a stored message to its conversation's subscribers.
    pub fn publish(&self, message: &Message) {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(&message.conversation_id) {
            if tx.send(message.clone()).is_err() {
                channels.remove(&message.conversation_id);
            }
        }
    }
}

impl MessageFeed {
    /// Number of conversations with an open channel.
    pub fn watched(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for MessageFeed {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Counts feed growth; the first observed size is the baseline.
#[derive(Debug, Clone, Copy)]
pub struct GrowthTracker {
    last: usize,
}

impl GrowthTracker {
    pub fn new(baseline: usize) -> Self {
        Self { last: baseline }
    }

    /// True when `len` exceeds every size seen so far.
    pub fn observe(&mut self, len: usize) -> bool {
        if len > self.last {
            self.last = len;
            true
        } else {
            false
        }
    }
}

/// One step of a live feed: the full ordered list after the change.
#[derive(Debug, Clone, Serialize)]
pub struct FeedUpdate {
    pub messages: Vec<Message>,
    pub notification: Option<Notification>,
}

/// Ordered live view of a conversation's messages.
pub struct FeedSubscription {
    pool: DbPool,
    conversation: Conversation,
    messages: Vec<Message>,
    rx: broadcast::Receiver<Message>,
    tracker: GrowthTracker,
    sink: Arc<dyn NotificationSink>,
}

impl FeedSubscription {
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    async fn reload(&self) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let document_id = self.conversation.document_id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            messages::list_messages(&conn, &document_id)
        })
        .await?
    }

    /// Wait for the next change. Raises one notification per growth.
    pub async fn next_update(&mut self) -> Option<FeedUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if self.messages.iter().any(|m| m.id == msg.id) {
                        continue;
                    }
                    // publishers may finish out of order; keep timestamp order
                    let at = self
                        .messages
                        .partition_point(|m| m.timestamp <= msg.timestamp);
                    self.messages.insert(at, msg);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        conversation = %self.conversation.id,
                        skipped,
                        "feed lagged, reloading"
                    );
                    match self.reload().await {
                        Ok(list) => self.messages = list,
                        Err(e) => {
                            tracing::warn!(error = %e, "feed reload failed");
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            }
            let notification = if self.tracker.observe(self.messages.len()) {
                let n = Notification {
                    conversation_id: self.conversation.id.clone(),
                    message_count: self.messages.len(),
                    preview: self
                        .messages
                        .last()
                        .and_then(|m| m.text.clone())
                        .unwrap_or_else(|| "Media".into()),
                };
                self.sink.notify(&n);
                Some(n)
            } else {
                None
            };
            return Some(FeedUpdate {
                messages: self.messages.clone(),
                notification,
            });
        }
    }
}

/// Resolve an app-level conversation id and start a live feed on it.
pub async fn subscribe(
    pool: &DbPool,
    feed: &MessageFeed,
    custom_id: &str,
    sink: Arc<dyn NotificationSink>,
) -> Result<FeedSubscription> {
    let lookup_pool = pool.clone();
    let id = custom_id.to_string();
    let conversation = tokio::task::spawn_blocking(move || {
        let conn = lookup_pool.get()?;
        conversations::find_by_custom_id(&conn, &id)
    })
    .await??
    .ok_or(CoreError::DocumentDoesNotExist)?;

    // subscribe before the snapshot so nothing written in between is lost
    let rx = feed.subscribe(&conversation.document_id);
    let list_pool = pool.clone();
    let document_id = conversation.document_id.clone();
    let snapshot = tokio::task::spawn_blocking(move || {
        let conn = list_pool.get()?;
        messages::list_messages(&conn, &document_id)
    })
    .await??;

    Ok(FeedSubscription {
        pool: pool.clone(),
        tracker: GrowthTracker::new(snapshot.len()),
        conversation,
        messages: snapshot,
        rx,
        sink,
    })
}

/// Store a message and publish it to live subscribers.
pub async fn send_and_publish(
    pool: &DbPool,
    feed: &MessageFeed,
    document_id: &str,
    sender_id: &str,
    text: Option<String>,
    media_url: Option<String>,
) -> Result<Message> {
    let pool = pool.clone();
    let document_id = document_id.to_string();
    let sender_id = sender_id.to_string();
    let msg = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        messages::send_message(
            &conn,
            &document_id,
            &sender_id,
            text.as_deref(),
            media_url.as_deref(),
        )
    })
    .await??;
    feed.publish(&msg);
    Ok(msg)
}
