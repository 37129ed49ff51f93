//! External document store seams.
//!
//! Persistence is best-effort: rooms keep their in-memory state as the source
//! of truth and only report store failures back to the submitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::error::StoreError;
use crate::notifications::NotificationItem;
use crate::room::RoomId;

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn save_room_message(&self, message: &ChatMessage) -> Result<(), StoreError>;
    async fn delete_room(&self, room: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    pub content: String,
    #[serde(default = "NewNotification::default_kind")]
    pub kind: String,
}

impl NewNotification {
    fn default_kind() -> String {
        "info".to_string()
    }
}

/// Per-user notification documents. Every change republishes the user's
/// full list, newest first.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn add_notification(
        &self,
        user_id: &str,
        notification: NewNotification,
    ) -> Result<NotificationItem, StoreError>;

    /// Marks every unread item read; returns how many changed.
    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError>;

    /// Deletes every item; returns how many were removed.
    async fn clear_all(&self, user_id: &str) -> Result<usize, StoreError>;

    fn subscribe(&self, user_id: &str) -> watch::Receiver<Vec<NotificationItem>>;
}

struct Feed {
    items: Vec<NotificationItem>,
    publisher: watch::Sender<Vec<NotificationItem>>,
}

impl Feed {
    fn new() -> Self {
        let (publisher, _) = watch::channel(Vec::new());
        Feed {
            items: Vec::new(),
            publisher,
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.items.clone());
    }
}

/// In-process store used by the binary and the tests.
pub struct MemoryStore {
    rooms: RwLock<HashMap<RoomId, Vec<ChatMessage>>>,
    feeds: Mutex<HashMap<String, Feed>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            rooms: RwLock::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Simulates an outage: every write fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn with_feed<T>(&self, user_id: &str, f: impl FnOnce(&mut Feed) -> T) -> T {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let feed = feeds.entry(user_id.to_string()).or_insert_with(Feed::new);
        f(feed)
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn save_room_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(message.room.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rooms = self.rooms.write().await;
        rooms.remove(room);
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn add_notification(
        &self,
        user_id: &str,
        notification: NewNotification,
    ) -> Result<NotificationItem, StoreError> {
        self.check_available()?;

        // Stamped under the feed lock and never older than the current head,
        // so concurrent adds still list newest first.
        Ok(self.with_feed(user_id, |feed| {
            let now = Utc::now();
            let timestamp = feed.items.first().map_or(now, |head| head.timestamp.max(now));
            let item = NotificationItem {
                id: Uuid::new_v4().to_string(),
                title: notification.title,
                content: notification.content,
                kind: notification.kind,
                read: false,
                timestamp,
            };
            feed.items.insert(0, item.clone());
            feed.publish();
            item
        }))
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.with_feed(user_id, |feed| {
            let mut changed = 0;
            for item in feed.items.iter_mut().filter(|i| !i.read) {
                item.read = true;
                changed += 1;
            }
            if changed > 0 {
                feed.publish();
            }
            changed
        }))
    }

    async fn clear_all(&self, user_id: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.with_feed(user_id, |feed| {
            let removed = feed.items.len();
            if removed > 0 {
                feed.items.clear();
                feed.publish();
            }
            removed
        }))
    }

    fn subscribe(&self, user_id: &str) -> watch::Receiver<Vec<NotificationItem>> {
        self.with_feed(user_id, |feed| feed.publisher.subscribe())
    }
}
