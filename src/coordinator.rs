use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chat::ChatMessage;
use crate::config::RoomSettings;
use crate::error::RoomError;
use crate::presence::{ConnectionId, UserRef};
use crate::room::{validate_display_name, Outbound, RoomHandle, RoomId, RoomServices, RoomSnapshot, Subscriber};
use crate::store::{NotificationStore, RoomStore};
use crate::timer::{TimerCommand, TimerState};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Participants {
    pub participants: Vec<UserRef>,
    pub host: Option<UserRef>,
}

/// Registry of live rooms. Every room command is forwarded to that room's
/// task; the registry lock is only held to look up or replace handles.
pub struct RoomCoordinator {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
    settings: RoomSettings,
    services: RoomServices,
    generations: AtomicU64,
}

impl RoomCoordinator {
    pub fn new(
        settings: RoomSettings,
        room_store: Arc<dyn RoomStore>,
        notifications: Arc<dyn NotificationStore>,
    ) -> Self {
        RoomCoordinator {
            rooms: RwLock::new(HashMap::new()),
            settings,
            services: RoomServices {
                room_store,
                notifications,
            },
            generations: AtomicU64::new(0),
        }
    }

    pub fn notifications(&self) -> Arc<dyn NotificationStore> {
        Arc::clone(&self.services.notifications)
    }

    /// Joins (or rejoins) `room`, creating it if needed.
    pub async fn join(
        &self,
        room: &str,
        user_id: &str,
        display_name: &str,
        subscriber: Option<Subscriber>,
    ) -> Result<RoomSnapshot, RoomError> {
        let room = validate_id("room", room)?;
        let user = UserRef::new(validate_id("user", user_id)?, validate_display_name(display_name)?);

        // A room found mid-teardown is replaced once; a second failure is
        // reported rather than looping.
        let mut attempts = 2;
        loop {
            attempts -= 1;
            let handle = self.get_or_create(&room).await;
            match handle.join(user.clone(), subscriber.clone()).await {
                Err(RoomError::RoomNotFound(_)) if attempts > 0 => {
                    debug!("Room {} was tearing down during join, recreating", room);
                    self.forget(&handle).await;
                }
                result => return result,
            }
        }
    }

    /// Removes the member. Leaving a room one is not in, or one that no
    /// longer exists, is not an error.
    pub async fn leave(&self, room: &str, user_id: &str) -> Result<(), RoomError> {
        let Some(handle) = self.lookup(room).await else {
            debug!("Leave for unknown room {} ignored", room);
            return Ok(());
        };

        match handle.leave(user_id.to_string()).await {
            Ok(outcome) => {
                if outcome.destroyed {
                    self.forget(&handle).await;
                }
                Ok(())
            }
            Err(RoomError::RoomNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Transport-level drop of one connection.
    pub async fn disconnect(&self, room: &str, user_id: &str, connection: ConnectionId) {
        let Some(handle) = self.lookup(room).await else {
            return;
        };

        if let Ok(outcome) = handle.disconnect(user_id.to_string(), connection).await {
            if outcome.destroyed {
                self.forget(&handle).await;
            }
        }
    }

    pub async fn rename(&self, room: &str, user_id: &str, display_name: &str) -> Result<(), RoomError> {
        self.existing(room)
            .await?
            .rename(user_id.to_string(), display_name.to_string())
            .await
    }

    pub async fn send_message(
        &self,
        room: &str,
        user_id: &str,
        text: &str,
        origin: Option<Outbound>,
    ) -> Result<ChatMessage, RoomError> {
        self.existing(room)
            .await?
            .send_message(user_id.to_string(), text.to_string(), origin)
            .await
    }

    pub async fn timer_control(
        &self,
        room: &str,
        user_id: &str,
        command: TimerCommand,
    ) -> Result<TimerState, RoomError> {
        self.existing(room)
            .await?
            .timer(user_id.to_string(), command)
            .await
    }

    /// Full current state; `history` bounds the chat portion.
    pub async fn snapshot(&self, room: &str, history: Option<usize>) -> Result<RoomSnapshot, RoomError> {
        self.existing(room).await?.snapshot(history).await
    }

    pub async fn participants(&self, room: &str) -> Result<Participants, RoomError> {
        let snapshot = self.snapshot(room, Some(0)).await?;
        Ok(Participants {
            participants: snapshot.members,
            host: snapshot.host,
        })
    }

    pub async fn timer_state(&self, room: &str) -> Result<TimerState, RoomError> {
        Ok(self.snapshot(room, Some(0)).await?.timer)
    }

    pub async fn chat_history(&self, room: &str) -> Result<Vec<ChatMessage>, RoomError> {
        Ok(self.snapshot(room, None).await?.chat)
    }

    pub async fn has_room(&self, room: &str) -> bool {
        self.rooms.read().await.contains_key(room)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn lookup(&self, room: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room).cloned()
    }

    async fn existing(&self, room: &str) -> Result<RoomHandle, RoomError> {
        self.lookup(room).await.ok_or_else(|| {
            warn!("Command for unknown room {}", room);
            RoomError::RoomNotFound(room.to_string())
        })
    }

    async fn get_or_create(&self, room: &str) -> RoomHandle {
        if let Some(handle) = self.lookup(room).await {
            return handle;
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                RoomHandle::spawn(room.to_string(), generation, self.settings.clone(), self.services.clone())
            })
            .clone()
    }

    /// Drops the registry entry if it still points at this room instance.
    async fn forget(&self, handle: &RoomHandle) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(handle.id())
            .is_some_and(|current| current.generation() == handle.generation())
        {
            rooms.remove(handle.id());
            info!("Room {} removed", handle.id());
        }
    }
}

fn validate_id(what: &str, id: &str) -> Result<String, RoomError> {
    if id.trim().is_empty() {
        return Err(RoomError::invalid(format!("{what} id is required")));
    }
    Ok(id.to_string())
}

pub fn generate_room_code() -> String {
    use rand::{distributions::Alphanumeric, Rng};

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
