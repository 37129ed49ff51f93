use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::notifications::{NotificationEvent, NotificationItem};
use crate::presence::{UserId, UserRef};
use crate::room::{RoomId, RoomSnapshot};
use crate::timer::{TimerCommand, TimerState};
use crate::video::VideoIdentity;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    Start,
    Pause,
    Reset,
    DurationChange,
}

impl TimerAction {
    pub fn into_command(self, work_duration: Option<u32>, break_duration: Option<u32>) -> TimerCommand {
        match self {
            TimerAction::Start => TimerCommand::Start,
            TimerAction::Pause => TimerCommand::Pause,
            TimerAction::Reset => TimerCommand::Reset,
            TimerAction::DurationChange => TimerCommand::DurationChange {
                work_duration,
                break_duration,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join_room")]
    JoinRoom {
        room: RoomId,
        user_id: UserId,
        display_name: String,
    },
    #[serde(rename = "leave_room")]
    LeaveRoom { room: RoomId, user_id: UserId },
    #[serde(rename = "rename")]
    Rename {
        room: RoomId,
        user_id: UserId,
        display_name: String,
    },
    #[serde(rename = "send_room_message")]
    SendRoomMessage {
        room: RoomId,
        user_id: UserId,
        text: String,
    },
    #[serde(rename = "room_timer_control")]
    RoomTimerControl {
        room: RoomId,
        user_id: UserId,
        action: TimerAction,
        #[serde(default)]
        work_duration: Option<u32>,
        #[serde(default)]
        break_duration: Option<u32>,
    },
    #[serde(rename = "sync_room")]
    SyncRoom { room: RoomId },
    #[serde(rename = "watch_notifications")]
    WatchNotifications { user_id: UserId },
    #[serde(rename = "add_notification")]
    AddNotification {
        title: String,
        content: String,
        #[serde(default)]
        kind: Option<String>,
    },
    #[serde(rename = "mark_all_notifications_read")]
    MarkAllNotificationsRead,
    #[serde(rename = "clear_notifications")]
    ClearNotifications,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "room_joined")]
    RoomJoined { snapshot: RoomSnapshot },
    #[serde(rename = "room_snapshot")]
    RoomSnapshot { snapshot: RoomSnapshot },
    #[serde(rename = "status")]
    Status { room: RoomId, msg: String },
    #[serde(rename = "member_list")]
    MemberList {
        room: RoomId,
        host: Option<UserRef>,
        members: Vec<UserRef>,
    },
    #[serde(rename = "room_timer_update")]
    RoomTimerUpdate { room: RoomId, timer: TimerState },
    #[serde(rename = "receive_room_message")]
    ReceiveRoomMessage { message: ChatMessage },
    #[serde(rename = "room_deleted")]
    RoomDeleted { room: RoomId, message: String },
    #[serde(rename = "room_error")]
    RoomError {
        room: Option<RoomId>,
        message: String,
    },
    #[serde(rename = "existing_video_users")]
    ExistingVideoUsers { identities: Vec<VideoIdentity> },
    #[serde(rename = "video_user_identity")]
    VideoUserIdentity { identity: VideoIdentity },
    #[serde(rename = "notifications")]
    Notifications {
        items: Vec<NotificationItem>,
        unread: usize,
        alert: bool,
    },
}

impl ServerMessage {
    pub fn room_error(room: Option<&str>, error: impl ToString) -> Self {
        ServerMessage::RoomError {
            room: room.map(str::to_string),
            message: error.to_string(),
        }
    }

    pub fn from_notification_events(events: Vec<NotificationEvent>) -> Self {
        let mut items = Vec::new();
        let mut unread = 0;
        let mut alert = false;

        for event in events {
            match event {
                NotificationEvent::Alert => alert = true,
                NotificationEvent::Render(list) => items = list,
                NotificationEvent::Badge(count) => unread = count,
            }
        }

        ServerMessage::Notifications {
            items,
            unread,
            alert,
        }
    }
}
