//! One task per active room. The task owns the roster, timer and chat log and
//! is the only writer; commands and timer ticks are processed one at a time in
//! the order they arrive, and every broadcast goes out in that same order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Interval};

use crate::chat::{ChatMessage, ChatRelay};
use crate::config::RoomSettings;
use crate::error::RoomError;
use crate::messages::ServerMessage;
use crate::presence::{ConnectionId, Departure, JoinOutcome, PresenceLedger, UserId, UserRef};
use crate::store::{NewNotification, NotificationStore, RoomStore};
use crate::timer::{StartKind, TickOutcome, TimerCommand, TimerNotice, TimerState, TimerStateMachine};
use crate::video::VideoIdentity;

pub type RoomId = String;
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

const TICK_PERIOD: Duration = Duration::from_secs(1);
const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// A connection that receives this room's broadcasts.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection: ConnectionId,
    pub outbound: Outbound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room: RoomId,
    pub host: Option<UserRef>,
    pub members: Vec<UserRef>,
    pub timer: TimerState,
    pub chat: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Left,
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub departure: Option<Departure>,
    pub destroyed: bool,
}

#[derive(Clone)]
pub struct RoomServices {
    pub room_store: Arc<dyn RoomStore>,
    pub notifications: Arc<dyn NotificationStore>,
}

enum RoomCommand {
    Join {
        user: UserRef,
        subscriber: Option<Subscriber>,
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Leave {
        user_id: UserId,
        reply: oneshot::Sender<LeaveOutcome>,
    },
    Disconnect {
        user_id: UserId,
        connection: ConnectionId,
        reply: oneshot::Sender<LeaveOutcome>,
    },
    Rename {
        user_id: UserId,
        display_name: String,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    SendMessage {
        user_id: UserId,
        text: String,
        origin: Option<Outbound>,
        reply: oneshot::Sender<Result<ChatMessage, RoomError>>,
    },
    Timer {
        user_id: UserId,
        command: TimerCommand,
        reply: oneshot::Sender<Result<TimerState, RoomError>>,
    },
    Snapshot {
        history: Option<usize>,
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Cheap, cloneable address of a room task.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: RoomId,
    generation: u64,
    inbox: mpsc::Sender<RoomCommand>,
}

impl std::fmt::Debug for RoomCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoomCommand::Join { .. } => "Join",
            RoomCommand::Leave { .. } => "Leave",
            RoomCommand::Disconnect { .. } => "Disconnect",
            RoomCommand::Rename { .. } => "Rename",
            RoomCommand::SendMessage { .. } => "SendMessage",
            RoomCommand::Timer { .. } => "Timer",
            RoomCommand::Snapshot { .. } => "Snapshot",
        };
        f.write_str(name)
    }
}

impl RoomHandle {
    pub fn spawn(id: RoomId, generation: u64, settings: RoomSettings, services: RoomServices) -> Self {
        let (inbox, commands) = mpsc::channel(settings.inbox_capacity.max(1));
        let room = Room::new(id.clone(), settings, services);
        tokio::spawn(room.run(commands));

        info!("Room {} created", id);
        RoomHandle {
            id,
            generation,
            inbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn join(&self, user: UserRef, subscriber: Option<Subscriber>) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Join {
            user,
            subscriber,
            reply,
        })
        .await
    }

    pub async fn leave(&self, user_id: UserId) -> Result<LeaveOutcome, RoomError> {
        self.request(|reply| RoomCommand::Leave { user_id, reply }).await
    }

    pub async fn disconnect(&self, user_id: UserId, connection: ConnectionId) -> Result<LeaveOutcome, RoomError> {
        self.request(|reply| RoomCommand::Disconnect {
            user_id,
            connection,
            reply,
        })
        .await
    }

    pub async fn rename(&self, user_id: UserId, display_name: String) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Rename {
            user_id,
            display_name,
            reply,
        })
        .await?
    }

    pub async fn send_message(
        &self,
        user_id: UserId,
        text: String,
        origin: Option<Outbound>,
    ) -> Result<ChatMessage, RoomError> {
        self.request(|reply| RoomCommand::SendMessage {
            user_id,
            text,
            origin,
            reply,
        })
        .await?
    }

    pub async fn timer(&self, user_id: UserId, command: TimerCommand) -> Result<TimerState, RoomError> {
        self.request(|reply| RoomCommand::Timer {
            user_id,
            command,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self, history: Option<usize>) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { history, reply }).await
    }

    /// Waits for inbox space, then for the room's answer. A room that shut
    /// down in between is reported as not found.
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (reply, answer) = oneshot::channel();
        let command = build(reply);

        if let Err(e) = self.inbox.send(command).await {
            debug!("Room {} is tearing down, dropped {:?}", self.id, e.0);
            return Err(RoomError::RoomNotFound(self.id.clone()));
        }

        answer.await.map_err(|_| {
            debug!("Room {} shut down before answering", self.id);
            RoomError::RoomNotFound(self.id.clone())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Teardown,
}

struct Room {
    id: RoomId,
    settings: RoomSettings,
    services: RoomServices,
    presence: PresenceLedger,
    timer: TimerStateMachine,
    chat: ChatRelay,
    subscribers: HashMap<ConnectionId, (UserId, Outbound)>,
}

impl Room {
    fn new(id: RoomId, settings: RoomSettings, services: RoomServices) -> Self {
        Room {
            timer: TimerStateMachine::new(&settings.timer),
            chat: ChatRelay::new(id.clone(), settings.chat_retention),
            presence: PresenceLedger::new(),
            subscribers: HashMap::new(),
            id,
            settings,
            services,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        let mut ticker: Option<Interval> = None;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command) == Flow::Teardown {
                        break;
                    }
                }
                () = next_tick(&mut ticker) => self.on_tick(),
            }

            self.sync_ticker(&mut ticker);
        }

        info!("Room {} closed", self.id);
    }

    /// Keeps exactly one tick source alive while the timer runs.
    fn sync_ticker(&self, ticker: &mut Option<Interval>) {
        match (self.timer.is_running(), ticker.is_some()) {
            (true, false) => {
                *ticker = Some(time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD));
            }
            (false, true) => *ticker = None,
            _ => {}
        }
    }

    fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Join {
                user,
                subscriber,
                reply,
            } => {
                let snapshot = self.join(user, subscriber);
                let _ = reply.send(snapshot);
                Flow::Continue
            }
            RoomCommand::Leave { user_id, reply } => {
                let departure = self.presence.leave(&user_id);
                self.finish_departure(&user_id, departure, LeaveReason::Left, None, reply)
            }
            RoomCommand::Disconnect {
                user_id,
                connection,
                reply,
            } => {
                let departure = self.presence.drop_connection(&user_id, connection);
                self.finish_departure(&user_id, departure, LeaveReason::Disconnected, Some(connection), reply)
            }
            RoomCommand::Rename {
                user_id,
                display_name,
                reply,
            } => {
                let _ = reply.send(self.rename(&user_id, display_name));
                Flow::Continue
            }
            RoomCommand::SendMessage {
                user_id,
                text,
                origin,
                reply,
            } => {
                let _ = reply.send(self.send_message(&user_id, &text, origin));
                Flow::Continue
            }
            RoomCommand::Timer {
                user_id,
                command,
                reply,
            } => {
                let _ = reply.send(self.control_timer(&user_id, command));
                Flow::Continue
            }
            RoomCommand::Snapshot { history, reply } => {
                let _ = reply.send(self.snapshot(history));
                Flow::Continue
            }
        }
    }

    fn join(&mut self, user: UserRef, subscriber: Option<Subscriber>) -> RoomSnapshot {
        let connection = subscriber.as_ref().map(|s| s.connection);
        let outcome = self.presence.join(user.clone(), connection);

        if let Some(subscriber) = &subscriber {
            self.subscribers.insert(
                subscriber.connection,
                (user.user_id.clone(), subscriber.outbound.clone()),
            );
        }

        let snapshot = self.snapshot(Some(self.settings.history_limit));
        if let Some(subscriber) = &subscriber {
            let _ = subscriber.outbound.send(ServerMessage::RoomJoined {
                snapshot: snapshot.clone(),
            });
            let identities = self.presence.members().iter().map(VideoIdentity::of).collect();
            let _ = subscriber.outbound.send(ServerMessage::ExistingVideoUsers { identities });
        }

        match outcome {
            JoinOutcome::Joined => {
                info!("{} ({}) joined room {}", user.display_name, user.user_id, self.id);
                let notice = format!("{} has joined the room.", user.display_name);
                self.announce_except(&user.user_id, notice);
            }
            JoinOutcome::Rejoined { previous_name } if previous_name != user.display_name => {
                info!("{} rejoined room {} as {}", user.user_id, self.id, user.display_name);
                self.announce(format!("{previous_name} changed their name to {}", user.display_name));
            }
            JoinOutcome::Rejoined { .. } => {
                debug!("{} reconnected to room {}", user.user_id, self.id);
            }
        }

        self.broadcast_members();
        self.broadcast(&ServerMessage::VideoUserIdentity {
            identity: VideoIdentity::of(&user),
        });
        snapshot
    }

    fn finish_departure(
        &mut self,
        user_id: &str,
        departure: Option<Departure>,
        reason: LeaveReason,
        connection: Option<ConnectionId>,
        reply: oneshot::Sender<LeaveOutcome>,
    ) -> Flow {
        if let Some(connection) = connection {
            self.subscribers.remove(&connection);
        }

        let Some(departure) = departure else {
            let _ = reply.send(LeaveOutcome::default());
            return Flow::Continue;
        };

        let detached: Vec<Outbound> = self
            .subscribers
            .iter()
            .filter(|(_, (owner, _))| owner == user_id)
            .map(|(_, (_, outbound))| outbound.clone())
            .collect();
        self.subscribers.retain(|_, (owner, _)| owner != user_id);

        let name = departure.member.display_name.clone();
        let notice = match reason {
            LeaveReason::Left => format!("{name} has left the room."),
            LeaveReason::Disconnected => format!("{name} has disconnected."),
        };
        info!("{} ({}) left room {} ({:?})", name, user_id, self.id, reason);
        self.announce(notice);

        if let Some(host) = &departure.new_host {
            info!("{} is now host of room {}", host.user_id, self.id);
        }

        if !departure.now_empty {
            self.broadcast_members();
            let _ = reply.send(LeaveOutcome {
                departure: Some(departure),
                destroyed: false,
            });
            return Flow::Continue;
        }

        let deleted = ServerMessage::RoomDeleted {
            room: self.id.clone(),
            message: "Room has been deleted as all participants have left.".to_string(),
        };
        for outbound in detached.iter().chain(self.subscribers.values().map(|(_, o)| o)) {
            let _ = outbound.send(deleted.clone());
        }
        self.teardown();

        let _ = reply.send(LeaveOutcome {
            departure: Some(departure),
            destroyed: true,
        });
        Flow::Teardown
    }

    fn teardown(&mut self) {
        info!("Room {} is empty, tearing down", self.id);
        self.timer.apply(TimerCommand::Pause).ok();
        self.subscribers.clear();

        let store = Arc::clone(&self.services.room_store);
        let room = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.delete_room(&room).await {
                error!("Failed to delete stored data of room {}: {}", room, e);
            }
        });
    }

    fn rename(&mut self, user_id: &str, display_name: String) -> Result<(), RoomError> {
        let display_name = validate_display_name(&display_name)?;
        let previous = self.presence.rename(user_id, display_name.clone()).ok_or_else(|| {
            RoomError::NotMember {
                room: self.id.clone(),
                user: user_id.to_string(),
            }
        })?;

        if previous == display_name {
            return Ok(());
        }

        info!("{} renamed to {} in room {}", user_id, display_name, self.id);
        self.announce(format!("{previous} changed their name to {display_name}"));
        self.broadcast_members();
        self.broadcast(&ServerMessage::VideoUserIdentity {
            identity: VideoIdentity::of(&UserRef::new(user_id, display_name)),
        });
        Ok(())
    }

    fn send_message(
        &mut self,
        user_id: &str,
        text: &str,
        origin: Option<Outbound>,
    ) -> Result<ChatMessage, RoomError> {
        let sender = self.member(user_id)?.clone();
        let message = self.chat.send(&sender, text)?;

        self.broadcast(&ServerMessage::ReceiveRoomMessage {
            message: message.clone(),
        });
        self.persist(message.clone(), origin);
        self.notify_recipients(&message);
        Ok(message)
    }

    fn persist(&self, message: ChatMessage, origin: Option<Outbound>) {
        let store = Arc::clone(&self.services.room_store);
        tokio::spawn(async move {
            if let Err(e) = store.save_room_message(&message).await {
                error!("Failed to persist message {} in room {}: {}", message.id, message.room, e);
                if let Some(origin) = origin {
                    let _ = origin.send(ServerMessage::room_error(
                        Some(&message.room),
                        format!("Message was delivered but not saved: {e}"),
                    ));
                }
            }
        });
    }

    fn notify_recipients(&self, message: &ChatMessage) {
        let members = self.presence.members();
        let recipients: Vec<UserId> = message
            .notification_recipients(&members)
            .into_iter()
            .map(|m| m.user_id.clone())
            .collect();
        if recipients.is_empty() {
            return;
        }

        let store = Arc::clone(&self.services.notifications);
        let notification = NewNotification {
            title: format!("New message in room {}", self.id),
            content: format!("{}: {}", message.sender_display_name, message.text),
            kind: "chat".to_string(),
        };
        tokio::spawn(async move {
            for user_id in recipients {
                if let Err(e) = store.add_notification(&user_id, notification.clone()).await {
                    warn!("Could not notify {} of a chat message: {}", user_id, e);
                }
            }
        });
    }

    fn control_timer(&mut self, user_id: &str, command: TimerCommand) -> Result<TimerState, RoomError> {
        let name = self.member(user_id)?.display_name.clone();
        let notice = self.timer.apply(command).inspect_err(|e| {
            warn!("Rejected timer command from {} in room {}: {}", user_id, self.id, e);
        })?;

        let state = self.timer.state().clone();
        let status = match notice {
            TimerNotice::Started(StartKind::Fresh) => Some(format!(
                "{name} started the {} timer.",
                state.phase.label().to_lowercase()
            )),
            TimerNotice::Started(StartKind::Resume) => Some(format!("{name} resumed the timer.")),
            TimerNotice::Paused => Some(format!("{name} paused the timer.")),
            TimerNotice::Reset => Some(format!("{name} reset the timer.")),
            TimerNotice::DurationsChanged { deferred } => {
                let durations = state.pending_durations.map_or(
                    (state.work_duration, state.break_duration),
                    |d| (d.work_duration, d.break_duration),
                );
                let when = if deferred { " from the next phase" } else { "" };
                Some(format!(
                    "{name} set work to {} and break to {} minutes{when}.",
                    durations.0, durations.1
                ))
            }
            TimerNotice::AlreadyRunning | TimerNotice::AlreadyPaused => None,
        };

        if let Some(status) = status {
            info!("Room {}: {}", self.id, status);
            self.status(status);
        }
        self.broadcast_timer();
        Ok(state)
    }

    fn on_tick(&mut self) {
        match self.timer.tick() {
            TickOutcome::Idle => {}
            TickOutcome::Counting => {
                debug!("Room {} tick: {}s left", self.id, self.timer.state().remaining_seconds);
                self.broadcast_timer();
            }
            TickOutcome::PhaseComplete { finished, next } => {
                info!("Room {} finished {:?}, now {:?}", self.id, finished, next);
                self.status(format!(
                    "{} session complete. {} session begins.",
                    finished.label(),
                    next.label()
                ));
                self.broadcast_timer();
            }
        }
    }

    fn snapshot(&self, history: Option<usize>) -> RoomSnapshot {
        RoomSnapshot {
            room: self.id.clone(),
            host: self.presence.host().cloned(),
            members: self.presence.members(),
            timer: self.timer.state().clone(),
            chat: history.map_or_else(|| self.chat.history(), |limit| self.chat.recent(limit)),
        }
    }

    fn member(&self, user_id: &str) -> Result<&UserRef, RoomError> {
        self.presence.get(user_id).ok_or_else(|| RoomError::NotMember {
            room: self.id.clone(),
            user: user_id.to_string(),
        })
    }

    /// Logs a system notice and shows it to everyone.
    fn announce(&mut self, notice: String) {
        let message = self.chat.system(notice);
        self.status(message.text);
    }

    /// Like `announce`, but the subject's own connections are skipped.
    fn announce_except(&mut self, user_id: &str, notice: String) {
        let message = self.chat.system(notice);
        let status = ServerMessage::Status {
            room: self.id.clone(),
            msg: message.text,
        };
        for (owner, outbound) in self.subscribers.values() {
            if owner != user_id {
                let _ = outbound.send(status.clone());
            }
        }
    }

    fn status(&self, msg: String) {
        self.broadcast(&ServerMessage::Status {
            room: self.id.clone(),
            msg,
        });
    }

    fn broadcast_timer(&self) {
        self.broadcast(&ServerMessage::RoomTimerUpdate {
            room: self.id.clone(),
            timer: self.timer.state().clone(),
        });
    }

    fn broadcast_members(&self) {
        self.broadcast(&ServerMessage::MemberList {
            room: self.id.clone(),
            host: self.presence.host().cloned(),
            members: self.presence.members(),
        });
    }

    fn broadcast(&self, message: &ServerMessage) {
        for (_, outbound) in self.subscribers.values() {
            let _ = outbound.send(message.clone());
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub fn validate_display_name(display_name: &str) -> Result<String, RoomError> {
    let trimmed = display_name.trim();
    if trimmed.is_empty() {
        return Err(RoomError::invalid("display name is empty"));
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(RoomError::invalid(format!(
            "display name longer than {MAX_DISPLAY_NAME_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}
