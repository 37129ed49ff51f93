use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::coordinator::{generate_room_code, RoomCoordinator};
use crate::error::RoomError;
use crate::messages::{ClientMessage, ServerMessage};
use crate::notifications::NotificationSession;
use crate::presence::{ConnectionId, UserId};
use crate::room::{Outbound, RoomId, Subscriber};
use crate::store::NewNotification;

#[derive(Clone)]
pub struct Server {
    coordinator: Arc<RoomCoordinator>,
    disconnect_grace: Duration,
}

/// Everything one WebSocket connection has signed up for.
struct Connection {
    id: ConnectionId,
    outbound: Outbound,
    /// Every identity this socket joined with, per room.
    memberships: HashSet<(RoomId, UserId)>,
    notifications: Option<(NotificationSession, JoinHandle<()>)>,
}

impl Connection {
    fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    fn report(&self, room: Option<&str>, error: impl ToString) {
        self.send(ServerMessage::room_error(room, error));
    }
}

impl Server {
    pub fn new(coordinator: Arc<RoomCoordinator>, disconnect_grace: Duration) -> Self {
        Server {
            coordinator,
            disconnect_grace,
        }
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let (ws_tx, ws_rx) = ws.split();
        self.serve(ws_tx, ws_rx).await;
    }

    /// Runs one client session over any message transport until the client
    /// goes away.
    pub async fn serve<Tx, Rx, E>(&self, mut ws_tx: Tx, mut ws_rx: Rx)
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let mut connection = Connection {
            id: Uuid::new_v4(),
            outbound: tx,
            memberships: HashSet::new(),
            notifications: None,
        };
        info!("Connection {} opened", connection.id);

        let connection_id = connection.id;
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode message for {}: {}", connection_id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!("Failed to send WebSocket message to {}: {}", connection_id, e);
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(msg) => {
                    let Ok(text) = msg.to_str() else { continue };
                    match serde_json::from_str::<ClientMessage>(text) {
                        Ok(client_msg) => self.handle_client_message(client_msg, &mut connection).await,
                        Err(e) => {
                            warn!("Malformed message from {}: {}", connection.id, e);
                            connection.report(None, RoomError::invalid(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!("WebSocket error on {}: {}", connection.id, e);
                    break;
                }
            }
        }

        self.handle_disconnect(connection);
        writer.abort();
    }

    async fn handle_client_message(&self, message: ClientMessage, connection: &mut Connection) {
        match message {
            ClientMessage::JoinRoom {
                room,
                user_id,
                display_name,
            } => {
                let subscriber = Subscriber {
                    connection: connection.id,
                    outbound: connection.outbound.clone(),
                };
                match self
                    .coordinator
                    .join(&room, &user_id, &display_name, Some(subscriber))
                    .await
                {
                    Ok(_) => {
                        connection.memberships.insert((room, user_id));
                    }
                    Err(e) => connection.report(Some(&room), e),
                }
            }

            ClientMessage::LeaveRoom { room, user_id } => {
                let result = self.coordinator.leave(&room, &user_id).await;
                if let Err(e) = result {
                    connection.report(Some(&room), e);
                } else {
                    connection.memberships.remove(&(room, user_id));
                }
            }

            ClientMessage::Rename {
                room,
                user_id,
                display_name,
            } => {
                if let Err(e) = self.coordinator.rename(&room, &user_id, &display_name).await {
                    connection.report(Some(&room), e);
                }
            }

            ClientMessage::SendRoomMessage { room, user_id, text } => {
                let origin = Some(connection.outbound.clone());
                if let Err(e) = self.coordinator.send_message(&room, &user_id, &text, origin).await {
                    connection.report(Some(&room), e);
                }
            }

            ClientMessage::RoomTimerControl {
                room,
                user_id,
                action,
                work_duration,
                break_duration,
            } => {
                let command = action.into_command(work_duration, break_duration);
                if let Err(e) = self.coordinator.timer_control(&room, &user_id, command).await {
                    connection.report(Some(&room), e);
                }
            }

            ClientMessage::SyncRoom { room } => match self.coordinator.snapshot(&room, None).await {
                Ok(snapshot) => connection.send(ServerMessage::RoomSnapshot { snapshot }),
                Err(e) => connection.report(Some(&room), e),
            },

            ClientMessage::WatchNotifications { user_id } => {
                if let Some((_, previous)) = connection.notifications.take() {
                    previous.abort();
                }

                let session = NotificationSession::new(user_id, self.coordinator.notifications());
                let outbound = connection.outbound.clone();
                let watcher = session.watch(move |events| {
                    let _ = outbound.send(ServerMessage::from_notification_events(events));
                });
                connection.notifications = Some((session, watcher));
            }

            ClientMessage::AddNotification { title, content, kind } => {
                let Some((session, _)) = &connection.notifications else {
                    connection.report(None, RoomError::invalid("watch_notifications first"));
                    return;
                };
                let notification = NewNotification {
                    title,
                    content,
                    kind: kind.unwrap_or_else(|| "info".to_string()),
                };
                if let Err(e) = session.add(notification).await {
                    connection.report(None, e);
                }
            }

            ClientMessage::MarkAllNotificationsRead => {
                if let Some((session, _)) = &connection.notifications {
                    if let Err(e) = session.mark_all_read().await {
                        connection.report(None, e);
                    }
                }
            }

            ClientMessage::ClearNotifications => {
                if let Some((session, _)) = &connection.notifications {
                    if let Err(e) = session.clear_all().await {
                        connection.report(None, e);
                    }
                }
            }
        }
    }

    /// A dropped transport counts as a leave, for every identity the socket
    /// joined with, once the grace period has passed without that member
    /// reconnecting elsewhere.
    fn handle_disconnect(&self, connection: Connection) {
        info!("Connection {} closed", connection.id);

        if let Some((_, watcher)) = connection.notifications {
            watcher.abort();
        }

        for (room, user_id) in connection.memberships {
            let coordinator = Arc::clone(&self.coordinator);
            let grace = self.disconnect_grace;
            let connection_id = connection.id;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                coordinator.disconnect(&room, &user_id, connection_id).await;
            });
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct NewRoomBody {
    room: String,
}

fn room_reply<T: Serialize>(result: Result<T, RoomError>) -> warp::reply::Response {
    match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => {
            let status = match e {
                RoomError::RoomNotFound(_) => StatusCode::NOT_FOUND,
                RoomError::InvalidCommand(_) | RoomError::NotMember { .. } => StatusCode::BAD_REQUEST,
            };
            let body = ErrorBody { error: e.to_string() };
            warp::reply::with_status(warp::reply::json(&body), status).into_response()
        }
    }
}

fn with_server(server: Arc<Server>) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&server))
}

async fn get_participants(room: String, server: Arc<Server>) -> Result<warp::reply::Response, Infallible> {
    Ok(room_reply(server.coordinator.participants(&room).await))
}

async fn get_timer(room: String, server: Arc<Server>) -> Result<warp::reply::Response, Infallible> {
    Ok(room_reply(server.coordinator.timer_state(&room).await))
}

async fn get_messages(room: String, server: Arc<Server>) -> Result<warp::reply::Response, Infallible> {
    Ok(room_reply(server.coordinator.chat_history(&room).await))
}

/// Resync and room-code routes under `/api/rooms`.
pub fn api_routes(server: Arc<Server>) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    let rooms = warp::path("api").and(warp::path("rooms"));

    let create = rooms
        .clone()
        .and(warp::path::end())
        .and(warp::post())
        .map(|| {
            warp::reply::with_status(
                warp::reply::json(&NewRoomBody {
                    room: generate_room_code(),
                }),
                StatusCode::CREATED,
            )
            .into_response()
        });

    let participants = rooms
        .clone()
        .and(warp::path::param::<String>())
        .and(warp::path("participants"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(Arc::clone(&server)))
        .and_then(get_participants);

    let timer = rooms
        .clone()
        .and(warp::path::param::<String>())
        .and(warp::path("timer"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(Arc::clone(&server)))
        .and_then(get_timer);

    let messages = rooms
        .and(warp::path::param::<String>())
        .and(warp::path("messages"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(get_messages);

    create.or(participants).unify().or(timer).unify().or(messages).unify()
}

pub fn routes(
    server: Arc<Server>,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_server = Arc::clone(&server);
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = Arc::clone(&ws_server);
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let static_files = warp::fs::dir(static_dir);

    ws_route
        .or(api_routes(server))
        .or(static_files)
        .with(warp::cors().allow_any_origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomSettings;
    use crate::store::MemoryStore;

    fn server() -> Arc<Server> {
        server_with_grace(Duration::ZERO)
    }

    fn server_with_grace(grace: Duration) -> Arc<Server> {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(RoomCoordinator::new(
            RoomSettings::default(),
            store.clone(),
            store,
        ));
        Arc::new(Server::new(coordinator, grace))
    }

    /// An in-memory client session: frames sent by the test, frames the
    /// server wrote back.
    struct TestClient {
        frames: mpsc::UnboundedSender<Message>,
        replies: mpsc::UnboundedReceiver<Message>,
    }

    impl TestClient {
        fn connect(server: &Arc<Server>) -> Self {
            let (frames, incoming) = mpsc::unbounded_channel::<Message>();
            let (outgoing, replies) = mpsc::unbounded_channel::<Message>();

            let ws_rx = Box::pin(futures_util::stream::unfold(incoming, |mut incoming| async move {
                incoming
                    .recv()
                    .await
                    .map(|frame| (Ok::<_, Infallible>(frame), incoming))
            }));
            let ws_tx = Box::pin(futures_util::sink::unfold(outgoing, |outgoing, frame: Message| async move {
                outgoing.send(frame).map_err(|_| "client gone")?;
                Ok::<_, &'static str>(outgoing)
            }));

            let server = Arc::clone(server);
            tokio::spawn(async move { server.serve(ws_tx, ws_rx).await });
            TestClient { frames, replies }
        }

        fn send(&self, json: &str) {
            self.frames.send(Message::text(json)).unwrap();
        }

        /// Reads frames until one of type `kind` arrives.
        async fn expect(&mut self, kind: &str) -> serde_json::Value {
            loop {
                let frame = self.replies.recv().await.unwrap();
                let body: serde_json::Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
                if body["type"] == kind {
                    return body;
                }
            }
        }

        async fn join(&mut self, room: &str, user_id: &str, display_name: &str) {
            self.send(&format!(
                r#"{{"type":"join_room","room":"{room}","user_id":"{user_id}","display_name":"{display_name}"}}"#
            ));
            self.expect("room_joined").await;
        }
    }

    fn roster(participants: &crate::coordinator::Participants) -> Vec<&str> {
        participants.participants.iter().map(|p| p.user_id.as_str()).collect()
    }

    #[tokio::test]
    async fn unknown_room_is_404() {
        let response = warp::test::request()
            .method("GET")
            .path("/api/rooms/nope/timer")
            .reply(&api_routes(server()))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn participants_resync_lists_host() {
        let server = server();
        server
            .coordinator()
            .join("r1", "u1", "Ann", None)
            .await
            .unwrap();

        let response = warp::test::request()
            .method("GET")
            .path("/api/rooms/r1/participants")
            .reply(&api_routes(server))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["host"]["user_id"], "u1");
        assert_eq!(body["participants"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn room_codes_are_created() {
        let response = warp::test::request()
            .method("POST")
            .path("/api/rooms")
            .reply(&api_routes(server()))
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["room"].as_str().map(str::len), Some(8));
    }

    #[tokio::test]
    async fn websocket_join_receives_snapshot() {
        let server = server();
        let routes = routes(Arc::clone(&server), PathBuf::from("public"));
        let mut client = warp::test::ws().path("/ws").handshake(routes).await.unwrap();

        client
            .send_text(r#"{"type":"join_room","room":"r1","user_id":"u1","display_name":"Ann"}"#)
            .await;

        let first = client.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_str(first.to_str().unwrap()).unwrap();
        assert_eq!(body["type"], "room_joined");
        assert_eq!(body["snapshot"]["host"]["display_name"], "Ann");
        assert_eq!(body["snapshot"]["timer"]["remaining_seconds"], 1500);
    }

    #[tokio::test]
    async fn websocket_reports_errors_to_submitter() {
        let server = server();
        let routes = routes(Arc::clone(&server), PathBuf::from("public"));
        let mut client = warp::test::ws().path("/ws").handshake(routes).await.unwrap();

        client
            .send_text(r#"{"type":"send_room_message","room":"ghost","user_id":"u1","text":"hi"}"#)
            .await;

        let reply = client.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_str(reply.to_str().unwrap()).unwrap();
        assert_eq!(body["type"], "room_error");
        assert_eq!(body["room"], "ghost");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_socket_leaves_after_grace() {
        let server = server_with_grace(Duration::from_secs(5));
        let coordinator = Arc::clone(server.coordinator());
        let mut ann = TestClient::connect(&server);
        let mut bob = TestClient::connect(&server);
        ann.join("r1", "u1", "Ann").await;
        bob.join("r1", "u2", "Bob").await;

        drop(ann);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let participants = coordinator.participants("r1").await.unwrap();
        assert_eq!(roster(&participants), ["u1", "u2"]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let participants = coordinator.participants("r1").await.unwrap();
        assert_eq!(roster(&participants), ["u2"]);
        assert_eq!(participants.host.map(|h| h.user_id), Some("u2".to_string()));

        let status = bob.expect("status").await;
        assert_eq!(status["msg"], "Ann has disconnected.");
    }

    #[tokio::test(start_paused = true)]
    async fn last_dropped_socket_tears_the_room_down() {
        let server = server_with_grace(Duration::from_secs(5));
        let coordinator = Arc::clone(server.coordinator());
        let mut ann = TestClient::connect(&server);
        ann.join("r1", "u1", "Ann").await;

        drop(ann);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(coordinator.has_room("r1").await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!coordinator.has_room("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn every_identity_on_a_socket_is_released() {
        let server = server_with_grace(Duration::ZERO);
        let coordinator = Arc::clone(server.coordinator());
        let mut cy = TestClient::connect(&server);
        cy.join("r1", "u3", "Cy").await;

        let mut shared = TestClient::connect(&server);
        shared.join("r1", "u1", "Ann").await;
        shared.join("r1", "u2", "Bob").await;
        assert_eq!(roster(&coordinator.participants("r1").await.unwrap()), ["u3", "u1", "u2"]);

        drop(shared);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let participants = coordinator.participants("r1").await.unwrap();
        assert_eq!(roster(&participants), ["u3"]);
        assert_eq!(participants.host.map(|h| h.user_id), Some("u3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn left_identity_is_not_disconnected_again() {
        let server = server_with_grace(Duration::ZERO);
        let coordinator = Arc::clone(server.coordinator());
        let mut ann = TestClient::connect(&server);
        ann.join("r1", "u1", "Ann").await;
        ann.join("r1", "u2", "Bob").await;

        ann.send(r#"{"type":"leave_room","room":"r1","user_id":"u1"}"#);
        assert_eq!(ann.expect("status").await["msg"], "Ann has left the room.");
        assert_eq!(roster(&coordinator.participants("r1").await.unwrap()), ["u2"]);

        // The socket rejoins as u1 from another tab and then drops.
        let mut other_tab = TestClient::connect(&server);
        other_tab.join("r1", "u1", "Ann").await;
        drop(ann);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(roster(&coordinator.participants("r1").await.unwrap()), ["u1"]);
    }
}
