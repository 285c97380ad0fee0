//! Relay Session Client
//!
//! Owns the WebSocket connection to a relay. Control calls (create,
//! join, leave, list) are async request/reply; frames go out through a
//! non-blocking send path and come in on a bounded channel.
//!
//! The connection lives in a spawned actor task. If the transport
//! drops, the actor reconnects with a fixed backoff and automatically
//! rejoins the room it was in; callers observe the transitions through
//! a state watch and [`SessionEvent`]s.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::core::addr::VirtualAddr;
use crate::protocol::{
    ClientMessage, CreateReply, CreateRoomRequest, FrameRecv, FrameSend, JoinReply,
    JoinRoomRequest, PlayerInfo, RoomSummary, ServerMessage,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for each connection attempt.
    pub connect_timeout: Duration,
    /// Timeout for a control call reply.
    pub call_timeout: Duration,
    /// Delay between reconnection attempts.
    pub reconnect_backoff: Duration,
    /// Outgoing command queue depth. Frame sends beyond this are
    /// rejected with [`ClientError::Backpressure`].
    pub send_queue_depth: usize,
    /// Session event queue depth.
    pub event_queue_depth: usize,
    /// Inbound frame queue depth. Frames beyond this are dropped.
    pub frame_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(2),
            send_queue_depth: 256,
            event_queue_depth: 64,
            frame_queue_depth: 256,
        }
    }
}

/// Session client errors.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection attempt failed or timed out.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The session is closed (disconnected, or the actor task is gone).
    #[error("session is closed")]
    Closed,

    /// No reply to a control call within the configured timeout.
    #[error("control call timed out")]
    CallTimeout,

    /// No room with the requested code.
    #[error("room {0} not found")]
    RoomNotFound(String),

    /// Room already at capacity.
    #[error("room {0} is full")]
    RoomFull(String),

    /// Requested capacity outside the addressable range.
    #[error("invalid room capacity: {0}")]
    InvalidCapacity(u16),

    /// Outgoing queue is full; the frame was not sent.
    #[error("send queue full, frame dropped")]
    Backpressure,

    /// The relay answered with a reply the call did not expect.
    #[error("unexpected reply from relay")]
    UnexpectedReply,
}

/// Connection lifecycle, observable through [`SessionClient::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Live connection to the relay.
    Connected,
    /// Transport lost; attempting to reconnect.
    Reconnecting,
}

/// Asynchronous session notifications.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state transition.
    StateChanged(ConnectionState),
    /// A player joined the current room.
    PlayerJoined(PlayerInfo),
    /// A player left the current room.
    PlayerLeft {
        /// Connection of the departed member.
        connection_id: crate::protocol::ConnId,
    },
    /// Host role moved to another member.
    HostChanged(PlayerInfo),
    /// Reconnected and rejoined the previous room. The address may
    /// differ from the one held before the drop.
    Rejoined {
        /// Room that was rejoined.
        room_code: String,
        /// Newly assigned virtual address.
        address: VirtualAddr,
    },
    /// Reconnected but the previous room could not be rejoined. The
    /// session stays connected with no room membership.
    RejoinFailed {
        /// Room that could not be rejoined.
        room_code: String,
        /// Why the rejoin was refused.
        reason: String,
    },
}

/// Receiving half of a session: events and relayed frames.
pub struct Inbound {
    /// Session notifications.
    pub events: mpsc::Receiver<SessionEvent>,
    /// Frames relayed from other room members.
    pub frames: mpsc::Receiver<FrameRecv>,
}

enum Command {
    Call {
        msg: ClientMessage,
        reply: oneshot::Sender<ServerMessage>,
    },
    Frame {
        target: Option<VirtualAddr>,
        frame: Vec<u8>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a relay session. Cheap to clone; all clones drive the
/// same connection.
#[derive(Clone)]
pub struct SessionClient {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    addr_rx: watch::Receiver<Option<VirtualAddr>>,
    display_name: String,
    call_timeout: Duration,
}

impl SessionClient {
    /// Connect to a relay at `endpoint` (a `ws://` URL) and spawn the
    /// session actor.
    pub async fn connect(
        endpoint: &str,
        display_name: &str,
        config: ClientConfig,
    ) -> Result<(Self, Inbound), ClientError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (addr_tx, addr_rx) = watch::channel(None);
        let ws = dial(endpoint, config.connect_timeout).await?;
        let _ = state_tx.send(ConnectionState::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel(config.send_queue_depth);
        let (events_tx, events) = mpsc::channel(config.event_queue_depth);
        let (frames_tx, frames) = mpsc::channel(config.frame_queue_depth);

        let actor = Actor {
            endpoint: endpoint.to_string(),
            display_name: display_name.to_string(),
            config: config.clone(),
            cmd_rx,
            events_tx,
            frames_tx,
            state_tx,
            addr_tx,
            pending: VecDeque::new(),
            room: None,
        };
        tokio::spawn(actor.run(ws));

        let client = Self {
            cmd_tx,
            state_rx,
            addr_rx,
            display_name: display_name.to_string(),
            call_timeout: config.call_timeout,
        };
        Ok((client, Inbound { events, frames }))
    }

    /// Create a room and become its host. Returns the room code and
    /// the caller's virtual address.
    pub async fn create_room(
        &self,
        game_label: &str,
        max_players: u16,
    ) -> Result<(String, VirtualAddr), ClientError> {
        let call = ClientMessage::CreateRoom(CreateRoomRequest {
            game_label: game_label.to_string(),
            display_name: self.display_name.clone(),
            max_players,
        });
        match self.call(call).await? {
            ServerMessage::CreateResult(CreateReply::Ok { room_code, address }) => {
                Ok((room_code, address))
            }
            ServerMessage::CreateResult(CreateReply::InvalidCapacity { max_players }) => {
                Err(ClientError::InvalidCapacity(max_players))
            }
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Join a room by code (case-insensitive). Returns the caller's
    /// virtual address and the full roster including the caller.
    pub async fn join_room(
        &self,
        room_code: &str,
    ) -> Result<(VirtualAddr, Vec<PlayerInfo>), ClientError> {
        let code = room_code.trim().to_ascii_uppercase();
        let call = ClientMessage::JoinRoom(JoinRoomRequest {
            room_code: code.clone(),
            display_name: self.display_name.clone(),
        });
        match self.call(call).await? {
            ServerMessage::JoinResult(JoinReply::Ok { address, members }) => {
                Ok((address, members))
            }
            ServerMessage::JoinResult(JoinReply::NotFound) => {
                Err(ClientError::RoomNotFound(code))
            }
            ServerMessage::JoinResult(JoinReply::Full) => Err(ClientError::RoomFull(code)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Leave the current room. Idempotent.
    pub async fn leave_room(&self) -> Result<(), ClientError> {
        match self.call(ClientMessage::LeaveRoom).await? {
            ServerMessage::LeaveAck => Ok(()),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Snapshot of all live rooms on the relay.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ClientError> {
        match self.call(ClientMessage::ListRooms).await? {
            ServerMessage::RoomList { rooms } => Ok(rooms),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Round-trip latency probe.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let sent = now_millis();
        match self.call(ClientMessage::Ping { timestamp: sent }).await? {
            ServerMessage::Pong { timestamp, .. } if timestamp == sent => {
                Ok(Duration::from_millis(now_millis().saturating_sub(sent)))
            }
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Send a frame to a single room member. Non-blocking: a full
    /// queue rejects the frame instead of stalling the capture path.
    pub fn send_unicast(&self, target: VirtualAddr, frame: Vec<u8>) -> Result<(), ClientError> {
        self.send_frame(Some(target), frame)
    }

    /// Send a frame to every other room member. Non-blocking.
    pub fn send_broadcast(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.send_frame(None, frame)
    }

    fn send_frame(&self, target: Option<VirtualAddr>, frame: Vec<u8>) -> Result<(), ClientError> {
        self.cmd_tx
            .try_send(Command::Frame { target, frame })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
            })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// The caller's room-scoped virtual address, or `None` while not a
    /// member of any room. Updated before the corresponding call
    /// returns, and by rejoin after a reconnect.
    pub fn current_address(&self) -> Option<VirtualAddr> {
        *self.addr_rx.borrow()
    }

    /// Watch channel for connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Close the session. When this returns, the actor has stopped and
    /// no further frames or events will be delivered.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect { ack: ack_tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        ack_rx.await.map_err(|_| ClientError::Closed)
    }

    async fn call(&self, msg: ClientMessage) -> Result<ServerMessage, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                msg,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(ClientError::CallTimeout),
            Ok(Err(_)) => Err(ClientError::Closed),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

async fn dial(endpoint: &str, timeout: Duration) -> Result<Ws, ClientError> {
    match tokio::time::timeout(timeout, connect_async(endpoint)).await {
        Err(_) => Err(ClientError::Connect(
            "connection attempt timed out".to_string(),
        )),
        Ok(Err(e)) => Err(ClientError::Connect(e.to_string())),
        Ok(Ok((ws, _response))) => Ok(ws),
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// SESSION ACTOR
// =============================================================================

/// What the actor expects the next in-order reply to resolve.
enum CallKind {
    Create,
    Join(String),
    Leave,
    Other,
}

impl CallKind {
    fn of(msg: &ClientMessage) -> Self {
        match msg {
            ClientMessage::CreateRoom(_) => CallKind::Create,
            ClientMessage::JoinRoom(req) => CallKind::Join(req.room_code.clone()),
            ClientMessage::LeaveRoom => CallKind::Leave,
            _ => CallKind::Other,
        }
    }
}

struct PendingCall {
    reply: oneshot::Sender<ServerMessage>,
    kind: CallKind,
}

#[derive(Clone)]
struct Membership {
    room_code: String,
    address: VirtualAddr,
}

enum Driven {
    /// Graceful stop; the actor is done.
    Stop,
    /// Transport failed; try to reconnect.
    TransportLost,
}

struct Actor {
    endpoint: String,
    display_name: String,
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<SessionEvent>,
    frames_tx: mpsc::Sender<FrameRecv>,
    state_tx: watch::Sender<ConnectionState>,
    addr_tx: watch::Sender<Option<VirtualAddr>>,
    pending: VecDeque<PendingCall>,
    room: Option<Membership>,
}

impl Actor {
    async fn run(mut self, mut ws: Ws) {
        loop {
            match self.drive(&mut ws).await {
                Driven::Stop => {
                    let _ = ws.close(None).await;
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                Driven::TransportLost => match self.reconnect().await {
                    Some(new_ws) => ws = new_ws,
                    None => {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                },
            }
        }
    }

    /// Run the connected session until graceful stop or transport loss.
    async fn drive(&mut self, ws: &mut Ws) -> Driven {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    // All client handles dropped.
                    None => return Driven::Stop,

                    Some(Command::Disconnect { ack }) => {
                        if self.room.is_some() {
                            if let Ok(text) = ClientMessage::LeaveRoom.to_json() {
                                let _ = ws.send(Message::Text(text)).await;
                            }
                        }
                        self.set_room(None);
                        self.pending.clear();
                        let _ = ack.send(());
                        return Driven::Stop;
                    }

                    Some(Command::Call { msg, reply }) => {
                        let kind = CallKind::of(&msg);
                        let text = match msg.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode control call");
                                continue;
                            }
                        };
                        self.pending.push_back(PendingCall { reply, kind });
                        if ws.send(Message::Text(text)).await.is_err() {
                            return Driven::TransportLost;
                        }
                    }

                    Some(Command::Frame { target, frame }) => {
                        let Some(room) = &self.room else {
                            trace!("frame send outside a room, dropped");
                            continue;
                        };
                        let envelope = FrameSend {
                            room_code: room.room_code.clone(),
                            target,
                            frame,
                        };
                        let bytes = match envelope.to_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(error = %e, "failed to encode frame envelope");
                                continue;
                            }
                        };
                        if ws.send(Message::Binary(bytes)).await.is_err() {
                            return Driven::TransportLost;
                        }
                    }
                },

                incoming = ws.next() => match incoming {
                    None => return Driven::TransportLost,
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        return Driven::TransportLost;
                    }
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                    Some(Ok(Message::Close(_))) => return Driven::TransportLost,
                    Some(Ok(_)) => {} // transport-level ping/pong
                },
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let msg = match ServerMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "unparseable relay message");
                return;
            }
        };
        match msg {
            ServerMessage::Connected {
                connection_id,
                server_version,
            } => {
                debug!(%connection_id, %server_version, "relay greeting");
            }
            ServerMessage::PlayerJoined(info) => {
                self.emit(SessionEvent::PlayerJoined(info));
            }
            ServerMessage::PlayerLeft { connection_id } => {
                self.emit(SessionEvent::PlayerLeft { connection_id });
            }
            ServerMessage::HostChanged(info) => {
                self.emit(SessionEvent::HostChanged(info));
            }
            ServerMessage::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "relay error");
            }
            ServerMessage::Shutdown { reason } => {
                info!(%reason, "relay is shutting down");
            }
            reply => self.resolve_call(reply),
        }
    }

    /// Replies arrive in call order, so the head of the pending queue
    /// is the call this reply belongs to.
    fn resolve_call(&mut self, reply: ServerMessage) {
        let Some(call) = self.pending.pop_front() else {
            warn!("unsolicited reply from relay");
            return;
        };
        match (&call.kind, &reply) {
            (CallKind::Create, ServerMessage::CreateResult(CreateReply::Ok { room_code, address })) => {
                self.set_room(Some(Membership {
                    room_code: room_code.clone(),
                    address: *address,
                }));
            }
            (CallKind::Join(code), ServerMessage::JoinResult(JoinReply::Ok { address, .. })) => {
                self.set_room(Some(Membership {
                    room_code: code.clone(),
                    address: *address,
                }));
            }
            (CallKind::Leave, ServerMessage::LeaveAck) => {
                self.set_room(None);
            }
            _ => {}
        }
        let _ = call.reply.send(reply);
    }

    fn handle_binary(&mut self, data: &[u8]) {
        match FrameRecv::from_bytes(data) {
            Ok(envelope) => {
                if self.frames_tx.try_send(envelope).is_err() {
                    trace!("inbound frame queue full, frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "unparseable frame envelope"),
        }
    }

    /// Reconnect with backoff, then rejoin the previous room if there
    /// was one. Returns `None` when the session is being torn down.
    async fn reconnect(&mut self) -> Option<Ws> {
        // In-flight calls cannot complete across a new connection;
        // dropping the reply senders wakes their callers with Closed.
        self.pending.clear();
        self.set_state(ConnectionState::Reconnecting);

        loop {
            // One backoff timer per attempt. Draining commands must not
            // restart it, or steady frame traffic from the bridge would
            // postpone the dial forever.
            let backoff = tokio::time::sleep(self.config.reconnect_backoff);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        None => return None,
                        Some(Command::Disconnect { ack }) => {
                            let _ = ack.send(());
                            return None;
                        }
                        // Calls fail fast (reply sender dropped); frames
                        // are dropped while disconnected.
                        Some(Command::Call { .. }) | Some(Command::Frame { .. }) => {}
                    },
                }
            }

            let mut ws = match dial(&self.endpoint, self.config.connect_timeout).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    continue;
                }
            };
            info!(endpoint = %self.endpoint, "reconnected to relay");

            if let Some(room) = self.room.take() {
                if !self.rejoin(&mut ws, room).await {
                    // Transport failed mid-rejoin; back to the loop.
                    continue;
                }
            }
            self.set_state(ConnectionState::Connected);
            return Some(ws);
        }
    }

    /// Rejoin `room` on a fresh connection. Returns false if the
    /// transport failed and the reconnect loop should start over.
    async fn rejoin(&mut self, ws: &mut Ws, room: Membership) -> bool {
        let request = ClientMessage::JoinRoom(JoinRoomRequest {
            room_code: room.room_code.clone(),
            display_name: self.display_name.clone(),
        });
        let text = match request.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode rejoin call");
                self.set_room(None);
                return true;
            }
        };
        if ws.send(Message::Text(text)).await.is_err() {
            self.set_room(Some(room));
            return false;
        }

        // Skip the greeting and anything else until the join reply.
        let reply = tokio::time::timeout(self.config.call_timeout, async {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(ServerMessage::JoinResult(reply)) = ServerMessage::from_json(&text) {
                        return Some(reply);
                    }
                }
            }
            None
        })
        .await;

        match reply {
            Err(_) | Ok(None) => {
                self.set_room(Some(room));
                false
            }
            Ok(Some(JoinReply::Ok { address, .. })) => {
                info!(room_code = %room.room_code, %address, "rejoined room");
                self.set_room(Some(Membership {
                    room_code: room.room_code.clone(),
                    address,
                }));
                self.emit(SessionEvent::Rejoined {
                    room_code: room.room_code,
                    address,
                });
                true
            }
            Ok(Some(JoinReply::NotFound)) => {
                self.set_room(None);
                self.emit(SessionEvent::RejoinFailed {
                    room_code: room.room_code,
                    reason: "room no longer exists".to_string(),
                });
                true
            }
            Ok(Some(JoinReply::Full)) => {
                self.set_room(None);
                self.emit(SessionEvent::RejoinFailed {
                    room_code: room.room_code,
                    reason: "room is full".to_string(),
                });
                true
            }
        }
    }

    fn set_room(&mut self, room: Option<Membership>) {
        let _ = self.addr_tx.send(room.as_ref().map(|r| r.address));
        self.room = room;
    }

    fn set_state(&mut self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            trace!("session event queue full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayConfig, RelayServer};

    async fn spawn_relay() -> String {
        let server = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop a listener so the port is known-dead.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SessionClient::connect(
            &format!("ws://{}", addr),
            "Alice",
            ClientConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();

        let (code, address) = client.create_room("DOTA", 8).await.unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(address.octets()[0], 10);
        assert_eq!(address.octets()[3], 1);

        let rooms = client.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room_code, code);
        assert_eq!(rooms[0].host_name, "Alice");

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Bob", ClientConfig::default())
                .await
                .unwrap();

        let err = client.join_room("zzzzzz").await.unwrap_err();
        assert!(matches!(err, ClientError::RoomNotFound(code) if code == "ZZZZZZ"));
    }

    #[tokio::test]
    async fn test_invalid_capacity() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();

        let err = client.create_room("DOTA", 0).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidCapacity(0)));
    }

    #[tokio::test]
    async fn test_join_events_reach_host() {
        let endpoint = spawn_relay().await;
        let (host, mut host_inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();
        let (guest, _guest_inbound) =
            SessionClient::connect(&endpoint, "Bob", ClientConfig::default())
                .await
                .unwrap();

        let (code, _) = host.create_room("DOTA", 8).await.unwrap();
        let (guest_addr, members) = guest.join_room(&code).await.unwrap();
        assert_eq!(members.len(), 2);

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match host_inbound.events.recv().await {
                    Some(SessionEvent::PlayerJoined(info)) => return info,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.display_name, "Bob");
        assert_eq!(event.address, guest_addr);
    }

    #[tokio::test]
    async fn test_frame_send_outside_room_is_dropped() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();

        // Accepted into the queue; the actor drops it with no room.
        client.send_broadcast(vec![0u8; 20]).unwrap();
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();

        client.create_room("DOTA", 4).await.unwrap();
        client.leave_room().await.unwrap();
        client.leave_room().await.unwrap();
    }

    /// Scripted server half for transport-loss tests.
    type ServerWs = WebSocketStream<tokio::net::TcpStream>;

    async fn accept_ws(listener: &tokio::net::TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn expect_join(ws: &mut ServerWs) -> JoinRoomRequest {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientMessage::JoinRoom(req)) = ClientMessage::from_json(&text) {
                    return req;
                }
            }
        }
        panic!("connection ended before a join call");
    }

    async fn send_join_reply(ws: &mut ServerWs, reply: JoinReply) {
        let text = ServerMessage::JoinResult(reply).to_json().unwrap();
        ws.send(Message::Text(text)).await.unwrap();
    }

    fn fast_reconnect_config() -> ClientConfig {
        ClientConfig {
            reconnect_backoff: Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_transport_loss() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection drops right after the handshake.
            let ws = accept_ws(&listener).await;
            drop(ws);
            // Second connection stays up.
            let _hold = accept_ws(&listener).await;
            std::future::pending::<()>().await
        });

        let (client, mut inbound) = SessionClient::connect(
            &format!("ws://{}", addr),
            "Alice",
            fast_reconnect_config(),
        )
        .await
        .unwrap();

        let mut saw_reconnecting = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = inbound.events.recv().await {
                if let SessionEvent::StateChanged(state) = event {
                    match state {
                        ConnectionState::Reconnecting => saw_reconnecting = true,
                        ConnectionState::Connected if saw_reconnecting => return,
                        _ => {}
                    }
                }
            }
            panic!("event channel closed before reconnect");
        })
        .await
        .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_proceeds_under_frame_traffic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let ws = accept_ws(&listener).await;
            drop(ws);
            let _hold = accept_ws(&listener).await;
            std::future::pending::<()>().await
        });

        let (client, mut inbound) = SessionClient::connect(
            &format!("ws://{}", addr),
            "Alice",
            ClientConfig {
                reconnect_backoff: Duration::from_millis(200),
                ..ClientConfig::default()
            },
        )
        .await
        .unwrap();

        // A capturing bridge keeps producing frames while the transport
        // is down; sending faster than the backoff interval must not
        // postpone the dial.
        let spammer = {
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    let _ = client.send_broadcast(vec![0u8; 20]);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        };

        let mut saw_reconnecting = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = inbound.events.recv().await {
                if let SessionEvent::StateChanged(state) = event {
                    match state {
                        ConnectionState::Reconnecting => saw_reconnecting = true,
                        ConnectionState::Connected if saw_reconnecting => return,
                        _ => {}
                    }
                }
            }
            panic!("event channel closed before reconnect");
        })
        .await
        .unwrap();
        spammer.abort();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_current_address_tracks_membership() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();
        assert_eq!(client.current_address(), None);

        let (_code, address) = client.create_room("DOTA", 4).await.unwrap();
        assert_eq!(client.current_address(), Some(address));

        client.leave_room().await.unwrap();
        assert_eq!(client.current_address(), None);
    }

    #[tokio::test]
    async fn test_rejoin_after_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first_addr = std::net::Ipv4Addr::new(10, 5, 6, 2);
        let second_addr = std::net::Ipv4Addr::new(10, 5, 6, 3);

        tokio::spawn(async move {
            let mut ws = accept_ws(&listener).await;
            let req = expect_join(&mut ws).await;
            assert_eq!(req.room_code, "ABC123");
            send_join_reply(
                &mut ws,
                JoinReply::Ok {
                    address: first_addr,
                    members: vec![],
                },
            )
            .await;
            drop(ws);

            // The reconnect rejoins automatically; grant a new address.
            let mut ws = accept_ws(&listener).await;
            let req = expect_join(&mut ws).await;
            assert_eq!(req.room_code, "ABC123");
            send_join_reply(
                &mut ws,
                JoinReply::Ok {
                    address: second_addr,
                    members: vec![],
                },
            )
            .await;
            let _hold = ws;
            std::future::pending::<()>().await
        });

        let (client, mut inbound) = SessionClient::connect(
            &format!("ws://{}", addr),
            "Alice",
            fast_reconnect_config(),
        )
        .await
        .unwrap();

        let (joined_addr, _) = client.join_room("abc123").await.unwrap();
        assert_eq!(joined_addr, first_addr);

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match inbound.events.recv().await {
                    Some(SessionEvent::Rejoined { room_code, address }) => {
                        return (room_code, address)
                    }
                    Some(_) => continue,
                    None => panic!("event channel closed before rejoin"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.0, "ABC123");
        assert_eq!(event.1, second_addr);
        assert_eq!(client.current_address(), Some(second_addr));
    }

    #[tokio::test]
    async fn test_rejoin_failure_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut ws = accept_ws(&listener).await;
            expect_join(&mut ws).await;
            send_join_reply(
                &mut ws,
                JoinReply::Ok {
                    address: std::net::Ipv4Addr::new(10, 5, 6, 2),
                    members: vec![],
                },
            )
            .await;
            drop(ws);

            // Room is gone after the drop.
            let mut ws = accept_ws(&listener).await;
            expect_join(&mut ws).await;
            send_join_reply(&mut ws, JoinReply::NotFound).await;
            let _hold = ws;
            std::future::pending::<()>().await
        });

        let (client, mut inbound) = SessionClient::connect(
            &format!("ws://{}", addr),
            "Alice",
            fast_reconnect_config(),
        )
        .await
        .unwrap();
        client.join_room("ABC123").await.unwrap();

        let room_code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match inbound.events.recv().await {
                    Some(SessionEvent::RejoinFailed { room_code, .. }) => return room_code,
                    Some(_) => continue,
                    None => panic!("event channel closed before rejoin failure"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(room_code, "ABC123");
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_state_watch() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await.unwrap();
        let mut watch = client.watch_state();
        let state = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *watch.borrow() == ConnectionState::Disconnected {
                    return ConnectionState::Disconnected;
                }
                if watch.changed().await.is_err() {
                    return *watch.borrow();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
    }
}
