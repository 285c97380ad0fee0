//! WebSocket Relay Server
//!
//! Accepts client connections, answers room-lifecycle calls and routes
//! frame envelopes between room members. Control traffic is JSON text,
//! the frame data plane is binary.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::protocol::{
    ClientMessage, ConnId, CreateReply, ErrorCode, FrameSend, JoinReply, RelayError,
    ServerMessage,
};
use crate::relay::registry::{RegistryError, RoomRegistry};
use crate::relay::{dispatch, Outbound};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections idle longer than this are dropped from their room.
    pub idle_timeout: Duration,
    /// Per-connection outbound queue depth. Frames beyond this are
    /// dropped rather than stalling dispatch.
    pub send_queue_depth: usize,
    /// Server version string.
    pub version: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            send_queue_depth: 256,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Last activity, for idle cleanup.
    last_activity: Instant,
    /// Outbound queue to this client's writer task.
    sender: mpsc::Sender<Outbound>,
}

/// The relay server.
pub struct RelayServer {
    /// Server configuration.
    config: RelayConfig,
    /// Bound listener (bound eagerly so tests can read the port).
    listener: TcpListener,
    /// Authoritative room state.
    registry: Arc<RoomRegistry>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<ConnId, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind the listener and create the server.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            registry: Arc::new(RoomRegistry::new()),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        })
    }

    /// The address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayServerError> {
        info!("Relay listening on {}", self.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_registry = self.registry.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_registry, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let client_count = self.clients.read().await.len();
                            if client_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let conn_id: ConnId = Uuid::new_v4();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(config.send_queue_depth);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(
                    conn_id,
                    ConnectedClient {
                        last_activity: Instant::now(),
                        sender: msg_tx.clone(),
                    },
                );
            }

            // Spawn writer task
            let writer_task = tokio::spawn(async move {
                while let Some(outbound) = msg_rx.recv().await {
                    let ws_msg = match outbound {
                        Outbound::Control(msg) => match msg.to_json() {
                            Ok(text) => Message::Text(text),
                            Err(e) => {
                                error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        },
                        Outbound::Frame(envelope) => match envelope.to_bytes() {
                            Ok(bytes) => Message::Binary(bytes),
                            Err(e) => {
                                error!("Failed to serialize frame envelope: {}", e);
                                continue;
                            }
                        },
                    };
                    if ws_sender.send(ws_msg).await.is_err() {
                        break;
                    }
                }
            });

            // Greet with the assigned connection id.
            let _ = msg_tx
                .send(Outbound::Control(ServerMessage::Connected {
                    connection_id: conn_id,
                    server_version: config.version.clone(),
                }))
                .await;

            debug!(%conn_id, peer = %addr, "connection established");

            // Read loop
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::touch(&clients, conn_id).await;

                                let call = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", conn_id, e);
                                        let _ = msg_tx.send(Outbound::Control(
                                            ServerMessage::Error(RelayError {
                                                code: ErrorCode::InvalidMessage,
                                                message: "Invalid message format".to_string(),
                                            })
                                        )).await;
                                        continue;
                                    }
                                };

                                Self::handle_call(conn_id, call, &registry, &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                Self::touch(&clients, conn_id).await;
                                Self::handle_frame(conn_id, &data, &registry, &msg_tx).await;
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                Self::touch(&clients, conn_id).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", conn_id);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", conn_id, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(Outbound::Control(ServerMessage::Shutdown {
                            reason: "Relay shutting down".to_string(),
                        })).await;
                        break;
                    }
                }
            }

            // Cleanup: the room must forget the member before the
            // connection fully tears down.
            registry.leave_room(conn_id).await;
            clients.write().await.remove(&conn_id);
            writer_task.abort();

            debug!("Client {} cleaned up", conn_id);
        });
    }

    /// Handle a control call.
    async fn handle_call(
        conn_id: ConnId,
        call: ClientMessage,
        registry: &Arc<RoomRegistry>,
        sender: &mpsc::Sender<Outbound>,
    ) {
        match call {
            ClientMessage::CreateRoom(req) => {
                let reply = match registry
                    .create_room(
                        conn_id,
                        &req.game_label,
                        &req.display_name,
                        req.max_players,
                        sender.clone(),
                    )
                    .await
                {
                    Ok((room_code, address)) => CreateReply::Ok { room_code, address },
                    Err(RegistryError::Capacity(n)) => CreateReply::InvalidCapacity {
                        max_players: n,
                    },
                    Err(e) => {
                        // create_room only fails on capacity
                        error!("Unexpected create_room error: {}", e);
                        return;
                    }
                };
                let _ = sender
                    .send(Outbound::Control(ServerMessage::CreateResult(reply)))
                    .await;
            }
            ClientMessage::JoinRoom(req) => {
                let reply = match registry
                    .join_room(conn_id, &req.room_code, &req.display_name, sender.clone())
                    .await
                {
                    Ok((address, members)) => JoinReply::Ok { address, members },
                    Err(RegistryError::NotFound(_)) => JoinReply::NotFound,
                    Err(RegistryError::RoomFull(_)) => JoinReply::Full,
                    Err(RegistryError::Capacity(_)) => JoinReply::Full,
                };
                let _ = sender
                    .send(Outbound::Control(ServerMessage::JoinResult(reply)))
                    .await;
            }
            ClientMessage::LeaveRoom => {
                registry.leave_room(conn_id).await;
                let _ = sender.send(Outbound::Control(ServerMessage::LeaveAck)).await;
            }
            ClientMessage::ListRooms => {
                let rooms = registry.list_rooms().await;
                let _ = sender
                    .send(Outbound::Control(ServerMessage::RoomList { rooms }))
                    .await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(Outbound::Control(ServerMessage::Pong {
                        timestamp,
                        server_time: std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_millis() as u64,
                    }))
                    .await;
            }
        }
    }

    /// Handle a binary frame envelope.
    async fn handle_frame(
        conn_id: ConnId,
        data: &[u8],
        registry: &Arc<RoomRegistry>,
        sender: &mpsc::Sender<Outbound>,
    ) {
        let envelope = match FrameSend::from_bytes(data) {
            Ok(e) => e,
            Err(e) => {
                trace!("Undecodable frame envelope from {}: {}", conn_id, e);
                return;
            }
        };

        // The envelope names a room, the membership index is authoritative.
        match registry.room_code_of(conn_id).await {
            Some(code) if code.eq_ignore_ascii_case(&envelope.room_code) => {}
            Some(_) | None => {
                let _ = sender
                    .send(Outbound::Control(ServerMessage::Error(RelayError {
                        code: ErrorCode::NotInRoom,
                        message: "frame for a room this connection is not in".to_string(),
                    })))
                    .await;
                return;
            }
        }

        match envelope.target {
            Some(target) => {
                dispatch::relay_unicast(registry, conn_id, target, envelope.frame).await;
            }
            None => {
                dispatch::relay_broadcast(registry, conn_id, envelope.frame).await;
            }
        }
    }

    async fn touch(clients: &Arc<RwLock<BTreeMap<ConnId, ConnectedClient>>>, conn_id: ConnId) {
        let mut clients = clients.write().await;
        if let Some(client) = clients.get_mut(&conn_id) {
            client.last_activity = Instant::now();
        }
    }

    /// Run cleanup loop: drops idle connections out of their rooms.
    async fn run_cleanup_loop(
        clients: Arc<RwLock<BTreeMap<ConnId, ConnectedClient>>>,
        registry: Arc<RoomRegistry>,
        idle_timeout: Duration,
    ) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            let now = Instant::now();
            let to_remove: Vec<ConnId> = {
                let clients = clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(id, _)| *id)
                    .collect()
            };

            for conn_id in to_remove {
                let removed = clients.write().await.remove(&conn_id);
                if let Some(client) = removed {
                    registry.leave_room(conn_id).await;
                    let _ = client
                        .sender
                        .send(Outbound::Control(ServerMessage::Shutdown {
                            reason: "idle timeout".to_string(),
                        }))
                        .await;
                    info!("Removed idle client {}", conn_id);
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get live room count.
    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }
}
