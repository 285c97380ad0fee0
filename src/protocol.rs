//! Protocol Messages
//!
//! Wire format for client-relay communication over WebSocket.
//! Control calls and events travel as tagged JSON text messages;
//! the frame data plane travels as bincode-encoded binary messages
//! (flat structs only — tagged enums are not bincode-friendly).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::addr::VirtualAddr;

/// Opaque per-connection identifier, assigned by the relay on accept.
pub type ConnId = Uuid;

// =============================================================================
// CLIENT -> RELAY MESSAGES
// =============================================================================

/// Control calls sent from client to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a room and become its host.
    CreateRoom(CreateRoomRequest),

    /// Join an existing room by code.
    JoinRoom(JoinRoomRequest),

    /// Leave the current room.
    LeaveRoom,

    /// Snapshot of all live rooms.
    ListRooms,

    /// Ping for latency measurement.
    Ping {
        /// Client send time (epoch millis), echoed back in the pong.
        timestamp: u64,
    },
}

/// Room creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    /// Opaque game label (consumed by the game-launch collaborator).
    pub game_label: String,
    /// Host's display name.
    pub display_name: String,
    /// Room capacity.
    pub max_players: u16,
}

/// Room join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomRequest {
    /// Target room code (case-insensitive).
    pub room_code: String,
    /// Joiner's display name.
    pub display_name: String,
}

// =============================================================================
// RELAY -> CLIENT MESSAGES
// =============================================================================

/// Control responses and events sent from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent immediately after the connection is accepted.
    Connected {
        /// Identifier assigned to this connection.
        connection_id: ConnId,
        /// Relay build version.
        server_version: String,
    },

    /// Reply to `CreateRoom`.
    CreateResult(CreateReply),

    /// Reply to `JoinRoom`.
    JoinResult(JoinReply),

    /// Reply to `LeaveRoom`. Leaving is idempotent, so this is always an ack.
    LeaveAck,

    /// Reply to `ListRooms`.
    RoomList {
        /// Snapshot of every live room.
        rooms: Vec<RoomSummary>,
    },

    /// A player joined the caller's room.
    PlayerJoined(PlayerInfo),

    /// A player left the caller's room.
    PlayerLeft {
        /// Connection of the departed member.
        connection_id: ConnId,
    },

    /// Host role moved to another member.
    HostChanged(PlayerInfo),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Relay wall-clock time at reply (epoch millis).
        server_time: u64,
    },

    /// Protocol-level error (malformed call, internal failure).
    Error(RelayError),

    /// Relay is shutting down.
    Shutdown {
        /// Human-readable shutdown reason.
        reason: String,
    },
}

/// Outcome of a `CreateRoom` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CreateReply {
    /// Room created; the caller is its sole member and host.
    Ok {
        /// Generated shareable room code.
        room_code: String,
        /// Host's virtual address.
        address: VirtualAddr,
    },
    /// `max_players` outside the addressable range.
    InvalidCapacity {
        /// The rejected capacity.
        max_players: u16,
    },
}

/// Outcome of a `JoinRoom` call. Callers pattern-match instead of
/// probing success flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JoinReply {
    /// Joined; `members` is the full roster including the caller, so the
    /// joiner can build its peer table without waiting for join events.
    Ok {
        /// Joiner's virtual address.
        address: VirtualAddr,
        /// Full roster including the caller.
        members: Vec<PlayerInfo>,
    },
    /// No room with that code.
    NotFound,
    /// Room already at capacity.
    Full,
}

/// A room member as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Connection identifier.
    pub connection_id: ConnId,
    /// Display name.
    pub display_name: String,
    /// Room-scoped virtual address.
    pub address: VirtualAddr,
    /// Host flag.
    pub is_host: bool,
    /// Join timestamp.
    pub joined_at: DateTime<Utc>,
}

/// Snapshot of one live room, for clients browsing for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    /// Room code.
    pub room_code: String,
    /// Opaque game label.
    pub game_label: String,
    /// Current host's display name.
    pub host_name: String,
    /// Current member count.
    pub current_players: u16,
    /// Capacity.
    pub max_players: u16,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Relay error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidMessage,
    /// Frame call from a connection that is not in any room.
    NotInRoom,
    /// Internal relay error.
    InternalError,
}

// =============================================================================
// FRAME DATA PLANE (binary)
// =============================================================================

/// Client→relay frame envelope. `target == None` marks a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSend {
    /// Room the sender belongs to.
    pub room_code: String,
    /// Unicast target, or `None` for broadcast to the whole room.
    pub target: Option<VirtualAddr>,
    /// Raw frame bytes, opaque to the relay.
    pub frame: Vec<u8>,
}

/// Relay→client frame envelope. Always tagged with the sender's
/// room-scoped address so the receiver can rewrite the source field
/// before injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecv {
    /// Sender's virtual address.
    pub sender: VirtualAddr,
    /// Raw frame bytes, verbatim from the sender.
    pub frame: Vec<u8>,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl FrameSend {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl FrameRecv {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_client_message_json_roundtrip() {
        let msg = ClientMessage::CreateRoom(CreateRoomRequest {
            game_label: "DOTA".to_string(),
            display_name: "Alice".to_string(),
            max_players: 8,
        });

        let json = msg.to_json().unwrap();
        let parsed = ClientMessage::from_json(&json).unwrap();

        if let ClientMessage::CreateRoom(req) = parsed {
            assert_eq!(req.game_label, "DOTA");
            assert_eq!(req.max_players, 8);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_join_reply_variants() {
        let ok = ServerMessage::JoinResult(JoinReply::Ok {
            address: Ipv4Addr::new(10, 5, 6, 2),
            members: vec![],
        });
        let json = ok.to_json().unwrap();
        assert!(json.contains("\"result\":\"ok\""));

        let not_found = ServerMessage::JoinResult(JoinReply::NotFound);
        let json = not_found.to_json().unwrap();
        let parsed = ServerMessage::from_json(&json).unwrap();
        assert!(matches!(
            parsed,
            ServerMessage::JoinResult(JoinReply::NotFound)
        ));

        let full = ServerMessage::JoinResult(JoinReply::Full);
        let parsed = ServerMessage::from_json(&full.to_json().unwrap()).unwrap();
        assert!(matches!(parsed, ServerMessage::JoinResult(JoinReply::Full)));
    }

    #[test]
    fn test_frame_send_binary_roundtrip() {
        let envelope = FrameSend {
            room_code: "ABC123".to_string(),
            target: Some(Ipv4Addr::new(10, 1, 2, 3)),
            frame: vec![0x45, 0, 0, 28],
        };

        let bytes = envelope.to_bytes().unwrap();
        let parsed = FrameSend::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.room_code, "ABC123");
        assert_eq!(parsed.target, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(parsed.frame, vec![0x45, 0, 0, 28]);
    }

    #[test]
    fn test_frame_recv_binary_roundtrip() {
        let envelope = FrameRecv {
            sender: Ipv4Addr::new(10, 9, 9, 1),
            frame: vec![1, 2, 3],
        };

        let bytes = envelope.to_bytes().unwrap();
        let parsed = FrameRecv::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender, Ipv4Addr::new(10, 9, 9, 1));
        assert_eq!(parsed.frame, vec![1, 2, 3]);
    }

    #[test]
    fn test_broadcast_marker_is_none_target() {
        let envelope = FrameSend {
            room_code: "ABC123".to_string(),
            target: None,
            frame: vec![0; 20],
        };
        let parsed = FrameSend::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert!(parsed.target.is_none());
    }

    #[test]
    fn test_error_codes() {
        let error = RelayError {
            code: ErrorCode::NotInRoom,
            message: "send a frame after joining a room".to_string(),
        };

        let msg = ServerMessage::Error(error);
        let json = msg.to_json().unwrap();
        assert!(json.contains("not_in_room"));
    }

    #[test]
    fn test_room_summary_roundtrip() {
        let msg = ServerMessage::RoomList {
            rooms: vec![RoomSummary {
                room_code: "ABC123".to_string(),
                game_label: "Warcraft III".to_string(),
                host_name: "Alice".to_string(),
                current_players: 2,
                max_players: 8,
                created_at: Utc::now(),
            }],
        };

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        if let ServerMessage::RoomList { rooms } = parsed {
            assert_eq!(rooms.len(), 1);
            assert_eq!(rooms[0].current_players, 2);
        } else {
            panic!("Wrong message type");
        }
    }
}
