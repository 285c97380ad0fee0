//! Relay Side
//!
//! Server-side room registry, frame dispatch and the WebSocket relay
//! server. Nothing here parses frame contents beyond the addressing
//! metadata needed to route.

pub mod dispatch;
pub mod registry;
pub mod server;

use crate::protocol::{FrameRecv, ServerMessage};

/// One connection's outbound queue entry. Control messages leave the
/// relay as JSON text, frames as binary envelopes.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Control response or membership event.
    Control(ServerMessage),
    /// Relayed frame.
    Frame(FrameRecv),
}

pub use registry::{LeaveOutcome, Player, RegistryError, Room, RoomRegistry, ROOM_CODE_LEN};
pub use server::{RelayConfig, RelayServer, RelayServerError};
