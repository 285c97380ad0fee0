//! # Virtlan
//!
//! Virtual-LAN emulation for LAN-only multiplayer games played over
//! the internet. A relay server hosts rooms and allocates room-scoped
//! virtual IPv4 addresses; game traffic captured on a virtual network
//! adapter is forwarded through the relay and injected on the peer
//! side, so games discover each other as if on one physical LAN.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         VIRTLAN                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure primitives (no I/O)                  │
//! │  ├── addr.rs     - Virtual address allocation                │
//! │  └── frame.rs    - IPv4 frame inspection and rewriting       │
//! │                                                              │
//! │  protocol.rs     - Wire messages (JSON control, binary data) │
//! │                                                              │
//! │  relay/          - Relay server                              │
//! │  ├── registry.rs - Rooms, members, address slots             │
//! │  ├── dispatch.rs - Unicast/broadcast frame fan-out           │
//! │  └── server.rs   - WebSocket accept loop and sessions        │
//! │                                                              │
//! │  client/         - Game-side components                      │
//! │  ├── session.rs  - Relay session with reconnect/rejoin       │
//! │  ├── adapter.rs  - Virtual adapter seam                      │
//! │  └── bridge.rs   - Capture/inject frame pump                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Addressing
//!
//! Every room gets a 16-bit prefix derived from its code, and every
//! member a slot in `[1, 254]`, yielding addresses of the form
//! `10.H0.H1.slot`. Two members of one room never share an address,
//! and a member's address never changes while they stay in the room.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod core;
pub mod protocol;
pub mod relay;

// Re-export commonly used types
pub use client::{Bridge, ClientConfig, SessionClient};
pub use core::addr::{VirtualAddr, MAX_ADDRESSABLE_PLAYERS};
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::{RelayConfig, RelayServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
