//! Client Side
//!
//! Everything that runs next to the game process: the relay session
//! client, the virtual adapter seam, and the bridge pumping frames
//! between the two.

pub mod adapter;
pub mod bridge;
pub mod session;

pub use adapter::{AdapterError, AdapterInfo, AdapterProvider, VirtualAdapter};
pub use bridge::{Bridge, BridgeError, BridgeState};
pub use session::{ClientConfig, ClientError, ConnectionState, Inbound, SessionClient, SessionEvent};
