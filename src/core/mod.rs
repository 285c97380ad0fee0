//! Core deterministic primitives.
//!
//! Pure address/frame logic shared by the relay and the client.
//! Nothing in this module performs I/O or depends on wall-clock time.

pub mod addr;
pub mod frame;

// Re-export core types
pub use addr::{allocate, AddrError, VirtualAddr, MAX_ADDRESSABLE_PLAYERS};
pub use frame::{classify, rewrite_source, FrameClass, FrameError, MIN_FRAME_LEN};
