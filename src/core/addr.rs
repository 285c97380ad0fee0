//! Virtual Address Allocation
//!
//! Deterministic mapping from `(room code, slot index)` to a virtual IPv4
//! address in the 10.0.0.0/8 private range. Pure functions, no I/O.
//!
//! The room contributes a 16-bit prefix derived from SHA-256 of its
//! canonical (uppercased) code, the slot index becomes the final octet:
//!
//! ```text
//! 10 . H0 . H1 . slot        H0H1 = SHA-256(room_code)[0..2]
//! ```
//!
//! Distinct slots in one room always produce distinct addresses. Two
//! different rooms may share a prefix; that is acceptable because relay
//! dispatch is scoped by room membership, never by address alone.

use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Lowest valid slot index (the host's slot).
pub const SLOT_MIN: u8 = 1;

/// Highest valid slot index. Slot 0 would yield a network-style octet,
/// 255 the subnet broadcast octet; both stay reserved.
pub const SLOT_MAX: u8 = 254;

/// Maximum players a single room can address.
pub const MAX_ADDRESSABLE_PLAYERS: usize = SLOT_MAX as usize;

/// A synthetic network address assigned to a player within a room.
///
/// Not a real hardware address: it only routes relay traffic and is
/// rewritten into injected frames so the local game stack sees peers
/// as ordinary LAN neighbors.
pub type VirtualAddr = Ipv4Addr;

/// Address allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddrError {
    /// Slot index outside the representable `[1, 254]` range.
    #[error("slot index {0} outside valid range {SLOT_MIN}..={SLOT_MAX}")]
    SlotOutOfRange(u16),
}

/// Derive the 16-bit room prefix from a room code.
///
/// Case-insensitive: `abc123` and `ABC123` map to the same prefix.
fn room_prefix(room_code: &str) -> [u8; 2] {
    let digest = Sha256::digest(room_code.to_ascii_uppercase().as_bytes());
    [digest[0], digest[1]]
}

/// Allocate the virtual address for `slot_index` within a room.
///
/// Deterministic: the same `(room_code, slot_index)` pair always yields
/// the same address, so a member's address is stable for the lifetime
/// of its membership.
pub fn allocate(room_code: &str, slot_index: u16) -> Result<VirtualAddr, AddrError> {
    if slot_index < SLOT_MIN as u16 || slot_index > SLOT_MAX as u16 {
        return Err(AddrError::SlotOutOfRange(slot_index));
    }
    let prefix = room_prefix(room_code);
    Ok(Ipv4Addr::new(10, prefix[0], prefix[1], slot_index as u8))
}
