//! Frame Classification and Rewriting
//!
//! Just enough IPv4 header surgery to route captured frames: extract the
//! destination address, decide unicast vs broadcast, and rewrite the
//! source field of inbound frames before injection. Pure byte work,
//! no I/O, no allocation beyond the caller's buffer.

use std::net::Ipv4Addr;
use thiserror::Error;

use super::addr::VirtualAddr;

/// Minimum bytes a frame must carry to be routable (IPv4 header).
pub const MIN_FRAME_LEN: usize = 20;

/// Byte offset of the IPv4 source address field.
pub const SRC_ADDR_OFFSET: usize = 12;

/// Byte offset of the IPv4 destination address field.
pub const DST_ADDR_OFFSET: usize = 16;

/// Frame inspection errors. Truncated frames are dropped by callers,
/// never forwarded or injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame shorter than the minimum routable header.
    #[error("frame truncated: {0} bytes, need at least {MIN_FRAME_LEN}")]
    Truncated(usize),
}

/// How a captured frame should be relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Deliver to the single member owning this address.
    Unicast(VirtualAddr),
    /// Deliver to every other room member.
    Broadcast,
}

fn addr_at(frame: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    )
}

/// Extract the destination address of a frame.
pub fn destination(frame: &[u8]) -> Result<Ipv4Addr, FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    Ok(addr_at(frame, DST_ADDR_OFFSET))
}

/// Extract the source address of a frame.
pub fn source(frame: &[u8]) -> Result<Ipv4Addr, FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    Ok(addr_at(frame, SRC_ADDR_OFFSET))
}

/// Classify a frame by destination: the limited broadcast address and
/// the class-D multicast range are shared-medium traffic, everything
/// else is unicast to one peer.
pub fn classify(frame: &[u8]) -> Result<FrameClass, FrameError> {
    let dst = destination(frame)?;
    if dst.is_broadcast() || dst.is_multicast() {
        Ok(FrameClass::Broadcast)
    } else {
        Ok(FrameClass::Unicast(dst))
    }
}

/// Rewrite the source address field in place.
///
/// Touches exactly the four source bytes; length and every other field
/// are left unchanged, so the injected frame is byte-identical to the
/// original apart from the sender's room-scoped address.
pub fn rewrite_source(frame: &mut [u8], sender: VirtualAddr) -> Result<(), FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    frame[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4].copy_from_slice(&sender.octets());
    Ok(())
}
