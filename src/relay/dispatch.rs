//! Relay Frame Dispatch
//!
//! Unicast/broadcast routing between room members. This module only
//! routes: it never mutates Room or Player state, and dispatch for
//! different rooms runs fully in parallel.
//!
//! Delivery failures are silent. A unicast whose target address has
//! no owner behaves like a LAN where no host answers: the frame
//! simply disappears.

use tokio::sync::mpsc;
use tracing::trace;

use crate::core::addr::VirtualAddr;
use crate::protocol::{ConnId, FrameRecv};
use crate::relay::registry::RoomRegistry;
use crate::relay::Outbound;

/// Relay a frame to the single member of the caller's room owning
/// `target`. Returns whether a recipient was found; `false` is not an
/// error condition.
pub async fn relay_unicast(
    registry: &RoomRegistry,
    caller: ConnId,
    target: VirtualAddr,
    frame: Vec<u8>,
) -> bool {
    let Some(room) = registry.room_of(caller).await else {
        trace!(%caller, "unicast from connection outside any room, dropped");
        return false;
    };

    let delivery = {
        let room = room.read().await;
        let sender_addr = match room.member_by_conn(caller) {
            Some(p) => p.address,
            None => return false,
        };
        room.member_by_addr(target)
            .map(|p| (p.sender.clone(), sender_addr))
    };

    match delivery {
        Some((tx, sender_addr)) => {
            deliver(&tx, sender_addr, frame).await;
            true
        }
        None => {
            trace!(%target, "unicast target not in room, dropped");
            false
        }
    }
}

/// Relay a frame to every member of the caller's room except the
/// caller, tagged with the caller's virtual address. Returns the
/// recipient count.
pub async fn relay_broadcast(registry: &RoomRegistry, caller: ConnId, frame: Vec<u8>) -> usize {
    let Some(room) = registry.room_of(caller).await else {
        trace!(%caller, "broadcast from connection outside any room, dropped");
        return 0;
    };

    let (sender_addr, targets) = {
        let room = room.read().await;
        let sender_addr = match room.member_by_conn(caller) {
            Some(p) => p.address,
            None => return 0,
        };
        let targets: Vec<mpsc::Sender<Outbound>> = room
            .players()
            .iter()
            .filter(|p| p.connection_id != caller)
            .map(|p| p.sender.clone())
            .collect();
        (sender_addr, targets)
    };

    let count = targets.len();
    for tx in targets {
        deliver(&tx, sender_addr, frame.clone()).await;
    }
    count
}

async fn deliver(tx: &mpsc::Sender<Outbound>, sender: VirtualAddr, frame: Vec<u8>) {
    trace!(%sender, len = frame.len(), "relaying frame");
    let _ = tx.send(Outbound::Frame(FrameRecv { sender, frame })).await;
}
