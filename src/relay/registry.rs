//! Room Registry
//!
//! Authoritative server-side state: rooms, membership, host role and
//! capacity. One registry instance is constructed per relay process and
//! owns every Room/Player record; it is torn down with the process.
//!
//! Per-room mutations (join/leave/host promotion) serialize on the
//! room's write lock, so two concurrent joins can never overflow
//! `max_players` and concurrent leaves can never double-promote a host.
//! Operations on different rooms run fully in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::core::addr::{self, VirtualAddr, MAX_ADDRESSABLE_PLAYERS};
use crate::protocol::{ConnId, PlayerInfo, RoomSummary, ServerMessage};
use crate::relay::Outbound;

/// Characters used in room codes.
const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Room code length.
pub const ROOM_CODE_LEN: usize = 6;

/// Registry errors surfaced to the caller (and from there to the UI).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No room with this code.
    #[error("room {0} not found")]
    NotFound(String),

    /// Room membership already at capacity.
    #[error("room {0} is full")]
    RoomFull(String),

    /// Invalid room configuration.
    #[error("invalid capacity {0}: must be 1..={MAX_ADDRESSABLE_PLAYERS}")]
    Capacity(u16),
}

/// A player connected to a room. Owned exclusively by its Room while
/// connected; removed on disconnect or explicit leave.
#[derive(Debug)]
pub struct Player {
    /// Connection identifier (one per live connection).
    pub connection_id: ConnId,
    /// Display name (provided by the discovery/auth collaborator).
    pub display_name: String,
    /// Room-scoped virtual address.
    pub address: VirtualAddr,
    /// Host flag. Exactly one member holds it while the room is non-empty.
    pub is_host: bool,
    /// 1-based slot index the address was derived from.
    pub slot: u16,
    /// Join timestamp.
    pub joined_at: DateTime<Utc>,
    /// Outbound queue to this player's connection.
    pub sender: mpsc::Sender<Outbound>,
}

impl Player {
    fn info(&self) -> PlayerInfo {
        PlayerInfo {
            connection_id: self.connection_id,
            display_name: self.display_name.clone(),
            address: self.address,
            is_host: self.is_host,
            joined_at: self.joined_at,
        }
    }
}

/// A bounded group of players sharing one emulated LAN segment.
pub struct Room {
    /// Canonical (uppercased) room code.
    pub code: String,
    /// Opaque game label.
    pub game_label: String,
    /// Capacity.
    pub max_players: u16,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Members in join order (index 0 is the earliest-joined).
    players: Vec<Player>,
    /// Set the instant membership reaches zero. A closed room is
    /// unresolvable even through an already-cloned handle.
    closed: bool,
}

impl Room {
    fn new(code: String, game_label: String, max_players: u16) -> Self {
        Self {
            code,
            game_label,
            max_players,
            created_at: Utc::now(),
            players: Vec::new(),
            closed: false,
        }
    }

    /// Current member count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Members in join order.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// The member owning `address`, if any.
    pub fn member_by_addr(&self, address: VirtualAddr) -> Option<&Player> {
        self.players.iter().find(|p| p.address == address)
    }

    /// The member owning `conn`, if any.
    pub fn member_by_conn(&self, conn: ConnId) -> Option<&Player> {
        self.players.iter().find(|p| p.connection_id == conn)
    }

    /// Full roster snapshot.
    pub fn member_infos(&self) -> Vec<PlayerInfo> {
        self.players.iter().map(Player::info).collect()
    }

    /// Lowest slot index not currently occupied. Slots freed by leavers
    /// are reused so the room can always fill back to capacity.
    fn next_free_slot(&self) -> u16 {
        (1..=self.max_players)
            .find(|slot| !self.players.iter().any(|p| p.slot == *slot))
            .unwrap_or(self.max_players + 1)
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_code: self.code.clone(),
            game_label: self.game_label.clone(),
            host_name: self
                .players
                .iter()
                .find(|p| p.is_host)
                .map(|p| p.display_name.clone())
                .unwrap_or_default(),
            current_players: self.players.len() as u16,
            max_players: self.max_players,
            created_at: self.created_at,
        }
    }
}

/// What happened on a leave, for logging and connection cleanup.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    /// Room the member left.
    pub room_code: String,
    /// Room was destroyed because membership reached zero.
    pub room_destroyed: bool,
    /// Host role moved to this member.
    pub new_host: Option<PlayerInfo>,
}

/// Manages all live rooms.
pub struct RoomRegistry {
    /// Live rooms by canonical code.
    rooms: RwLock<BTreeMap<String, Arc<RwLock<Room>>>>,
    /// Connection to room-code reverse index.
    memberships: RwLock<BTreeMap<ConnId, String>>,
}

impl RoomRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            memberships: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a room with the caller as sole member and host.
    ///
    /// Returns the generated room code and the host's virtual address.
    pub async fn create_room(
        &self,
        conn: ConnId,
        game_label: &str,
        display_name: &str,
        max_players: u16,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(String, VirtualAddr), RegistryError> {
        if max_players < 1 || max_players as usize > MAX_ADDRESSABLE_PLAYERS {
            return Err(RegistryError::Capacity(max_players));
        }

        // A connection belongs to at most one room.
        self.leave_room(conn).await;

        let mut rooms = self.rooms.write().await;
        let code = loop {
            let candidate = generate_room_code();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let address =
            addr::allocate(&code, 1).map_err(|_| RegistryError::Capacity(max_players))?;

        let mut room = Room::new(code.clone(), game_label.to_string(), max_players);
        room.players.push(Player {
            connection_id: conn,
            display_name: display_name.to_string(),
            address,
            is_host: true,
            slot: 1,
            joined_at: Utc::now(),
            sender,
        });
        rooms.insert(code.clone(), Arc::new(RwLock::new(room)));
        drop(rooms);

        self.memberships.write().await.insert(conn, code.clone());

        info!(room = %code, host = %display_name, max_players, "room created");
        Ok((code, address))
    }

    /// Join an existing room at the next free slot.
    ///
    /// On success existing members are notified and the full roster is
    /// returned to the joiner.
    pub async fn join_room(
        &self,
        conn: ConnId,
        room_code: &str,
        display_name: &str,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(VirtualAddr, Vec<PlayerInfo>), RegistryError> {
        let code = room_code.to_ascii_uppercase();

        self.leave_room(conn).await;

        let room = {
            let rooms = self.rooms.read().await;
            rooms
                .get(&code)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(code.clone()))?
        };

        let (address, members, notify) = {
            let mut room = room.write().await;
            // Lost a race against the destroying leave.
            if room.closed {
                return Err(RegistryError::NotFound(code.clone()));
            }
            if room.players.len() >= room.max_players as usize {
                return Err(RegistryError::RoomFull(code.clone()));
            }

            let slot = room.next_free_slot();
            let address = addr::allocate(&code, slot)
                .map_err(|_| RegistryError::RoomFull(code.clone()))?;

            let joiner = Player {
                connection_id: conn,
                display_name: display_name.to_string(),
                address,
                is_host: false,
                slot,
                joined_at: Utc::now(),
                sender,
            };
            let joined_info = joiner.info();

            let notify: Vec<mpsc::Sender<Outbound>> =
                room.players.iter().map(|p| p.sender.clone()).collect();

            room.players.push(joiner);
            let members = room.member_infos();
            (address, members, (notify, joined_info))
        };

        self.memberships.write().await.insert(conn, code.clone());

        let (targets, joined_info) = notify;
        for tx in targets {
            let _ = tx
                .send(Outbound::Control(ServerMessage::PlayerJoined(
                    joined_info.clone(),
                )))
                .await;
        }

        debug!(room = %code, player = %display_name, %address, "player joined");
        Ok((address, members))
    }

    /// Remove the member owning `conn` from its room.
    ///
    /// Idempotent: leaving while not in any room is a no-op. Promotes
    /// the earliest-joined remaining member when the host departs, and
    /// destroys the room the instant membership reaches zero.
    pub async fn leave_room(&self, conn: ConnId) -> Option<LeaveOutcome> {
        let code = self.memberships.write().await.remove(&conn)?;

        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&code).cloned()?
        };

        let (destroyed, new_host, notify) = {
            let mut room = room.write().await;
            let idx = room
                .players
                .iter()
                .position(|p| p.connection_id == conn)?;
            let departed = room.players.remove(idx);

            let mut new_host = None;
            if room.players.is_empty() {
                room.closed = true;
            } else if departed.is_host {
                room.players[0].is_host = true;
                new_host = Some(room.players[0].info());
            }

            let notify: Vec<mpsc::Sender<Outbound>> =
                room.players.iter().map(|p| p.sender.clone()).collect();
            (room.closed, new_host, notify)
        };

        if destroyed {
            let mut rooms = self.rooms.write().await;
            rooms.remove(&code);
            info!(room = %code, "room destroyed");
        }

        for tx in &notify {
            let _ = tx
                .send(Outbound::Control(ServerMessage::PlayerLeft {
                    connection_id: conn,
                }))
                .await;
        }
        if let Some(host) = &new_host {
            debug!(room = %code, new_host = %host.display_name, "host changed");
            for tx in &notify {
                let _ = tx
                    .send(Outbound::Control(ServerMessage::HostChanged(host.clone())))
                    .await;
            }
        }

        Some(LeaveOutcome {
            room_code: code,
            room_destroyed: destroyed,
            new_host,
        })
    }

    /// Snapshot of all currently live rooms.
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<RwLock<Room>>> =
            self.rooms.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let room = room.read().await;
            if !room.closed {
                summaries.push(room.summary());
            }
        }
        summaries
    }

    /// The code of the room a connection currently belongs to.
    pub async fn room_code_of(&self, conn: ConnId) -> Option<String> {
        self.memberships.read().await.get(&conn).cloned()
    }

    /// The room a connection currently belongs to.
    pub async fn room_of(&self, conn: ConnId) -> Option<Arc<RwLock<Room>>> {
        let code = self.memberships.read().await.get(&conn).cloned()?;
        self.rooms.read().await.get(&code).cloned()
    }

    /// Live room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a 6-character alphanumeric room code.
fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
        .collect()
}
