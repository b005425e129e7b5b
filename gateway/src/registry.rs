//! Connection registry: one slot per socket, a player index and room
//! membership. The gateway keeps it behind a single lock; every method here
//! is synchronous so a whole command's mutation fits in one critical section.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use common_net::message::{PlayerSummary, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque per-socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Items queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// WebSocket close codes used by the gateway.
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedClient {
    pub connection_id: ConnectionId,
    pub player_id: String,
    pub display_name: String,
    pub shard_id: String,
    pub corp_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub rooms: BTreeSet<String>,
}

impl ConnectedClient {
    pub fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            player_id: self.player_id.clone(),
            player_name: self.display_name.clone(),
            shard_id: self.shard_id.clone(),
            connected_at: self.connected_at.timestamp_millis(),
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Unauthenticated,
    Authenticated(ConnectedClient),
}

#[derive(Debug)]
struct Slot {
    outbox: Outbox,
    opened_at: DateTime<Utc>,
    state: SlotState,
}

/// A connection taken out of the registry.
#[derive(Debug)]
pub struct Removed {
    pub connection_id: ConnectionId,
    pub outbox: Outbox,
    pub client: Option<ConnectedClient>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdmitError {
    UnknownConnection,
    AlreadyAuthenticated,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: HashMap<ConnectionId, Slot>,
    players: HashMap<String, ConnectionId>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, connection_id: ConnectionId, outbox: Outbox, now: DateTime<Utc>) {
        self.slots.insert(
            connection_id,
            Slot {
                outbox,
                opened_at: now,
                state: SlotState::Unauthenticated,
            },
        );
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.slots.contains_key(connection_id)
    }

    pub fn outbox(&self, connection_id: &ConnectionId) -> Option<&Outbox> {
        self.slots.get(connection_id).map(|slot| &slot.outbox)
    }

    pub fn client(&self, connection_id: &ConnectionId) -> Option<&ConnectedClient> {
        match &self.slots.get(connection_id)?.state {
            SlotState::Authenticated(client) => Some(client),
            SlotState::Unauthenticated => None,
        }
    }

    pub fn client_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut ConnectedClient> {
        match &mut self.slots.get_mut(connection_id)?.state {
            SlotState::Authenticated(client) => Some(client),
            SlotState::Unauthenticated => None,
        }
    }

    pub fn connection_for(&self, player_id: &str) -> Option<ConnectionId> {
        self.players.get(player_id).copied()
    }

    /// Promotes an unauthenticated slot. Any other live connection for the
    /// same player is removed and handed back so the caller can notify it.
    pub fn admit(&mut self, client: ConnectedClient) -> Result<Option<Removed>, AdmitError> {
        let connection_id = client.connection_id;
        match self.slots.get(&connection_id).map(|slot| &slot.state) {
            None => return Err(AdmitError::UnknownConnection),
            Some(SlotState::Authenticated(_)) => return Err(AdmitError::AlreadyAuthenticated),
            Some(SlotState::Unauthenticated) => {}
        }

        let evicted = match self.players.get(&client.player_id).copied() {
            Some(previous) if previous != connection_id => self.remove(&previous),
            _ => None,
        };

        for room in &client.rooms {
            self.rooms.entry(room.clone()).or_default().insert(connection_id);
        }
        self.players.insert(client.player_id.clone(), connection_id);
        if let Some(slot) = self.slots.get_mut(&connection_id) {
            slot.state = SlotState::Authenticated(client);
        }
        Ok(evicted)
    }

    /// Drops the slot, its room memberships and (if it still owns it) the
    /// player index entry.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<Removed> {
        let slot = self.slots.remove(connection_id)?;
        let client = match slot.state {
            SlotState::Authenticated(client) => Some(client),
            SlotState::Unauthenticated => None,
        };

        if let Some(client) = &client {
            for room in &client.rooms {
                self.forget_member(room, connection_id);
            }
            if self.players.get(&client.player_id) == Some(connection_id) {
                self.players.remove(&client.player_id);
            }
        }

        Some(Removed {
            connection_id: *connection_id,
            outbox: slot.outbox,
            client,
        })
    }

    fn forget_member(&mut self, room: &str, connection_id: &ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Adds an authenticated connection to `room`. Returns `false` for
    /// unknown or unauthenticated connections.
    pub fn join(&mut self, connection_id: &ConnectionId, room: &str) -> bool {
        let Some(client) = self.client_mut(connection_id) else {
            return false;
        };
        client.rooms.insert(room.to_string());
        self.rooms.entry(room.to_string()).or_default().insert(*connection_id);
        true
    }

    pub fn leave(&mut self, connection_id: &ConnectionId, room: &str) -> bool {
        let Some(client) = self.client_mut(connection_id) else {
            return false;
        };
        let was_member = client.rooms.remove(room);
        self.forget_member(room, connection_id);
        was_member
    }

    /// Outboxes of every member of `room` except `exclude`.
    pub fn room_outboxes(&self, room: &str, exclude: Option<&ConnectionId>) -> Vec<Outbox> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|member| Some(*member) != exclude)
            .filter_map(|member| self.outbox(member).cloned())
            .collect()
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    /// Removes every member from `room` and returns who was in it.
    pub fn close_room(&mut self, room: &str) -> Vec<ConnectionId> {
        let Some(members) = self.rooms.remove(room) else {
            return Vec::new();
        };
        for member in &members {
            if let Some(client) = self.client_mut(member) {
                client.rooms.remove(room);
            }
        }
        members.into_iter().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    pub fn online_count(&self) -> usize {
        self.players.len()
    }

    fn clients(&self) -> impl Iterator<Item = &ConnectedClient> {
        self.slots.values().filter_map(|slot| match &slot.state {
            SlotState::Authenticated(client) => Some(client),
            SlotState::Unauthenticated => None,
        })
    }

    pub fn shard_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for client in self.clients() {
            *counts.entry(client.shard_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Local players, optionally only those on `shard_id`, sorted by player id.
    pub fn players(&self, shard_id: Option<&str>) -> Vec<PlayerSummary> {
        let mut players: Vec<PlayerSummary> = self
            .clients()
            .filter(|client| shard_id.map_or(true, |shard| client.shard_id == shard))
            .map(ConnectedClient::summary)
            .collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        players
    }

    /// Connections with no sign of life since `cutoff`: authenticated ones by
    /// last ping, unauthenticated ones by when they opened.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .filter(|(_, slot)| match &slot.state {
                SlotState::Authenticated(client) => client.last_ping < cutoff,
                SlotState::Unauthenticated => slot.opened_at < cutoff,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn outboxes(&self) -> Vec<Outbox> {
        self.slots.values().map(|slot| slot.outbox.clone()).collect()
    }

    pub fn drain(&mut self) -> Vec<Removed> {
        let ids: Vec<ConnectionId> = self.slots.keys().copied().collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: ConnectionId, player: &str, shard: &str, rooms: &[&str]) -> ConnectedClient {
        let now = Utc::now();
        ConnectedClient {
            connection_id: id,
            player_id: player.to_string(),
            display_name: player.to_string(),
            shard_id: shard.to_string(),
            corp_id: None,
            connected_at: now,
            last_ping: now,
            rooms: rooms.iter().map(|room| room.to_string()).collect(),
        }
    }

    fn open(registry: &mut Registry) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        registry.open(id, tx, Utc::now());
        (id, rx)
    }

    #[test]
    fn second_admit_for_player_evicts_first() {
        let mut registry = Registry::new();
        let (first, _rx1) = open(&mut registry);
        let (second, _rx2) = open(&mut registry);

        assert!(registry.admit(client(first, "alice", "eu-1", &["global", "shard:eu-1"])).expect("admit").is_none());
        let evicted = registry
            .admit(client(second, "alice", "eu-1", &["global", "shard:eu-1"]))
            .expect("admit")
            .expect("evicted");

        assert_eq!(evicted.connection_id, first);
        assert_eq!(evicted.client.map(|c| c.player_id), Some("alice".to_string()));
        assert!(!registry.contains(&first));
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.connection_for("alice"), Some(second));
        assert_eq!(registry.room_size("shard:eu-1"), 1);
    }

    #[test]
    fn admit_rejects_unknown_and_repeat() {
        let mut registry = Registry::new();
        let (id, _rx) = open(&mut registry);
        let ghost = ConnectionId::new();

        assert!(matches!(
            registry.admit(client(ghost, "bob", "eu-1", &[])),
            Err(AdmitError::UnknownConnection)
        ));
        registry.admit(client(id, "bob", "eu-1", &[])).expect("admit");
        assert!(matches!(
            registry.admit(client(id, "bob", "eu-1", &[])),
            Err(AdmitError::AlreadyAuthenticated)
        ));
    }

    #[test]
    fn rooms_follow_membership() {
        let mut registry = Registry::new();
        let (a, _ra) = open(&mut registry);
        let (b, _rb) = open(&mut registry);
        let (pending, _rp) = open(&mut registry);
        registry.admit(client(a, "alice", "eu-1", &["global"])).expect("admit");
        registry.admit(client(b, "bob", "us-1", &["global"])).expect("admit");

        assert!(registry.join(&a, "raid:r1"));
        assert!(registry.join(&b, "raid:r1"));
        assert!(!registry.join(&pending, "raid:r1"));
        assert_eq!(registry.room_outboxes("raid:r1", Some(&a)).len(), 1);

        let members = registry.close_room("raid:r1");
        assert_eq!(members.len(), 2);
        assert_eq!(registry.room_size("raid:r1"), 0);
        assert!(!registry.client(&a).expect("a").rooms.contains("raid:r1"));

        assert!(registry.leave(&b, "global"));
        assert!(!registry.leave(&b, "global"));
        assert_eq!(registry.room_size("global"), 1);
    }

    #[test]
    fn stats_count_authenticated_clients_only() {
        let mut registry = Registry::new();
        let (a, _ra) = open(&mut registry);
        let (b, _rb) = open(&mut registry);
        let (_pending, _rp) = open(&mut registry);
        registry.admit(client(a, "alice", "eu-1", &[])).expect("admit");
        registry.admit(client(b, "bob", "us-1", &[])).expect("admit");

        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.online_count(), 2);
        assert_eq!(registry.shard_counts().get("eu-1"), Some(&1));
        assert_eq!(registry.players(Some("us-1")).len(), 1);
        assert_eq!(registry.players(None).len(), 2);
    }

    #[test]
    fn idle_detection_uses_last_ping() {
        let mut registry = Registry::new();
        let (a, _ra) = open(&mut registry);
        let mut stale = client(a, "alice", "eu-1", &[]);
        stale.last_ping = Utc::now() - chrono::Duration::minutes(10);
        registry.admit(stale).expect("admit");
        let (_fresh, _rf) = open(&mut registry);

        let idle = registry.idle_since(Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(idle, vec![a]);
    }
}
