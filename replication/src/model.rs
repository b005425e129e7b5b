//! Global entities shared by every shard.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use common_net::message::{SyncEvent, SyncEventType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReplicationError;

/// Corporation aggregate. Written by merge-upsert only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporationAggregate {
    pub corp_id: String,
    pub name: String,
    pub leader_id: String,
    pub origin_shard: String,
    pub member_count: i64,
    pub funds: i64,
    pub reputation: i64,
    pub level: i64,
    pub territories: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl CorporationAggregate {
    pub fn empty(corp_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            corp_id: corp_id.into(),
            name: String::new(),
            leader_id: String::new(),
            origin_shard: String::new(),
            member_count: 0,
            funds: 0,
            reputation: 0,
            level: 1,
            territories: Vec::new(),
            updated_at: now,
        }
    }
}

/// Partial corporation update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorporationPatch {
    #[serde(alias = "corpName", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "leaderId", skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    #[serde(alias = "originShard", skip_serializing_if = "Option::is_none")]
    pub origin_shard: Option<String>,
    #[serde(alias = "memberCount", skip_serializing_if = "Option::is_none")]
    pub member_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub territories: Option<Vec<String>>,
}

impl CorporationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, corp: &mut CorporationAggregate, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            corp.name = name.clone();
        }
        if let Some(leader_id) = &self.leader_id {
            corp.leader_id = leader_id.clone();
        }
        if let Some(origin_shard) = &self.origin_shard {
            corp.origin_shard = origin_shard.clone();
        }
        if let Some(member_count) = self.member_count {
            corp.member_count = member_count;
        }
        if let Some(funds) = self.funds {
            corp.funds = funds;
        }
        if let Some(reputation) = self.reputation {
            corp.reputation = reputation;
        }
        if let Some(level) = self.level {
            corp.level = level;
        }
        if let Some(territories) = &self.territories {
            corp.territories = territories.clone();
        }
        corp.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardType {
    Money,
    Reputation,
    Level,
    CorpPower,
}

impl LeaderboardType {
    pub const ALL: [LeaderboardType; 4] = [
        LeaderboardType::Money,
        LeaderboardType::Reputation,
        LeaderboardType::Level,
        LeaderboardType::CorpPower,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Money => "money",
            Self::Reputation => "reputation",
            Self::Level => "level",
            Self::CorpPower => "corp_power",
        }
    }

    /// Maps a player stat name to the board it feeds.
    pub fn from_player_stat(stat: &str) -> Option<Self> {
        match stat {
            "money" => Some(Self::Money),
            "reputation" => Some(Self::Reputation),
            "level" => Some(Self::Level),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeaderboardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeaderboardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown leaderboard type: {s}"))
    }
}

/// One row per (leaderboard type, player).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub leaderboard_type: LeaderboardType,
    pub player_id: String,
    pub player_name: String,
    pub shard_id: String,
    pub value: f64,
    /// Last persisted batch rank; 0 before the first recalculation.
    pub rank: u32,
    pub updated_at: DateTime<Utc>,
}

/// Canonical order: value descending, ties by player id ascending.
pub fn canonical_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| a.player_id.cmp(&b.player_id))
}

/// Sorts canonically and assigns ranks 1..N.
pub fn rank_entries(mut entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
    entries.sort_by(canonical_order);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.rank = position as u32 + 1;
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEvent {
    #[serde(default)]
    pub id: String,
    pub event_type: String,
    pub title: String,
    pub description: String,
    /// Shard ids; `"all"` matches every shard.
    pub affected_shards: Vec<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub active: bool,
}

pub const ALL_SHARDS: &str = "all";

impl GlobalEvent {
    pub fn affects(&self, shard_id: &str) -> bool {
        self.affected_shards
            .iter()
            .any(|shard| shard == ALL_SHARDS || shard == shard_id)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>, shard_id: Option<&str>) -> bool {
        self.active
            && self.end_at.map_or(true, |end| end > now)
            && shard_id.map_or(true, |shard| self.affects(shard))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGlobalEvent {
    pub event_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_affected_shards")]
    pub affected_shards: Vec<String>,
    /// Defaults to now.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// Open-ended when absent.
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

fn default_affected_shards() -> Vec<String> {
    vec![ALL_SHARDS.to_string()]
}

impl NewGlobalEvent {
    pub fn into_event(self, id: String, now: DateTime<Utc>) -> Result<GlobalEvent, ReplicationError> {
        let start_at = self.start_at.unwrap_or(now);
        let end_at = match self.duration_seconds {
            None => None,
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|duration| start_at.checked_add_signed(duration))
                    .ok_or_else(|| {
                        ReplicationError::Validation(format!("durationSeconds {secs} is out of range"))
                    })?,
            ),
        };
        Ok(GlobalEvent {
            id,
            event_type: self.event_type,
            title: self.title,
            description: self.description,
            affected_shards: self.affected_shards,
            start_at,
            end_at,
            active: true,
        })
    }
}

/// Presence row. History accumulates; at most one row per player is online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSession {
    #[serde(default)]
    pub id: String,
    pub player_id: String,
    pub shard_id: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub last_ping: DateTime<Utc>,
}

impl PlayerSession {
    pub fn open(
        player_id: &str,
        shard_id: &str,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.to_string(),
            shard_id: shard_id.to_string(),
            connection_id: connection_id.to_string(),
            connected_at: now,
            disconnected_at: None,
            is_online: true,
            last_ping: now,
        }
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.is_online = false;
        self.disconnected_at = Some(at);
    }
}

/// Append-only audit copy of an emitted envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEventLogRecord {
    #[serde(default)]
    pub id: String,
    pub event_id: String,
    pub event_type: SyncEventType,
    pub sender_id: String,
    pub shard_id: String,
    pub target_shard_id: Option<String>,
    pub payload: Value,
    pub logged_at: DateTime<Utc>,
}

impl SyncEventLogRecord {
    pub fn from_event(event: &SyncEvent, logged_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            sender_id: event.sender_id.clone(),
            shard_id: event.shard_id.clone(),
            target_shard_id: event.target_shard_id.clone(),
            payload: event.payload.clone(),
            logged_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(player: &str, value: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            leaderboard_type: LeaderboardType::Money,
            player_id: player.to_string(),
            player_name: player.to_string(),
            shard_id: "eu-1".to_string(),
            value,
            rank: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ranking_breaks_ties_by_player_id() {
        let ranked = rank_entries(vec![
            entry("carol", 10.0),
            entry("bob", 50.0),
            entry("alice", 10.0),
        ]);
        let order: Vec<(&str, u32)> = ranked
            .iter()
            .map(|e| (e.player_id.as_str(), e.rank))
            .collect();
        assert_eq!(order, vec![("bob", 1), ("alice", 2), ("carol", 3)]);
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let now = Utc::now();
        let mut corp = CorporationAggregate::empty("c1", now);
        CorporationPatch {
            name: Some("Arasaka".into()),
            funds: Some(500),
            ..Default::default()
        }
        .apply(&mut corp, now);
        CorporationPatch {
            reputation: Some(7),
            ..Default::default()
        }
        .apply(&mut corp, now);

        assert_eq!(corp.name, "Arasaka");
        assert_eq!(corp.funds, 500);
        assert_eq!(corp.reputation, 7);
    }

    #[test]
    fn patch_accepts_client_field_names() {
        let patch: CorporationPatch =
            serde_json::from_value(json!({"memberCount": 4, "funds": 10})).expect("patch");
        assert_eq!(patch.member_count, Some(4));
        assert_eq!(patch.funds, Some(10));
        assert!(patch.name.is_none());
        assert!(CorporationPatch::default().is_empty());
    }

    #[test]
    fn wildcard_shard_matches_everything() {
        let now = Utc::now();
        let event = NewGlobalEvent {
            event_type: "double_xp".into(),
            title: "Double XP".into(),
            description: String::new(),
            affected_shards: vec![ALL_SHARDS.into()],
            start_at: None,
            duration_seconds: Some(60),
        }
        .into_event("e1".into(), now)
        .expect("in range");

        assert!(event.is_active_at(now, Some("anything")));
        assert!(event.is_active_at(now, None));
        assert!(!event.is_active_at(now + Duration::seconds(60), None));
    }

    #[test]
    fn unrepresentable_event_end_is_rejected() {
        let new_event = |duration_seconds| NewGlobalEvent {
            event_type: "eclipse".into(),
            title: "Endless night".into(),
            description: String::new(),
            affected_shards: vec![ALL_SHARDS.into()],
            start_at: None,
            duration_seconds: Some(duration_seconds),
        };
        let now = Utc::now();

        assert!(matches!(
            new_event(i64::MAX).into_event("e1".into(), now),
            Err(ReplicationError::Validation(_))
        ));
        assert!(matches!(
            new_event(i64::MAX / 1_000).into_event("e2".into(), now),
            Err(ReplicationError::Validation(_))
        ));
        assert!(new_event(86_400).into_event("e3".into(), now).is_ok());
    }

    #[test]
    fn leaderboard_type_names() {
        assert_eq!("corp_power".parse::<LeaderboardType>(), Ok(LeaderboardType::CorpPower));
        assert!("xp".parse::<LeaderboardType>().is_err());
        assert_eq!(LeaderboardType::from_player_stat("money"), Some(LeaderboardType::Money));
        assert_eq!(LeaderboardType::from_player_stat("health"), None);
    }
}
