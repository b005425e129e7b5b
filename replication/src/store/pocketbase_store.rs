//! PocketBase-backed store.
//!
//! Column names are snake_case copies of the model fields. Dates are written
//! in PocketBase's own `YYYY-MM-DD HH:MM:SS.mmmZ` form so string comparisons
//! inside filters order correctly.
//!
//! Upserts require unique indexes on `corporations.corp_id` and on
//! `leaderboard_entries (leaderboard_type, player_id)`. When two nodes race
//! on a first write, the loser's create is rejected by the index and turns
//! into a PATCH of the winner's row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pocketbase::{quote, ListQuery, PocketBaseClient, Record};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::ReplicationStore;
use crate::error::StoreError;
use crate::model::{
    CorporationAggregate, CorporationPatch, GlobalEvent, LeaderboardEntry, LeaderboardType,
    PlayerSession, SyncEventLogRecord,
};

const CORPORATIONS: &str = "corporations";
const LEADERBOARD_ENTRIES: &str = "leaderboard_entries";
const GLOBAL_EVENTS: &str = "global_events";
const PLAYER_SESSIONS: &str = "player_sessions";
const SYNC_EVENTS: &str = "sync_events";

fn pb_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

fn parse_date(collection: &'static str, raw: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(&raw.replacen(' ', "T", 1))
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|err| StoreError::Decode {
            collection,
            reason: format!("bad date {raw:?}: {err}"),
        })
}

fn required_date(collection: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_date(collection, raw)?.ok_or_else(|| StoreError::Decode {
        collection,
        reason: "missing date".to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(collection: &'static str, record: &Record) -> Result<T, StoreError> {
    record.decode().map_err(|err| StoreError::Decode {
        collection,
        reason: err.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct CorporationRow {
    corp_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    leader_id: String,
    #[serde(default)]
    origin_shard: String,
    #[serde(default)]
    member_count: i64,
    #[serde(default)]
    funds: i64,
    #[serde(default)]
    reputation: i64,
    #[serde(default)]
    level: i64,
    #[serde(default)]
    territories: Option<Vec<String>>,
    #[serde(default)]
    updated_at: String,
}

impl CorporationRow {
    fn into_model(self, record: &Record) -> Result<CorporationAggregate, StoreError> {
        let updated_at = match parse_date(CORPORATIONS, &self.updated_at)? {
            Some(at) => at,
            None => required_date(CORPORATIONS, &record.updated)?,
        };
        Ok(CorporationAggregate {
            corp_id: self.corp_id,
            name: self.name,
            leader_id: self.leader_id,
            origin_shard: self.origin_shard,
            member_count: self.member_count,
            funds: self.funds,
            reputation: self.reputation,
            level: self.level,
            territories: self.territories.unwrap_or_default(),
            updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LeaderboardRow {
    leaderboard_type: LeaderboardType,
    player_id: String,
    #[serde(default)]
    player_name: String,
    #[serde(default)]
    shard_id: String,
    #[serde(default)]
    value: f64,
    #[serde(default)]
    rank: u32,
    #[serde(default)]
    updated_at: String,
}

impl LeaderboardRow {
    fn into_model(self) -> Result<LeaderboardEntry, StoreError> {
        Ok(LeaderboardEntry {
            leaderboard_type: self.leaderboard_type,
            player_id: self.player_id,
            player_name: self.player_name,
            shard_id: self.shard_id,
            value: self.value,
            rank: self.rank,
            updated_at: required_date(LEADERBOARD_ENTRIES, &self.updated_at)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GlobalEventRow {
    event_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    affected_shards: Option<Vec<String>>,
    #[serde(default)]
    start_at: String,
    #[serde(default)]
    end_at: String,
    #[serde(default)]
    active: bool,
}

impl GlobalEventRow {
    fn into_model(self, id: &str) -> Result<GlobalEvent, StoreError> {
        Ok(GlobalEvent {
            id: id.to_string(),
            event_type: self.event_type,
            title: self.title,
            description: self.description,
            affected_shards: self.affected_shards.unwrap_or_default(),
            start_at: required_date(GLOBAL_EVENTS, &self.start_at)?,
            end_at: parse_date(GLOBAL_EVENTS, &self.end_at)?,
            active: self.active,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    player_id: String,
    #[serde(default)]
    shard_id: String,
    #[serde(default)]
    connection_id: String,
    #[serde(default)]
    connected_at: String,
    #[serde(default)]
    disconnected_at: String,
    #[serde(default)]
    is_online: bool,
    #[serde(default)]
    last_ping: String,
}

impl SessionRow {
    fn into_model(self, id: &str) -> Result<PlayerSession, StoreError> {
        let connected_at = required_date(PLAYER_SESSIONS, &self.connected_at)?;
        Ok(PlayerSession {
            id: id.to_string(),
            player_id: self.player_id,
            shard_id: self.shard_id,
            connection_id: self.connection_id,
            connected_at,
            disconnected_at: parse_date(PLAYER_SESSIONS, &self.disconnected_at)?,
            is_online: self.is_online,
            last_ping: parse_date(PLAYER_SESSIONS, &self.last_ping)?.unwrap_or(connected_at),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SyncEventRow {
    event_id: String,
    event_type: common_net::message::SyncEventType,
    #[serde(default)]
    sender_id: String,
    #[serde(default)]
    shard_id: String,
    #[serde(default)]
    target_shard_id: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    logged_at: String,
}

impl SyncEventRow {
    fn into_model(self, id: &str) -> Result<SyncEventLogRecord, StoreError> {
        Ok(SyncEventLogRecord {
            id: id.to_string(),
            event_id: self.event_id,
            event_type: self.event_type,
            sender_id: self.sender_id,
            shard_id: self.shard_id,
            target_shard_id: Some(self.target_shard_id).filter(|shard| !shard.is_empty()),
            payload: self.payload,
            logged_at: required_date(SYNC_EVENTS, &self.logged_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PocketBaseStore {
    client: PocketBaseClient,
}

impl PocketBaseStore {
    pub fn new(client: PocketBaseClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PocketBaseClient {
        &self.client
    }

    fn corporation(record: &Record) -> Result<CorporationAggregate, StoreError> {
        decode::<CorporationRow>(CORPORATIONS, record)?.into_model(record)
    }

    fn session(record: &Record) -> Result<PlayerSession, StoreError> {
        decode::<SessionRow>(PLAYER_SESSIONS, record)?.into_model(&record.id)
    }

    async fn online_session_records(&self, filter: String) -> Result<Vec<Record>, StoreError> {
        let filter = format!("is_online = true && ({filter})");
        Ok(self
            .client
            .list_records(PLAYER_SESSIONS, &ListQuery::filter(filter))
            .await?)
    }

    /// Creates `row`. If a unique index says another writer created the same
    /// key first, applies `changes` to that row instead.
    async fn create_or_patch(
        &self,
        collection: &'static str,
        filter: &str,
        row: Value,
        changes: Value,
    ) -> Result<Record, StoreError> {
        match self.client.create_record(collection, row).await {
            Ok(record) => Ok(record),
            Err(err) if err.is_unique_violation() => {
                debug!(collection, filter, "pocketbase: concurrent create, patching existing row");
                let existing = self
                    .client
                    .first_record(collection, filter)
                    .await?
                    .ok_or(StoreError::PocketBase(err))?;
                Ok(self
                    .client
                    .update_record(collection, &existing.id, changes)
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn close_session_records(&self, records: &[Record], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let body = json!({
            "is_online": false,
            "disconnected_at": pb_date(at),
        });
        for record in records {
            self.client
                .update_record(PLAYER_SESSIONS, &record.id, body.clone())
                .await?;
        }
        Ok(records.len() as u64)
    }
}

#[async_trait]
impl ReplicationStore for PocketBaseStore {
    async fn merge_corporation(
        &self,
        corp_id: &str,
        patch: &CorporationPatch,
        now: DateTime<Utc>,
    ) -> Result<CorporationAggregate, StoreError> {
        let filter = format!("corp_id = {}", quote(corp_id));
        // PATCH carries only the fields the caller set
        let mut changes = match serde_json::to_value(patch) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        changes.insert("updated_at".into(), Value::String(pb_date(now)));
        let changes = Value::Object(changes);

        let record = match self.client.first_record(CORPORATIONS, &filter).await? {
            Some(record) => {
                self.client
                    .update_record(CORPORATIONS, &record.id, changes)
                    .await?
            }
            None => {
                let mut corp = CorporationAggregate::empty(corp_id, now);
                patch.apply(&mut corp, now);
                let full = json!({
                    "corp_id": corp.corp_id,
                    "name": corp.name,
                    "leader_id": corp.leader_id,
                    "origin_shard": corp.origin_shard,
                    "member_count": corp.member_count,
                    "funds": corp.funds,
                    "reputation": corp.reputation,
                    "level": corp.level,
                    "territories": corp.territories,
                    "updated_at": pb_date(now),
                });
                self.create_or_patch(CORPORATIONS, &filter, full, changes).await?
            }
        };
        Self::corporation(&record)
    }

    async fn get_corporation(&self, corp_id: &str) -> Result<Option<CorporationAggregate>, StoreError> {
        self.client
            .first_record(CORPORATIONS, &format!("corp_id = {}", quote(corp_id)))
            .await?
            .as_ref()
            .map(Self::corporation)
            .transpose()
    }

    async fn list_corporations(&self, limit: usize) -> Result<Vec<CorporationAggregate>, StoreError> {
        let query = ListQuery::default().sort("-reputation,corp_id").limit(limit);
        self.client
            .list_records(CORPORATIONS, &query)
            .await?
            .iter()
            .map(Self::corporation)
            .collect()
    }

    async fn upsert_leaderboard_entry(&self, entry: &LeaderboardEntry) -> Result<(), StoreError> {
        let filter = format!(
            "leaderboard_type = {} && player_id = {}",
            quote(entry.leaderboard_type.as_str()),
            quote(&entry.player_id)
        );
        let body = json!({
            "leaderboard_type": entry.leaderboard_type,
            "player_id": entry.player_id,
            "player_name": entry.player_name,
            "shard_id": entry.shard_id,
            "value": entry.value,
            "updated_at": pb_date(entry.updated_at),
        });
        match self.client.first_record(LEADERBOARD_ENTRIES, &filter).await? {
            Some(record) => {
                self.client
                    .update_record(LEADERBOARD_ENTRIES, &record.id, body)
                    .await?;
            }
            None => {
                self.create_or_patch(LEADERBOARD_ENTRIES, &filter, body.clone(), body)
                    .await?;
            }
        }
        Ok(())
    }

    async fn leaderboard_entries(&self, kind: LeaderboardType) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let filter = format!("leaderboard_type = {}", quote(kind.as_str()));
        self.client
            .list_records(LEADERBOARD_ENTRIES, &ListQuery::filter(filter))
            .await?
            .iter()
            .map(|record| decode::<LeaderboardRow>(LEADERBOARD_ENTRIES, record)?.into_model())
            .collect()
    }

    async fn store_ranks(&self, kind: LeaderboardType, ranked: &[LeaderboardEntry]) -> Result<(), StoreError> {
        let filter = format!("leaderboard_type = {}", quote(kind.as_str()));
        let records = self
            .client
            .list_records(LEADERBOARD_ENTRIES, &ListQuery::filter(filter))
            .await?;

        let mut ids = HashMap::new();
        for record in &records {
            let row: LeaderboardRow = decode(LEADERBOARD_ENTRIES, record)?;
            ids.insert(row.player_id, (record.id.clone(), row.rank));
        }

        let mut written = 0usize;
        for entry in ranked {
            match ids.get(&entry.player_id) {
                Some((id, rank)) if *rank != entry.rank => {
                    self.client
                        .update_record(LEADERBOARD_ENTRIES, id, json!({ "rank": entry.rank }))
                        .await?;
                    written += 1;
                }
                _ => {}
            }
        }
        debug!(leaderboard = %kind, written, "pocketbase: ranks stored");
        Ok(())
    }

    async fn insert_global_event(&self, event: &GlobalEvent) -> Result<GlobalEvent, StoreError> {
        let record = self
            .client
            .create_record(
                GLOBAL_EVENTS,
                json!({
                    "event_type": event.event_type,
                    "title": event.title,
                    "description": event.description,
                    "affected_shards": event.affected_shards,
                    "start_at": pb_date(event.start_at),
                    "end_at": event.end_at.map(pb_date).unwrap_or_default(),
                    "active": event.active,
                }),
            )
            .await?;
        decode::<GlobalEventRow>(GLOBAL_EVENTS, &record)?.into_model(&record.id)
    }

    async fn flagged_global_events(&self) -> Result<Vec<GlobalEvent>, StoreError> {
        let query = ListQuery::filter("active = true").sort("start_at");
        self.client
            .list_records(GLOBAL_EVENTS, &query)
            .await?
            .iter()
            .map(|record| decode::<GlobalEventRow>(GLOBAL_EVENTS, record)?.into_model(&record.id))
            .collect()
    }

    async fn deactivate_global_event(&self, id: &str) -> Result<bool, StoreError> {
        if self.client.get_record(GLOBAL_EVENTS, id).await?.is_none() {
            return Ok(false);
        }
        self.client
            .update_record(GLOBAL_EVENTS, id, json!({ "active": false }))
            .await?;
        Ok(true)
    }

    async fn append_sync_event(&self, record: &SyncEventLogRecord) -> Result<(), StoreError> {
        self.client
            .create_record(
                SYNC_EVENTS,
                json!({
                    "event_id": record.event_id,
                    "event_type": record.event_type,
                    "sender_id": record.sender_id,
                    "shard_id": record.shard_id,
                    "target_shard_id": record.target_shard_id.clone().unwrap_or_default(),
                    "payload": record.payload,
                    "logged_at": pb_date(record.logged_at),
                }),
            )
            .await?;
        Ok(())
    }

    async fn recent_sync_events(&self, limit: usize) -> Result<Vec<SyncEventLogRecord>, StoreError> {
        let query = ListQuery::default().sort("-logged_at,-created").limit(limit);
        self.client
            .list_records(SYNC_EVENTS, &query)
            .await?
            .iter()
            .map(|record| decode::<SyncEventRow>(SYNC_EVENTS, record)?.into_model(&record.id))
            .collect()
    }

    async fn open_session(&self, session: &PlayerSession) -> Result<u64, StoreError> {
        let previous = self
            .online_session_records(format!("player_id = {}", quote(&session.player_id)))
            .await?;
        let closed = self
            .close_session_records(&previous, session.connected_at)
            .await?;

        self.client
            .create_record(
                PLAYER_SESSIONS,
                json!({
                    "player_id": session.player_id,
                    "shard_id": session.shard_id,
                    "connection_id": session.connection_id,
                    "connected_at": pb_date(session.connected_at),
                    "is_online": true,
                    "last_ping": pb_date(session.last_ping),
                }),
            )
            .await?;
        Ok(closed)
    }

    async fn close_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let records = self
            .online_session_records(format!("connection_id = {}", quote(connection_id)))
            .await?;
        Ok(self.close_session_records(&records, at).await? > 0)
    }

    async fn touch_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let records = self
            .online_session_records(format!("connection_id = {}", quote(connection_id)))
            .await?;
        let Some(record) = records.first() else {
            return Ok(false);
        };
        self.client
            .update_record(PLAYER_SESSIONS, &record.id, json!({ "last_ping": pb_date(at) }))
            .await?;
        Ok(true)
    }

    async fn online_sessions(&self, shard_id: Option<&str>) -> Result<Vec<PlayerSession>, StoreError> {
        let filter = match shard_id {
            Some(shard) => format!("shard_id = {}", quote(shard)),
            None => "id != ''".to_string(),
        };
        self.online_session_records(filter)
            .await?
            .iter()
            .map(Self::session)
            .collect()
    }

    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let stale = self
            .online_session_records(format!("last_ping < {}", quote(&pb_date(cutoff))))
            .await?;
        self.close_session_records(&stale, at).await
    }
}
