use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ReplicationStore;
use crate::error::StoreError;
use crate::model::{
    CorporationAggregate, CorporationPatch, GlobalEvent, LeaderboardEntry, LeaderboardType,
    PlayerSession, SyncEventLogRecord,
};

/// Process-local store. Each table sits behind its own lock so a multi-step
/// write on one table is a single critical section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    corporations: RwLock<HashMap<String, CorporationAggregate>>,
    leaderboards: RwLock<HashMap<(LeaderboardType, String), LeaderboardEntry>>,
    global_events: RwLock<Vec<GlobalEvent>>,
    sync_events: RwLock<Vec<SyncEventLogRecord>>,
    sessions: RwLock<Vec<PlayerSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session row ever written, online or not.
    pub async fn session_history(&self) -> Vec<PlayerSession> {
        self.sessions.read().await.clone()
    }
}

#[async_trait]
impl ReplicationStore for MemoryStore {
    async fn merge_corporation(
        &self,
        corp_id: &str,
        patch: &CorporationPatch,
        now: DateTime<Utc>,
    ) -> Result<CorporationAggregate, StoreError> {
        let mut corporations = self.corporations.write().await;
        let corp = corporations
            .entry(corp_id.to_string())
            .or_insert_with(|| CorporationAggregate::empty(corp_id, now));
        patch.apply(corp, now);
        Ok(corp.clone())
    }

    async fn get_corporation(&self, corp_id: &str) -> Result<Option<CorporationAggregate>, StoreError> {
        Ok(self.corporations.read().await.get(corp_id).cloned())
    }

    async fn list_corporations(&self, limit: usize) -> Result<Vec<CorporationAggregate>, StoreError> {
        let mut corporations: Vec<_> = self.corporations.read().await.values().cloned().collect();
        corporations.sort_by(|a, b| {
            b.reputation
                .cmp(&a.reputation)
                .then_with(|| a.corp_id.cmp(&b.corp_id))
        });
        corporations.truncate(limit);
        Ok(corporations)
    }

    async fn upsert_leaderboard_entry(&self, entry: &LeaderboardEntry) -> Result<(), StoreError> {
        let mut boards = self.leaderboards.write().await;
        let key = (entry.leaderboard_type, entry.player_id.clone());
        let rank = boards.get(&key).map_or(0, |existing| existing.rank);
        boards.insert(key, LeaderboardEntry { rank, ..entry.clone() });
        Ok(())
    }

    async fn leaderboard_entries(&self, kind: LeaderboardType) -> Result<Vec<LeaderboardEntry>, StoreError> {
        Ok(self
            .leaderboards
            .read()
            .await
            .values()
            .filter(|entry| entry.leaderboard_type == kind)
            .cloned()
            .collect())
    }

    async fn store_ranks(&self, kind: LeaderboardType, ranked: &[LeaderboardEntry]) -> Result<(), StoreError> {
        let mut boards = self.leaderboards.write().await;
        for entry in ranked {
            if let Some(stored) = boards.get_mut(&(kind, entry.player_id.clone())) {
                stored.rank = entry.rank;
            }
        }
        Ok(())
    }

    async fn insert_global_event(&self, event: &GlobalEvent) -> Result<GlobalEvent, StoreError> {
        self.global_events.write().await.push(event.clone());
        Ok(event.clone())
    }

    async fn flagged_global_events(&self) -> Result<Vec<GlobalEvent>, StoreError> {
        Ok(self
            .global_events
            .read()
            .await
            .iter()
            .filter(|event| event.active)
            .cloned()
            .collect())
    }

    async fn deactivate_global_event(&self, id: &str) -> Result<bool, StoreError> {
        let mut events = self.global_events.write().await;
        match events.iter_mut().find(|event| event.id == id) {
            Some(event) => {
                event.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_sync_event(&self, record: &SyncEventLogRecord) -> Result<(), StoreError> {
        self.sync_events.write().await.push(record.clone());
        Ok(())
    }

    async fn recent_sync_events(&self, limit: usize) -> Result<Vec<SyncEventLogRecord>, StoreError> {
        let log = self.sync_events.read().await;
        let mut recent: Vec<_> = log.iter().cloned().collect();
        // stable sort keeps append order for equal timestamps, reversed below
        recent.sort_by(|a, b| a.logged_at.cmp(&b.logged_at));
        recent.reverse();
        recent.truncate(limit);
        Ok(recent)
    }

    async fn open_session(&self, session: &PlayerSession) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let mut closed = 0;
        for row in sessions
            .iter_mut()
            .filter(|row| row.is_online && row.player_id == session.player_id)
        {
            row.close(session.connected_at);
            closed += 1;
        }
        sessions.push(session.clone());
        Ok(closed)
    }

    async fn close_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let mut closed = false;
        for row in sessions
            .iter_mut()
            .filter(|row| row.is_online && row.connection_id == connection_id)
        {
            row.close(at);
            closed = true;
        }
        Ok(closed)
    }

    async fn touch_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions
            .iter_mut()
            .find(|row| row.is_online && row.connection_id == connection_id)
        {
            Some(row) => {
                row.last_ping = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn online_sessions(&self, shard_id: Option<&str>) -> Result<Vec<PlayerSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .iter()
            .filter(|row| row.is_online && shard_id.map_or(true, |shard| row.shard_id == shard))
            .cloned()
            .collect())
    }

    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let mut closed = 0;
        for row in sessions
            .iter_mut()
            .filter(|row| row.is_online && row.last_ping < cutoff)
        {
            row.close(at);
            closed += 1;
        }
        Ok(closed)
    }
}
