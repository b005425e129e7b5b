//! State Replication Service: durable, cross-shard entities (corporations,
//! leaderboards, world events, presence, the sync-event audit log) shared by
//! every gateway node.
//!
//! Concurrent writers are never coordinated. Corporations are merge-upserted,
//! the sync log is append-only, and leaderboards are recomputed from raw rows
//! on read, so last-writer-wins on a single row is the only conflict rule.

pub mod cache;
pub mod error;
pub mod jobs;
pub mod model;
pub mod store;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use common_net::clock::{self, Clock};
use common_net::message::SyncEvent;
use common_net::metrics::replication_metrics;
use pocketbase::PocketBaseClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::LeaderboardCache;
pub use crate::error::{ReplicationError, StoreError};
use crate::jobs::JobSettings;
use crate::model::{
    rank_entries, CorporationAggregate, CorporationPatch, GlobalEvent, LeaderboardEntry,
    LeaderboardType, NewGlobalEvent, PlayerSession, SyncEventLogRecord,
};
use crate::store::{MemoryStore, PocketBaseStore, ReplicationStore};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const DEFAULT_LEADERBOARD_REFRESH_SECS: u64 = 60;

pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|err| Box::new(err) as BoxError),
        _ => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// PocketBase base URL; `None` keeps everything in process memory.
    #[serde(default)]
    pub pocketbase_url: Option<String>,
    #[serde(default)]
    pub pocketbase_admin_email: Option<String>,
    #[serde(default)]
    pub pocketbase_admin_password: Option<String>,
    #[serde(default = "default_refresh_secs")]
    pub leaderboard_refresh_secs: u64,
    #[serde(default)]
    pub jobs: JobSettings,
}

fn default_refresh_secs() -> u64 {
    DEFAULT_LEADERBOARD_REFRESH_SECS
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            pocketbase_url: None,
            pocketbase_admin_email: None,
            pocketbase_admin_password: None,
            leaderboard_refresh_secs: DEFAULT_LEADERBOARD_REFRESH_SECS,
            jobs: JobSettings::default(),
        }
    }
}

impl ReplicationSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            pocketbase_url: env_opt("POCKETBASE_URL"),
            pocketbase_admin_email: env_opt("POCKETBASE_ADMIN_EMAIL"),
            pocketbase_admin_password: env_opt("POCKETBASE_ADMIN_PASSWORD"),
            leaderboard_refresh_secs: env_or("LEADERBOARD_REFRESH_SECS", DEFAULT_LEADERBOARD_REFRESH_SECS)?,
            jobs: JobSettings::from_env()?,
        })
    }
}

/// Cache lifetime for computed leaderboards; oversized values saturate.
fn refresh_ttl(refresh_secs: u64) -> Duration {
    i64::try_from(refresh_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

pub struct ReplicationService {
    store: Arc<dyn ReplicationStore>,
    clock: Arc<dyn Clock>,
    leaderboards: LeaderboardCache,
}

impl std::fmt::Debug for ReplicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationService")
            .field("leaderboard_ttl", &self.leaderboards.ttl())
            .finish()
    }
}

impl ReplicationService {
    pub fn new(store: Arc<dyn ReplicationStore>, clock: Arc<dyn Clock>, refresh_secs: u64) -> Self {
        Self {
            store,
            clock,
            leaderboards: LeaderboardCache::new(refresh_ttl(refresh_secs)),
        }
    }

    /// Memory-backed service on the system clock.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            clock::system(),
            DEFAULT_LEADERBOARD_REFRESH_SECS,
        )
    }

    /// Picks the store from `settings`. An unreachable PocketBase is logged,
    /// not fatal; writes will fail and be logged until it comes back.
    pub async fn connect(settings: &ReplicationSettings, clock: Arc<dyn Clock>) -> Result<Self, ReplicationError> {
        let store: Arc<dyn ReplicationStore> = match settings.pocketbase_url.as_deref() {
            Some(url) => {
                let mut client = PocketBaseClient::new(url);
                if let (Some(email), Some(password)) = (
                    settings.pocketbase_admin_email.as_deref(),
                    settings.pocketbase_admin_password.as_deref(),
                ) {
                    client.auth_admin(email, password).await?;
                }
                if let Err(err) = client.health().await {
                    warn!(%err, url, "replication: pocketbase health check failed");
                }
                info!(url, "replication: using pocketbase store");
                Arc::new(PocketBaseStore::new(client))
            }
            None => {
                info!("replication: no POCKETBASE_URL, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(store, clock, settings.leaderboard_refresh_secs))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---- corporations ----

    /// Merge-upsert: only fields set in `patch` change. Repeating the same
    /// call leaves the aggregate as it was after the first.
    pub async fn upsert_corporation(
        &self,
        corp_id: &str,
        patch: &CorporationPatch,
    ) -> Result<CorporationAggregate, ReplicationError> {
        let corp_id = corp_id.trim();
        if corp_id.is_empty() {
            return Err(ReplicationError::Validation("corpId must not be empty".into()));
        }
        let corp = self
            .store
            .merge_corporation(corp_id, patch, self.clock.now())
            .await?;
        debug!(corp_id, "replication: corporation upserted");
        Ok(corp)
    }

    pub async fn get_corporation(&self, corp_id: &str) -> Result<Option<CorporationAggregate>, ReplicationError> {
        Ok(self.store.get_corporation(corp_id).await?)
    }

    pub async fn list_corporations(&self, limit: usize) -> Result<Vec<CorporationAggregate>, ReplicationError> {
        Ok(self.store.list_corporations(limit).await?)
    }

    // ---- leaderboards ----

    pub async fn update_leaderboard_entry(
        &self,
        kind: LeaderboardType,
        player_id: &str,
        value: f64,
        shard_id: &str,
        player_name: &str,
    ) -> Result<(), ReplicationError> {
        if player_id.trim().is_empty() {
            return Err(ReplicationError::Validation("playerId must not be empty".into()));
        }
        if !value.is_finite() {
            return Err(ReplicationError::Validation(format!("{kind} value must be finite")));
        }
        let entry = LeaderboardEntry {
            leaderboard_type: kind,
            player_id: player_id.to_string(),
            player_name: player_name.to_string(),
            shard_id: shard_id.to_string(),
            value,
            rank: 0,
            updated_at: self.clock.now(),
        };
        self.store.upsert_leaderboard_entry(&entry).await?;
        Ok(())
    }

    /// Top `limit` entries in canonical order with ranks 1..N. Served from
    /// cache while `now < computed_at + refresh interval`.
    pub async fn get_leaderboard(
        &self,
        kind: LeaderboardType,
        limit: usize,
    ) -> Result<Arc<Vec<LeaderboardEntry>>, ReplicationError> {
        let metrics = replication_metrics();
        let now = self.clock.now();
        if let Some(cached) = self.leaderboards.get(kind, limit, now).await {
            metrics.leaderboard_cache_hits_total.inc();
            return Ok(cached);
        }
        metrics.leaderboard_cache_misses_total.inc();

        let started = Instant::now();
        let mut ranked = rank_entries(self.store.leaderboard_entries(kind).await?);
        ranked.truncate(limit);
        let ranked = Arc::new(ranked);
        metrics
            .leaderboard_recompute_seconds
            .observe(started.elapsed().as_secs_f64());

        self.leaderboards.put(kind, limit, ranked.clone(), now).await;
        Ok(ranked)
    }

    /// Persists canonical ranks for the whole board, then drops every cached
    /// snapshot. Returns the number of ranked entries.
    pub async fn recalculate_ranks(&self, kind: LeaderboardType) -> Result<usize, ReplicationError> {
        let ranked = rank_entries(self.store.leaderboard_entries(kind).await?);
        self.store.store_ranks(kind, &ranked).await?;
        self.leaderboards.invalidate_all().await;
        info!(leaderboard = %kind, entries = ranked.len(), "replication: ranks recalculated");
        Ok(ranked.len())
    }

    // ---- global events ----

    pub async fn create_global_event(&self, new_event: NewGlobalEvent) -> Result<GlobalEvent, ReplicationError> {
        if new_event.title.trim().is_empty() || new_event.event_type.trim().is_empty() {
            return Err(ReplicationError::Validation("global event needs a type and a title".into()));
        }
        if new_event.affected_shards.is_empty() {
            return Err(ReplicationError::Validation("global event must affect at least one shard".into()));
        }
        if matches!(new_event.duration_seconds, Some(secs) if secs <= 0) {
            return Err(ReplicationError::Validation("durationSeconds must be positive".into()));
        }
        let event = new_event.into_event(uuid::Uuid::new_v4().to_string(), self.clock.now())?;
        let stored = self.store.insert_global_event(&event).await?;
        info!(event_id = %stored.id, event_type = %stored.event_type, shards = ?stored.affected_shards, "replication: global event created");
        Ok(stored)
    }

    /// Active events, optionally only those reaching `shard_id`.
    pub async fn get_active_global_events(&self, shard_id: Option<&str>) -> Result<Vec<GlobalEvent>, ReplicationError> {
        let now = self.clock.now();
        Ok(self
            .store
            .flagged_global_events()
            .await?
            .into_iter()
            .filter(|event| event.is_active_at(now, shard_id))
            .collect())
    }

    pub async fn end_global_event(&self, id: &str) -> Result<bool, ReplicationError> {
        let ended = self.store.deactivate_global_event(id).await?;
        if ended {
            info!(event_id = id, "replication: global event ended");
        }
        Ok(ended)
    }

    // ---- sync log ----

    pub async fn log_sync_event(&self, event: &SyncEvent) -> Result<(), ReplicationError> {
        let record = SyncEventLogRecord::from_event(event, self.clock.now());
        self.store.append_sync_event(&record).await?;
        Ok(())
    }

    /// Writes `event` to the audit log on a detached task; failures are
    /// counted and logged.
    pub fn spawn_sync_log(self: &Arc<Self>, event: SyncEvent) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.log_sync_event(&event).await {
                replication_metrics().sync_log_failures_total.inc();
                warn!(%err, event_id = %event.event_id, event_type = event.event_type.as_str(), "replication: sync log write failed");
            }
        });
    }

    /// Newest first.
    pub async fn get_recent_sync_events(&self, limit: usize) -> Result<Vec<SyncEventLogRecord>, ReplicationError> {
        Ok(self.store.recent_sync_events(limit).await?)
    }

    // ---- presence ----

    /// Offlines any online rows for the player, then opens a fresh one.
    /// Returns how many rows were closed.
    pub async fn record_player_session(
        &self,
        player_id: &str,
        shard_id: &str,
        connection_id: &str,
    ) -> Result<u64, ReplicationError> {
        let session = PlayerSession::open(player_id, shard_id, connection_id, self.clock.now());
        let closed = self.store.open_session(&session).await?;
        if closed > 0 {
            debug!(player_id, closed, "replication: prior online sessions closed");
        }
        Ok(closed)
    }

    pub async fn end_player_session(&self, connection_id: &str) -> Result<bool, ReplicationError> {
        Ok(self.store.close_session(connection_id, self.clock.now()).await?)
    }

    pub async fn touch_player_session(&self, connection_id: &str) -> Result<bool, ReplicationError> {
        Ok(self.store.touch_session(connection_id, self.clock.now()).await?)
    }

    pub async fn get_online_players_by_shard(&self, shard_id: &str) -> Result<Vec<PlayerSession>, ReplicationError> {
        Ok(self.store.online_sessions(Some(shard_id)).await?)
    }

    /// Distinct players with an online row on any shard.
    pub async fn get_total_online_count(&self) -> Result<usize, ReplicationError> {
        let sessions = self.store.online_sessions(None).await?;
        let players: std::collections::HashSet<&str> =
            sessions.iter().map(|session| session.player_id.as_str()).collect();
        Ok(players.len())
    }

    /// Closes online rows whose last ping is older than `stale_minutes`.
    pub async fn cleanup_stale_sessions(&self, stale_minutes: u64) -> Result<u64, ReplicationError> {
        let now = self.clock.now();
        let cutoff = i64::try_from(stale_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                ReplicationError::Validation(format!("stale window of {stale_minutes} minutes is out of range"))
            })?;
        let closed = self.store.close_stale_sessions(cutoff, now).await?;
        replication_metrics().stale_sessions_closed_total.inc_by(closed);
        if closed > 0 {
            info!(closed, stale_minutes, "replication: stale sessions closed");
        }
        Ok(closed)
    }
}
