//! Durable backing for the replicated entities.

mod memory;
mod pocketbase_store;

pub use self::memory::MemoryStore;
pub use self::pocketbase_store::PocketBaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    CorporationAggregate, CorporationPatch, GlobalEvent, LeaderboardEntry, LeaderboardType,
    PlayerSession, SyncEventLogRecord,
};

#[async_trait]
pub trait ReplicationStore: Send + Sync {
    /// Creates the corporation when missing, then applies only the fields set
    /// in `patch`.
    async fn merge_corporation(
        &self,
        corp_id: &str,
        patch: &CorporationPatch,
        now: DateTime<Utc>,
    ) -> Result<CorporationAggregate, StoreError>;

    async fn get_corporation(&self, corp_id: &str) -> Result<Option<CorporationAggregate>, StoreError>;

    /// Highest reputation first.
    async fn list_corporations(&self, limit: usize) -> Result<Vec<CorporationAggregate>, StoreError>;

    /// Upsert keyed by (type, player id). The stored rank is preserved.
    async fn upsert_leaderboard_entry(&self, entry: &LeaderboardEntry) -> Result<(), StoreError>;

    /// Every row of one board, in no particular order.
    async fn leaderboard_entries(&self, kind: LeaderboardType) -> Result<Vec<LeaderboardEntry>, StoreError>;

    async fn store_ranks(&self, kind: LeaderboardType, ranked: &[LeaderboardEntry]) -> Result<(), StoreError>;

    /// Returns the event as stored; backends may assign their own id.
    async fn insert_global_event(&self, event: &GlobalEvent) -> Result<GlobalEvent, StoreError>;

    /// Events whose active flag is still set; time and shard filtering is the
    /// caller's job.
    async fn flagged_global_events(&self) -> Result<Vec<GlobalEvent>, StoreError>;

    /// Clears the active flag. `false` when no such event exists.
    async fn deactivate_global_event(&self, id: &str) -> Result<bool, StoreError>;

    async fn append_sync_event(&self, record: &SyncEventLogRecord) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_sync_events(&self, limit: usize) -> Result<Vec<SyncEventLogRecord>, StoreError>;

    /// Closes every online row of `session.player_id`, then inserts `session`.
    /// Returns the number of rows closed.
    async fn open_session(&self, session: &PlayerSession) -> Result<u64, StoreError>;

    async fn close_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn touch_session(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Online rows, optionally restricted to one shard.
    async fn online_sessions(&self, shard_id: Option<&str>) -> Result<Vec<PlayerSession>, StoreError>;

    /// Closes online rows whose last ping is older than `cutoff`.
    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
