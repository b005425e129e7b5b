use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{LeaderboardEntry, LeaderboardType};

type BoardKey = (LeaderboardType, usize);

#[derive(Debug, Clone)]
struct CachedBoard {
    entries: Arc<Vec<LeaderboardEntry>>,
    computed_at: DateTime<Utc>,
}

/// Computed leaderboard snapshots keyed by (type, limit). Entries are
/// replaced wholesale, never patched.
#[derive(Debug)]
pub struct LeaderboardCache {
    boards: RwLock<HashMap<BoardKey, CachedBoard>>,
    ttl: Duration,
}

impl LeaderboardCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached snapshot, if `now` is still before `computed_at + ttl`.
    pub async fn get(
        &self,
        kind: LeaderboardType,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Option<Arc<Vec<LeaderboardEntry>>> {
        let boards = self.boards.read().await;
        boards
            .get(&(kind, limit))
            .filter(|board| {
                board
                    .computed_at
                    .checked_add_signed(self.ttl)
                    .map_or(true, |expires| now < expires)
            })
            .map(|board| board.entries.clone())
    }

    pub async fn put(
        &self,
        kind: LeaderboardType,
        limit: usize,
        entries: Arc<Vec<LeaderboardEntry>>,
        computed_at: DateTime<Utc>,
    ) {
        self.boards
            .write()
            .await
            .insert((kind, limit), CachedBoard { entries, computed_at });
    }

    pub async fn invalidate_all(&self) {
        let mut boards = self.boards.write().await;
        debug!(dropped = boards.len(), "leaderboard cache invalidated");
        boards.clear();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.boards.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expires_exactly_at_ttl() {
        let cache = LeaderboardCache::new(Duration::seconds(60));
        let t0 = Utc::now();
        cache
            .put(LeaderboardType::Money, 10, Arc::new(Vec::new()), t0)
            .await;

        assert!(cache.get(LeaderboardType::Money, 10, t0 + Duration::seconds(59)).await.is_some());
        assert!(cache.get(LeaderboardType::Money, 10, t0 + Duration::seconds(60)).await.is_none());
        assert!(cache.get(LeaderboardType::Money, 5, t0).await.is_none());
        assert!(cache.get(LeaderboardType::Level, 10, t0).await.is_none());

        cache.invalidate_all().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn unbounded_ttl_never_expires() {
        let cache = LeaderboardCache::new(Duration::MAX);
        let t0 = Utc::now();
        cache
            .put(LeaderboardType::Reputation, 10, Arc::new(Vec::new()), t0)
            .await;

        let much_later = t0 + Duration::days(365 * 1_000);
        assert!(cache.get(LeaderboardType::Reputation, 10, much_later).await.is_some());
        assert_eq!(cache.len().await, 1);
    }
}
