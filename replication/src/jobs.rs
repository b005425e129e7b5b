//! Background maintenance for the replication store.
//! Closes stale presence rows and re-ranks every leaderboard on fixed intervals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_net::shutdown::{self, ShutdownReceiver};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::model::LeaderboardType;
use crate::{env_or, BoxError, ReplicationService};

pub const DEFAULT_STALE_SESSION_MINUTES: u64 = 5;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RANK_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub stale_session_minutes: u64,
    pub cleanup_interval_secs: u64,
    pub rank_interval_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            stale_session_minutes: DEFAULT_STALE_SESSION_MINUTES,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            rank_interval_secs: DEFAULT_RANK_INTERVAL_SECS,
        }
    }
}

impl JobSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            stale_session_minutes: env_or("STALE_SESSION_MINUTES", DEFAULT_STALE_SESSION_MINUTES)?,
            cleanup_interval_secs: env_or("SESSION_CLEANUP_INTERVAL_SECS", DEFAULT_CLEANUP_INTERVAL_SECS)?,
            rank_interval_secs: env_or("RANK_INTERVAL_SECS", DEFAULT_RANK_INTERVAL_SECS)?,
        })
    }
}

/// Maintenance job kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    CleanupStaleSessions { stale_minutes: u64 },
    RecalculateRanks { leaderboard: LeaderboardType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Outcome of one job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

/// Runs a single job to completion. Failures are reported in the result,
/// never propagated.
pub async fn execute_job(service: &ReplicationService, job_type: JobType) -> JobResult {
    let job_id = uuid::Uuid::new_v4().to_string();
    let started_at = service.clock().now();

    let outcome = match &job_type {
        JobType::CleanupStaleSessions { stale_minutes } => service
            .cleanup_stale_sessions(*stale_minutes)
            .await
            .map(|closed| serde_json::json!({ "sessions_closed": closed })),
        JobType::RecalculateRanks { leaderboard } => service
            .recalculate_ranks(*leaderboard)
            .await
            .map(|ranked| serde_json::json!({ "entries_ranked": ranked })),
    };

    let completed_at = service.clock().now();
    let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

    let (status, error_message, metadata) = match outcome {
        Ok(metadata) => (JobStatus::Completed, None, metadata),
        Err(err) => {
            error!(%err, job_id = %job_id, job = ?job_type, "replication job failed");
            (JobStatus::Failed, Some(err.to_string()), serde_json::json!({}))
        }
    };

    JobResult {
        job_id,
        job_type,
        status,
        started_at,
        completed_at,
        duration_ms,
        error_message,
        metadata,
    }
}

/// Drives the maintenance schedule until shutdown.
pub async fn run(
    service: Arc<ReplicationService>,
    settings: JobSettings,
    shutdown_rx: ShutdownReceiver,
) -> Result<(), BoxError> {
    info!(
        cleanup_every_secs = settings.cleanup_interval_secs,
        rank_every_secs = settings.rank_interval_secs,
        stale_minutes = settings.stale_session_minutes,
        "starting replication job scheduler"
    );

    let mut cleanup = interval(Duration::from_secs(settings.cleanup_interval_secs.max(1)));
    let mut ranking = interval(Duration::from_secs(settings.rank_interval_secs.max(1)));
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ranking.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stopped = shutdown::wait(shutdown_rx);
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = cleanup.tick() => {
                let job = JobType::CleanupStaleSessions { stale_minutes: settings.stale_session_minutes };
                execute_job(&service, job).await;
            }
            _ = ranking.tick() => {
                for leaderboard in LeaderboardType::ALL {
                    execute_job(&service, JobType::RecalculateRanks { leaderboard }).await;
                }
            }
        }
    }

    info!("replication job scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_job_reports_closed_sessions() {
        let service = ReplicationService::in_memory();
        service
            .record_player_session("alice", "eu-1", "conn-1")
            .await
            .expect("session");

        let result = execute_job(&service, JobType::CleanupStaleSessions { stale_minutes: 0 }).await;
        assert_eq!(result.status, JobStatus::Completed);
        assert!(result.error_message.is_none());

        let result = execute_job(
            &service,
            JobType::RecalculateRanks { leaderboard: LeaderboardType::Money },
        )
        .await;
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.metadata["entries_ranked"], 0);
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let service = Arc::new(ReplicationService::in_memory());
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(run(service, JobSettings::default(), rx));

        shutdown::trigger(&tx);
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("scheduler stopped")
            .expect("join");
        assert!(result.is_ok());
    }

    #[test]
    fn settings_defaults() {
        let settings = JobSettings::default();
        assert_eq!(settings.stale_session_minutes, 5);
        assert_eq!(settings.cleanup_interval_secs, 60);
    }
}
