use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use common_net::clock::{Clock, ManualClock};
use common_net::message::{SyncEvent, SyncEventType};
use replication::model::{CorporationPatch, LeaderboardEntry, LeaderboardType, NewGlobalEvent};
use replication::store::{MemoryStore, ReplicationStore};
use replication::{ReplicationError, ReplicationService};
use serde_json::json;

fn service_with_clock() -> (Arc<ReplicationService>, ManualClock, Arc<MemoryStore>) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::new());
    let service = ReplicationService::new(store.clone(), Arc::new(clock.clone()), 60);
    (Arc::new(service), clock, store)
}

#[tokio::test]
async fn corporation_upsert_is_idempotent_and_field_preserving() {
    let (service, _clock, _) = service_with_clock();

    let founding = CorporationPatch {
        name: Some("Militech".into()),
        leader_id: Some("alice".into()),
        funds: Some(1_000),
        ..Default::default()
    };
    let first = service.upsert_corporation("corp-1", &founding).await.expect("create");
    let again = service.upsert_corporation("corp-1", &founding).await.expect("repeat");
    assert_eq!(first, again);

    let bump = CorporationPatch {
        reputation: Some(42),
        ..Default::default()
    };
    let updated = service.upsert_corporation("corp-1", &bump).await.expect("update");
    assert_eq!(updated.name, "Militech");
    assert_eq!(updated.leader_id, "alice");
    assert_eq!(updated.funds, 1_000);
    assert_eq!(updated.reputation, 42);

    let stored = service.get_corporation("corp-1").await.expect("get").expect("exists");
    assert_eq!(stored, updated);
    assert!(service.get_corporation("corp-2").await.expect("get").is_none());

    assert!(matches!(
        service.upsert_corporation("  ", &bump).await,
        Err(ReplicationError::Validation(_))
    ));
}

#[tokio::test]
async fn corporations_list_by_reputation() {
    let (service, _clock, _) = service_with_clock();
    for (id, reputation) in [("a", 5), ("b", 50), ("c", 20)] {
        let patch = CorporationPatch {
            reputation: Some(reputation),
            ..Default::default()
        };
        service.upsert_corporation(id, &patch).await.expect("upsert");
    }

    let top: Vec<String> = service
        .list_corporations(2)
        .await
        .expect("list")
        .into_iter()
        .map(|corp| corp.corp_id)
        .collect();
    assert_eq!(top, vec!["b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn leaderboard_cache_boundary() {
    let (service, clock, _) = service_with_clock();
    service
        .update_leaderboard_entry(LeaderboardType::Money, "alice", 100.0, "eu-1", "Alice")
        .await
        .expect("write");

    let first = service.get_leaderboard(LeaderboardType::Money, 10).await.expect("read");
    assert_eq!(first.len(), 1);

    // a write inside the window is not visible until the snapshot expires
    service
        .update_leaderboard_entry(LeaderboardType::Money, "bob", 500.0, "us-1", "Bob")
        .await
        .expect("write");

    clock.advance(Duration::seconds(59));
    let cached = service.get_leaderboard(LeaderboardType::Money, 10).await.expect("read");
    assert!(Arc::ptr_eq(&first, &cached));
    assert_eq!(cached.len(), 1);

    clock.advance(Duration::seconds(1));
    let fresh = service.get_leaderboard(LeaderboardType::Money, 10).await.expect("read");
    assert_eq!(fresh.len(), 2);
    assert_eq!(fresh[0].player_id, "bob");
    assert_eq!(fresh[0].rank, 1);
    assert_eq!(fresh[1].player_id, "alice");
    assert_eq!(fresh[1].rank, 2);
}

#[tokio::test]
async fn leaderboard_last_write_wins_and_ties_break_by_player() {
    let (service, _clock, _) = service_with_clock();
    let kind = LeaderboardType::Reputation;
    service.update_leaderboard_entry(kind, "carol", 10.0, "eu-1", "Carol").await.expect("write");
    service.update_leaderboard_entry(kind, "bob", 99.0, "eu-1", "Bob").await.expect("write");
    service.update_leaderboard_entry(kind, "bob", 10.0, "eu-1", "Bob").await.expect("write");
    service.update_leaderboard_entry(kind, "alice", 10.0, "us-1", "Alice").await.expect("write");

    let board = service.get_leaderboard(kind, 10).await.expect("read");
    let order: Vec<(&str, u32)> = board.iter().map(|e| (e.player_id.as_str(), e.rank)).collect();
    assert_eq!(order, vec![("alice", 1), ("bob", 2), ("carol", 3)]);

    let top = service.get_leaderboard(kind, 1).await.expect("read");
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].player_id, "alice");
}

#[tokio::test]
async fn recalculate_ranks_persists_and_invalidates_cache() {
    let (service, _clock, store) = service_with_clock();
    let kind = LeaderboardType::Level;
    service.update_leaderboard_entry(kind, "alice", 3.0, "eu-1", "Alice").await.expect("write");
    let before = service.get_leaderboard(kind, 10).await.expect("read");
    assert_eq!(before.len(), 1);

    service.update_leaderboard_entry(kind, "bob", 7.0, "eu-1", "Bob").await.expect("write");
    let ranked = service.recalculate_ranks(kind).await.expect("recalculate");
    assert_eq!(ranked, 2);

    // cache dropped, so the next read sees bob without waiting for the TTL
    let after = service.get_leaderboard(kind, 10).await.expect("read");
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].player_id, "bob");

    let mut rows = store.leaderboard_entries(kind).await.expect("rows");
    rows.sort_by_key(|row| row.rank);
    let persisted: Vec<(&str, u32)> = rows.iter().map(|e| (e.player_id.as_str(), e.rank)).collect();
    assert_eq!(persisted, vec![("bob", 1), ("alice", 2)]);
}

#[tokio::test]
async fn recording_a_session_closes_exactly_the_prior_online_row() {
    let (service, clock, store) = service_with_clock();

    assert_eq!(service.record_player_session("alice", "eu-1", "conn-1").await.expect("first"), 0);
    clock.advance(Duration::seconds(5));
    assert_eq!(service.record_player_session("alice", "us-1", "conn-2").await.expect("second"), 1);

    let history = store.session_history().await;
    assert_eq!(history.len(), 2);
    let online: Vec<_> = history.iter().filter(|row| row.is_online).collect();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].connection_id, "conn-2");
    assert!(history[0].disconnected_at.is_some());

    assert!(service.end_player_session("conn-2").await.expect("end"));
    assert!(!service.end_player_session("conn-2").await.expect("end again"));
    assert_eq!(service.get_total_online_count().await.expect("count"), 0);
}

#[tokio::test]
async fn online_counts_are_per_shard_and_distinct_overall() {
    let (service, _clock, _) = service_with_clock();
    service.record_player_session("alice", "eu-1", "c1").await.expect("s");
    service.record_player_session("bob", "eu-1", "c2").await.expect("s");
    service.record_player_session("carol", "us-1", "c3").await.expect("s");

    let eu = service.get_online_players_by_shard("eu-1").await.expect("eu");
    assert_eq!(eu.len(), 2);
    assert_eq!(service.get_online_players_by_shard("ap-1").await.expect("ap").len(), 0);
    assert_eq!(service.get_total_online_count().await.expect("total"), 3);
}

#[tokio::test]
async fn stale_cleanup_respects_threshold_and_is_idempotent() {
    let (service, clock, _) = service_with_clock();
    service.record_player_session("alice", "eu-1", "c1").await.expect("s");
    service.record_player_session("bob", "eu-1", "c2").await.expect("s");

    clock.advance(Duration::minutes(4));
    assert!(service.touch_player_session("c2").await.expect("touch"));
    assert_eq!(service.cleanup_stale_sessions(5).await.expect("cleanup"), 0);

    clock.advance(Duration::minutes(2));
    assert_eq!(service.cleanup_stale_sessions(5).await.expect("cleanup"), 1);
    assert_eq!(service.cleanup_stale_sessions(5).await.expect("cleanup"), 0);

    let online = service.get_online_players_by_shard("eu-1").await.expect("online");
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].player_id, "bob");
}

#[tokio::test]
async fn oversized_stale_windows_are_rejected_without_closing_anything() {
    let (service, _clock, _) = service_with_clock();
    service.record_player_session("alice", "eu-1", "c1").await.expect("s");

    for minutes in [u64::MAX, 1 << 60, i64::MAX as u64] {
        assert!(matches!(
            service.cleanup_stale_sessions(minutes).await,
            Err(ReplicationError::Validation(_))
        ));
    }
    assert_eq!(service.cleanup_stale_sessions(60 * 24 * 365).await.expect("cleanup"), 0);
    assert_eq!(service.get_total_online_count().await.expect("total"), 1);
}

#[tokio::test]
async fn huge_refresh_interval_keeps_leaderboards_cached() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::new());
    let service = ReplicationService::new(store.clone(), Arc::new(clock.clone()), u64::MAX);
    service
        .update_leaderboard_entry(LeaderboardType::Money, "alice", 10.0, "eu-1", "Alice")
        .await
        .expect("update");
    assert_eq!(service.get_leaderboard(LeaderboardType::Money, 10).await.expect("board").len(), 1);

    // written behind the service's back, so only a recompute would see it
    store
        .upsert_leaderboard_entry(&LeaderboardEntry {
            leaderboard_type: LeaderboardType::Money,
            player_id: "bob".into(),
            player_name: "Bob".into(),
            shard_id: "eu-1".into(),
            value: 20.0,
            rank: 0,
            updated_at: clock.now(),
        })
        .await
        .expect("direct write");
    clock.advance(Duration::days(3650));
    assert_eq!(service.get_leaderboard(LeaderboardType::Money, 10).await.expect("board").len(), 1);
}

#[tokio::test]
async fn global_events_filter_by_shard_and_expire() {
    let (service, clock, _) = service_with_clock();
    let event = service
        .create_global_event(NewGlobalEvent {
            event_type: "market_crash".into(),
            title: "Market crash".into(),
            description: "Prices collapse".into(),
            affected_shards: vec!["eu-1".into()],
            start_at: None,
            duration_seconds: Some(3600),
        })
        .await
        .expect("create");
    let everywhere = service
        .create_global_event(NewGlobalEvent {
            event_type: "double_xp".into(),
            title: "Double XP".into(),
            description: String::new(),
            affected_shards: vec!["all".into()],
            start_at: None,
            duration_seconds: None,
        })
        .await
        .expect("create");

    let eu = service.get_active_global_events(Some("eu-1")).await.expect("eu");
    assert_eq!(eu.len(), 2);
    assert!(eu.iter().any(|active| active.id == event.id));
    let us = service.get_active_global_events(Some("us-1")).await.expect("us");
    assert_eq!(us.len(), 1);
    assert_eq!(us[0].id, everywhere.id);
    assert_eq!(service.get_active_global_events(None).await.expect("all").len(), 2);

    clock.advance(Duration::seconds(3600));
    let eu = service.get_active_global_events(Some("eu-1")).await.expect("eu");
    assert_eq!(eu.len(), 1);
    assert_eq!(eu[0].id, everywhere.id);

    assert!(service.end_global_event(&everywhere.id).await.expect("end"));
    assert!(!service.end_global_event("missing").await.expect("end"));
    assert!(service.get_active_global_events(None).await.expect("all").is_empty());

    assert!(matches!(
        service
            .create_global_event(NewGlobalEvent {
                event_type: "x".into(),
                title: "x".into(),
                description: String::new(),
                affected_shards: vec!["eu-1".into()],
                start_at: None,
                duration_seconds: Some(0),
            })
            .await,
        Err(ReplicationError::Validation(_))
    ));
    assert!(matches!(
        service
            .create_global_event(NewGlobalEvent {
                event_type: "x".into(),
                title: "x".into(),
                description: String::new(),
                affected_shards: vec!["eu-1".into()],
                start_at: None,
                duration_seconds: Some(i64::MAX),
            })
            .await,
        Err(ReplicationError::Validation(_))
    ));
}

#[tokio::test]
async fn recent_sync_events_are_newest_first() {
    let (service, clock, _) = service_with_clock();
    for i in 0..5 {
        let event = SyncEvent::new(
            SyncEventType::ChatGlobal,
            json!({ "n": i }),
            "alice",
            "eu-1",
            clock.now_millis(),
        );
        service.log_sync_event(&event).await.expect("log");
        clock.advance(Duration::seconds(1));
    }

    let recent = service.get_recent_sync_events(3).await.expect("recent");
    let order: Vec<i64> = recent.iter().map(|r| r.payload["n"].as_i64().unwrap_or(-1)).collect();
    assert_eq!(order, vec![4, 3, 2]);
}

#[tokio::test]
async fn spawned_sync_log_lands_eventually() {
    let (service, _clock, _) = service_with_clock();
    let event = SyncEvent::new(SyncEventType::PlayerJoin, json!({}), "alice", "eu-1", 0);
    service.spawn_sync_log(event.clone());

    let mut found = false;
    for _ in 0..20 {
        if service
            .get_recent_sync_events(10)
            .await
            .expect("recent")
            .iter()
            .any(|record| record.event_id == event.event_id)
        {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(found);
}
