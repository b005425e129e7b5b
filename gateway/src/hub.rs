//! The connection gateway: session lifecycle, command routing, local room
//! fan-out and the broker relay in both directions.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_net::broker::{channels, BrokerBridge, BrokerHandler};
use common_net::clock::Clock;
use common_net::message::{
    decode_frame, AuthRequest, ChatChannel, ChatRequest, ClientCommand, CorpActionRequest,
    ErrorCode, GatewayStats, PingRequest, PlayerUpdateRequest, ProtocolError, RaidPhase,
    RaidRequest, ServerMessage, StateSyncRequest, SyncEvent, SyncEventType,
};
use common_net::metrics::gateway_metrics;
use common_net::shutdown::{self, ShutdownReceiver};
use replication::model::{CorporationPatch, LeaderboardType};
use replication::ReplicationService;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::archive::{ChatArchive, PrivateMessage};
use crate::error::GatewayError;
use crate::registry::{
    close_code, AdmitError, ConnectedClient, ConnectionId, Outbound, Outbox, Registry,
};

pub const MAX_CHAT_LENGTH: usize = 500;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// How long a completed raid's room stays open.
    pub raid_close_delay: Duration,
    pub idle_timeout: Duration,
    /// Gap between the shutdown notice and closing every socket.
    pub shutdown_drain: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            raid_close_delay: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            shutdown_drain: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Logout,
    Timeout,
    Disconnect,
}

impl DisconnectReason {
    /// Folds transport-specific reason strings into the three kinds peers see.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.contains("timeout") || raw == "idle" {
            Self::Timeout
        } else if raw == "logout" || raw == "client namespace disconnect" || raw == "client close" {
            Self::Logout
        } else {
            Self::Disconnect
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Timeout => "timeout",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Local room that inbound broker traffic on `channel` is fanned out to.
pub fn room_for_channel(channel: &str) -> Option<String> {
    match channel {
        channels::GLOBAL | channels::CORPORATIONS | channels::LEADERBOARD => {
            Some(channels::GLOBAL.to_string())
        }
        other
            if other.starts_with("shard:")
                || other.starts_with("corp:")
                || other.starts_with("raid:") =>
        {
            Some(other.to_string())
        }
        _ => None,
    }
}

fn deliver(outbox: &Outbox, message: ServerMessage) {
    // the receiving socket may already be gone
    let _ = outbox.send(Outbound::Message(message));
}

struct Inner {
    registry: RwLock<Registry>,
    broker: Arc<BrokerBridge>,
    replication: Arc<ReplicationService>,
    clock: Arc<dyn Clock>,
    archive: Option<Arc<dyn ChatArchive>>,
    options: GatewayOptions,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("node_id", &self.node_id())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Gateway {
    pub fn new(
        broker: Arc<BrokerBridge>,
        replication: Arc<ReplicationService>,
        options: GatewayOptions,
        archive: Option<Arc<dyn ChatArchive>>,
    ) -> Self {
        let clock = replication.clock().clone();
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::new()),
                broker,
                replication,
                clock,
                archive,
                options,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.broker.node_id()
    }

    pub fn broker(&self) -> &Arc<BrokerBridge> {
        &self.inner.broker
    }

    pub fn replication(&self) -> &Arc<ReplicationService> {
        &self.inner.replication
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ---- lifecycle ----

    /// Registers a fresh, unauthenticated socket.
    pub async fn connect(&self, outbox: Outbox) -> ConnectionId {
        let connection_id = ConnectionId::new();
        if self.is_shutting_down() {
            deliver(&outbox, ServerMessage::error(ErrorCode::ServerShutdown, "server is shutting down"));
            let _ = outbox.send(Outbound::Close {
                code: close_code::GOING_AWAY,
                reason: "server shutdown".to_string(),
            });
            return connection_id;
        }

        let mut registry = self.inner.registry.write().await;
        registry.open(connection_id, outbox, self.now());
        gateway_metrics()
            .connections_open
            .set(registry.connection_count() as i64);
        debug!(%connection_id, "gateway: connection opened");
        connection_id
    }

    pub async fn client(&self, connection_id: &ConnectionId) -> Option<ConnectedClient> {
        self.inner.registry.read().await.client(connection_id).cloned()
    }

    async fn send(&self, connection_id: &ConnectionId, message: ServerMessage) {
        if let Some(outbox) = self.inner.registry.read().await.outbox(connection_id) {
            deliver(outbox, message);
        }
    }

    pub async fn authenticate(
        &self,
        connection_id: &ConnectionId,
        request: AuthRequest,
    ) -> Result<(), GatewayError> {
        let player_id = request.player_id.trim().to_string();
        let shard_id = request.shard_id.trim().to_string();
        if player_id.is_empty() || shard_id.is_empty() {
            return Err(GatewayError::Validation("playerId and shardId are required".into()));
        }
        let display_name = match request.player_name.trim() {
            "" => player_id.clone(),
            name => name.to_string(),
        };
        let corp_id = request
            .corp_id
            .map(|corp| corp.trim().to_string())
            .filter(|corp| !corp.is_empty());

        let now = self.now();
        let shard_room = channels::shard(&shard_id);
        let mut rooms = BTreeSet::from([channels::GLOBAL.to_string(), shard_room.clone()]);
        if let Some(corp) = &corp_id {
            rooms.insert(channels::corp(corp));
        }
        let client = ConnectedClient {
            connection_id: *connection_id,
            player_id: player_id.clone(),
            display_name: display_name.clone(),
            shard_id: shard_id.clone(),
            corp_id: corp_id.clone(),
            connected_at: now,
            last_ping: now,
            rooms,
        };

        let (evicted, online_count) = {
            let mut registry = self.inner.registry.write().await;
            let evicted = registry.admit(client).map_err(|err| match err {
                AdmitError::UnknownConnection => GatewayError::UnknownConnection,
                AdmitError::AlreadyAuthenticated => GatewayError::AlreadyAuthenticated,
            })?;
            let metrics = gateway_metrics();
            metrics.players_online.set(registry.online_count() as i64);
            metrics.connections_open.set(registry.connection_count() as i64);
            (evicted, registry.online_count())
        };
        gateway_metrics().auth_total.inc();

        let evicted_rooms = evicted
            .as_ref()
            .and_then(|evicted| evicted.client.as_ref())
            .map(|client| client.rooms.clone())
            .unwrap_or_default();
        if let Some(evicted) = evicted {
            gateway_metrics().duplicate_evictions_total.inc();
            info!(
                player_id = %player_id,
                evicted = %evicted.connection_id,
                %connection_id,
                "gateway: duplicate session evicted"
            );
            deliver(
                &evicted.outbox,
                ServerMessage::error(ErrorCode::DuplicateSession, "signed in from another connection"),
            );
            let _ = evicted.outbox.send(Outbound::Close {
                code: close_code::POLICY_VIOLATION,
                reason: "duplicate session".to_string(),
            });
        }

        if let Err(err) = self
            .inner
            .replication
            .record_player_session(&player_id, &shard_id, &connection_id.to_string())
            .await
        {
            warn!(%err, player_id = %player_id, "gateway: session record failed");
        }

        let live = {
            let registry = self.inner.registry.read().await;
            registry
                .connection_for(&player_id)
                .and_then(|live| registry.client(&live).cloned())
        };
        if live.as_ref().map(|live| live.connection_id) != Some(*connection_id) {
            self.abandon_superseded_session(connection_id, live).await;
            self.release_if_empty(evicted_rooms).await;
            return Ok(());
        }

        self.send(
            connection_id,
            ServerMessage::AuthSuccess {
                connection_id: connection_id.to_string(),
                shard_id: shard_id.clone(),
                server_time: now.timestamp_millis(),
                online_count,
            },
        )
        .await;

        self.inner.broker.ensure_subscribed(&shard_room).await;
        if let Some(corp) = &corp_id {
            self.inner.broker.ensure_subscribed(&channels::corp(corp)).await;
        }
        self.release_if_empty(evicted_rooms).await;

        let event = SyncEvent::new(
            SyncEventType::PlayerJoin,
            json!({
                "playerId": player_id,
                "playerName": display_name,
                "shardId": shard_id,
                "corpId": corp_id,
            }),
            &player_id,
            &shard_id,
            now.timestamp_millis(),
        );
        self.emit(event, &shard_room, Some(connection_id), Some(&shard_room))
            .await;

        info!(player_id = %player_id, shard_id = %shard_id, %connection_id, online_count, "gateway: player authenticated");
        Ok(())
    }

    /// A newer connection for the same player was admitted while this one's
    /// session row was being written. Closes the row written for
    /// `connection_id` and puts back the one belonging to `live`.
    async fn abandon_superseded_session(&self, connection_id: &ConnectionId, live: Option<ConnectedClient>) {
        debug!(%connection_id, "gateway: authentication superseded before completion");
        let replication = &self.inner.replication;
        if let Err(err) = replication.end_player_session(&connection_id.to_string()).await {
            warn!(%err, %connection_id, "gateway: superseded session close failed");
        }
        let Some(live) = live else { return };
        if let Err(err) = replication
            .record_player_session(&live.player_id, &live.shard_id, &live.connection_id.to_string())
            .await
        {
            warn!(%err, player_id = %live.player_id, "gateway: session restore failed");
        }
        // the live connection may have gone while its row was restored
        if !self.inner.registry.read().await.contains(&live.connection_id) {
            let _ = replication.end_player_session(&live.connection_id.to_string()).await;
        }
    }

    /// Drops the broker subscription of every room in `rooms` that has no
    /// local member left. The registry stays read-locked until the releases
    /// finish, so a member joining one of these rooms either keeps it
    /// populated here or subscribes again after the release.
    async fn release_if_empty(&self, rooms: impl IntoIterator<Item = String>) {
        let registry = self.inner.registry.read().await;
        for room in rooms {
            if registry.room_size(&room) == 0 {
                self.inner.broker.release(&room).await;
            }
        }
    }

    /// Tears down a connection. Returns `false` when it was already gone
    /// (for instance after a duplicate-session eviction).
    pub async fn disconnect(&self, connection_id: &ConnectionId, reason: &str) -> bool {
        let reason = DisconnectReason::normalize(reason);
        let removed = {
            let mut registry = self.inner.registry.write().await;
            let Some(removed) = registry.remove(connection_id) else {
                return false;
            };
            let metrics = gateway_metrics();
            metrics.players_online.set(registry.online_count() as i64);
            metrics.connections_open.set(registry.connection_count() as i64);
            removed
        };

        let Some(client) = removed.client else {
            debug!(%connection_id, "gateway: unauthenticated connection closed");
            return true;
        };

        let shard_room = channels::shard(&client.shard_id);
        let event = SyncEvent::new(
            SyncEventType::PlayerLeave,
            json!({
                "playerId": client.player_id,
                "playerName": client.display_name,
                "shardId": client.shard_id,
                "reason": reason.as_str(),
            }),
            &client.player_id,
            &client.shard_id,
            self.now().timestamp_millis(),
        );
        self.emit(event, &shard_room, None, Some(&shard_room)).await;

        if let Err(err) = self
            .inner
            .replication
            .end_player_session(&connection_id.to_string())
            .await
        {
            warn!(%err, %connection_id, "gateway: session close failed");
        }

        self.release_if_empty(client.rooms.iter().cloned()).await;

        info!(player_id = %client.player_id, %connection_id, reason = reason.as_str(), "gateway: player disconnected");
        true
    }

    // ---- routing ----

    /// Handles one raw `{event, data}` frame. Problems are reported to the
    /// sender as `error` frames; the connection stays open.
    pub async fn route_client_event(&self, connection_id: &ConnectionId, raw: &str) {
        if let Err(err) = self.dispatch(connection_id, raw).await {
            gateway_metrics().inc_rejected(err.reason());
            match err.code() {
                Some(code) => {
                    debug!(%err, %connection_id, "gateway: frame rejected");
                    self.send(connection_id, ServerMessage::error(code, err.to_string()))
                        .await;
                }
                None => debug!(%err, %connection_id, "gateway: frame dropped"),
            }
        }
    }

    async fn dispatch(&self, connection_id: &ConnectionId, raw: &str) -> Result<(), GatewayError> {
        let frame = decode_frame(raw)?;
        let event = frame.event.clone();
        let parsed = ClientCommand::parse(frame);
        let client = self.client(connection_id).await;

        let (command, client) = match (parsed, client) {
            (Err(ProtocolError::UnknownEvent(kind)), _) => {
                return Err(ProtocolError::UnknownEvent(kind).into())
            }
            (Ok(ClientCommand::Auth(request)), None) => {
                gateway_metrics().inc_command(ClientCommand::AUTH);
                return self.authenticate(connection_id, request).await;
            }
            (Ok(ClientCommand::Auth(_)), Some(_)) => return Err(GatewayError::AlreadyAuthenticated),
            (Err(err), None) if event == ClientCommand::AUTH => return Err(err.into()),
            (_, None) => return Err(GatewayError::NotAuthenticated),
            (Err(err), Some(_)) => return Err(err.into()),
            (Ok(command), Some(client)) => (command, client),
        };

        gateway_metrics().inc_command(&event);
        match command {
            ClientCommand::Chat(request) => self.handle_chat(&client, request).await,
            ClientCommand::PlayerUpdate(request) => self.handle_player_update(&client, request).await,
            ClientCommand::StateSync(request) => self.handle_state_sync(&client, request).await,
            ClientCommand::CorpAction(request) => self.handle_corp_action(&client, request).await,
            ClientCommand::Ping(request) => self.handle_ping(&client, request).await,
            ClientCommand::Raid(phase, request) => self.handle_raid(&client, phase, request).await,
            ClientCommand::Auth(_) => Err(GatewayError::AlreadyAuthenticated),
        }
    }

    async fn handle_chat(&self, client: &ConnectedClient, request: ChatRequest) -> Result<(), GatewayError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(GatewayError::Validation("chat content must not be empty".into()));
        }
        if content.chars().count() > MAX_CHAT_LENGTH {
            return Err(GatewayError::Validation(format!(
                "chat content exceeds {MAX_CHAT_LENGTH} characters"
            )));
        }

        let now = self.now();
        let mut payload = json!({
            "playerId": client.player_id,
            "playerName": client.display_name,
            "content": content,
            "channel": request.channel,
        });
        let event_type = match request.channel {
            ChatChannel::Global => SyncEventType::ChatGlobal,
            _ => SyncEventType::ChatMessage,
        };

        match request.channel {
            ChatChannel::Global => {
                let event = self.event(event_type, payload, client, now);
                self.emit(event, channels::GLOBAL, None, Some(channels::GLOBAL)).await;
            }
            ChatChannel::Shard => {
                let room = channels::shard(&client.shard_id);
                let event = self.event(event_type, payload, client, now);
                self.emit(event, &room, None, Some(&room)).await;
            }
            ChatChannel::Corp => {
                let corp_id = request
                    .corp_id
                    .filter(|corp| !corp.trim().is_empty())
                    .or_else(|| client.corp_id.clone());
                let Some(corp_id) = corp_id else {
                    debug!(player_id = %client.player_id, "gateway: corp chat without a corp dropped");
                    return Ok(());
                };
                payload["corpId"] = Value::String(corp_id.clone());
                let room = channels::corp(corp_id.trim());
                let event = self.event(event_type, payload, client, now);
                self.emit(event, &room, None, Some(&room)).await;
            }
            ChatChannel::Private => {
                let recipient_id = request
                    .recipient_id
                    .map(|recipient| recipient.trim().to_string())
                    .filter(|recipient| !recipient.is_empty())
                    .ok_or_else(|| GatewayError::Validation("private chat needs recipientId".into()))?;
                payload["recipientId"] = Value::String(recipient_id.clone());
                let mut event = self.event(event_type, payload, client, now);

                let mut targets: Vec<Outbox> = Vec::with_capacity(2);
                {
                    let registry = self.inner.registry.read().await;
                    let recipient = registry.connection_for(&recipient_id);
                    if let Some(recipient) = recipient.as_ref().and_then(|id| registry.client(id)) {
                        event = event.with_target_shard(recipient.shard_id.as_str());
                    }
                    if let Some(outbox) = recipient.as_ref().and_then(|id| registry.outbox(id)) {
                        targets.push(outbox.clone());
                    }
                    if recipient != Some(client.connection_id) {
                        if let Some(outbox) = registry.outbox(&client.connection_id) {
                            targets.push(outbox.clone());
                        }
                    }
                }
                for outbox in &targets {
                    deliver(outbox, ServerMessage::SyncEvent(event.clone()));
                }
                self.inner.replication.spawn_sync_log(event);

                if let Some(archive) = &self.inner.archive {
                    let archive = Arc::clone(archive);
                    let message = PrivateMessage {
                        sender_id: client.player_id.clone(),
                        recipient_id,
                        content: content.to_string(),
                        sent_at: now,
                    };
                    tokio::spawn(async move {
                        if let Err(err) = archive.store_private(message).await {
                            warn!(%err, "gateway: private message archive failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle_player_update(
        &self,
        client: &ConnectedClient,
        request: PlayerUpdateRequest,
    ) -> Result<(), GatewayError> {
        if request.updates.is_empty() {
            return Err(GatewayError::Validation("updates must not be empty".into()));
        }

        let now = self.now();
        let ranked: Vec<(LeaderboardType, Option<f64>)> = request
            .updates
            .iter()
            .filter_map(|(stat, value)| {
                LeaderboardType::from_player_stat(stat).map(|kind| (kind, value.as_f64()))
            })
            .collect();

        let event = self.event(
            SyncEventType::PlayerUpdate,
            json!({
                "playerId": client.player_id,
                "playerName": client.display_name,
                "updates": request.updates,
            }),
            client,
            now,
        );
        let relay = if ranked.is_empty() { None } else { Some(channels::LEADERBOARD) };
        self.emit(event, &channels::shard(&client.shard_id), Some(&client.connection_id), relay)
            .await;

        for (kind, value) in ranked {
            let Some(value) = value else { continue };
            let replication = Arc::clone(&self.inner.replication);
            let player_id = client.player_id.clone();
            let player_name = client.display_name.clone();
            let shard_id = client.shard_id.clone();
            tokio::spawn(async move {
                if let Err(err) = replication
                    .update_leaderboard_entry(kind, &player_id, value, &shard_id, &player_name)
                    .await
                {
                    warn!(%err, player_id = %player_id, leaderboard = %kind, "gateway: leaderboard write failed");
                }
            });
        }
        Ok(())
    }

    async fn handle_state_sync(&self, client: &ConnectedClient, request: StateSyncRequest) -> Result<(), GatewayError> {
        let global = request.sync_type.eq_ignore_ascii_case("global");
        let (players, online_count) = {
            let registry = self.inner.registry.read().await;
            let scope = if global { None } else { Some(client.shard_id.as_str()) };
            (registry.players(scope), registry.online_count())
        };
        self.send(
            &client.connection_id,
            ServerMessage::StateSyncResponse {
                sync_type: request.sync_type,
                shard_id: client.shard_id.clone(),
                players,
                online_count,
                server_time: self.now().timestamp_millis(),
            },
        )
        .await;
        Ok(())
    }

    async fn handle_ping(&self, client: &ConnectedClient, request: PingRequest) -> Result<(), GatewayError> {
        let now = self.now();
        if let Some(stored) = self
            .inner
            .registry
            .write()
            .await
            .client_mut(&client.connection_id)
        {
            stored.last_ping = now;
        }

        let replication = Arc::clone(&self.inner.replication);
        let connection_id = client.connection_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = replication.touch_player_session(&connection_id).await {
                debug!(%err, connection_id = %connection_id, "gateway: session touch failed");
            }
        });

        self.send(
            &client.connection_id,
            ServerMessage::Pong {
                client_timestamp: request.timestamp,
                server_timestamp: now.timestamp_millis(),
            },
        )
        .await;
        Ok(())
    }

    async fn handle_corp_action(&self, client: &ConnectedClient, request: CorpActionRequest) -> Result<(), GatewayError> {
        let corp_id = request.corp_id.trim().to_string();
        if corp_id.is_empty() {
            return Err(GatewayError::Validation("corpId must not be empty".into()));
        }
        let action = request.action.trim().to_ascii_lowercase();
        let room = channels::corp(&corp_id);

        match action.as_str() {
            "join" => {
                let previous = {
                    let mut registry = self.inner.registry.write().await;
                    let previous = registry
                        .client(&client.connection_id)
                        .and_then(|stored| stored.corp_id.clone())
                        .filter(|previous| *previous != corp_id)
                        .map(|previous| channels::corp(&previous));
                    if let Some(previous) = &previous {
                        registry.leave(&client.connection_id, previous);
                    }
                    registry.join(&client.connection_id, &room);
                    if let Some(stored) = registry.client_mut(&client.connection_id) {
                        stored.corp_id = Some(corp_id.clone());
                    }
                    previous
                };
                self.inner.broker.ensure_subscribed(&room).await;
                self.release_if_empty(previous).await;
            }
            "leave" => {
                {
                    let mut registry = self.inner.registry.write().await;
                    registry.leave(&client.connection_id, &room);
                    if let Some(stored) = registry.client_mut(&client.connection_id) {
                        if stored.corp_id.as_deref() == Some(corp_id.as_str()) {
                            stored.corp_id = None;
                        }
                    }
                }
                self.release_if_empty([room.clone()]).await;
            }
            "update" => {
                let data = match &request.data {
                    Value::Null => return Err(GatewayError::Validation("corp update needs data".into())),
                    data => data.clone(),
                };
                let patch: CorporationPatch = serde_json::from_value(data)
                    .map_err(|err| GatewayError::Validation(format!("corp update: {err}")))?;
                if patch.is_empty() {
                    return Err(GatewayError::Validation("corp update changes no known field".into()));
                }
                if let Err(err) = self.inner.replication.upsert_corporation(&corp_id, &patch).await {
                    warn!(%err, corp_id = %corp_id, "gateway: corporation upsert failed");
                }
            }
            other => {
                return Err(GatewayError::Validation(format!("unknown corp action '{other}'")));
            }
        }

        let event = self.event(
            SyncEventType::CorpAction,
            json!({
                "action": action,
                "corpId": corp_id,
                "playerId": client.player_id,
                "playerName": client.display_name,
                "data": request.data,
            }),
            client,
            self.now(),
        );
        if action == "update" {
            self.relay(channels::CORPORATIONS, &event).await;
        }
        self.emit(event, &room, None, Some(&room)).await;
        Ok(())
    }

    async fn handle_raid(
        &self,
        client: &ConnectedClient,
        phase: RaidPhase,
        request: RaidRequest,
    ) -> Result<(), GatewayError> {
        let raid_id = request.raid_id.trim().to_string();
        if raid_id.is_empty() {
            return Err(GatewayError::Validation("raidId must not be empty".into()));
        }
        let room = channels::raid(&raid_id);

        let member = {
            let mut registry = self.inner.registry.write().await;
            if phase == RaidPhase::Join {
                registry.join(&client.connection_id, &room);
            }
            registry
                .client(&client.connection_id)
                .is_some_and(|stored| stored.rooms.contains(&room))
        };
        if member {
            self.inner.broker.ensure_subscribed(&room).await;
        }

        let mut payload = request.body;
        payload.insert("raidId".into(), Value::String(raid_id.clone()));
        payload.insert("playerId".into(), Value::String(client.player_id.clone()));
        payload.insert("playerName".into(), Value::String(client.display_name.clone()));

        let event = self.event(phase.event_type(), Value::Object(payload), client, self.now());
        self.emit(event, &room, None, Some(&room)).await;

        if phase == RaidPhase::Complete {
            self.schedule_raid_close(raid_id);
        }
        Ok(())
    }

    fn schedule_raid_close(&self, raid_id: String) {
        let gateway = self.clone();
        let delay = self.inner.options.raid_close_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            gateway.close_raid_room(&raid_id).await;
        });
    }

    /// Empties the raid room and drops the broker subscription. Returns how
    /// many local members were removed.
    pub async fn close_raid_room(&self, raid_id: &str) -> usize {
        let room = channels::raid(raid_id);
        let mut registry = self.inner.registry.write().await;
        let members = registry.close_room(&room);
        // still locked, so a concurrent raid:join re-subscribes after this
        self.inner.broker.release(&room).await;
        drop(registry);
        info!(raid_id, members = members.len(), "gateway: raid room closed");
        members.len()
    }

    // ---- fan-out & relay ----

    fn event(&self, event_type: SyncEventType, payload: Value, client: &ConnectedClient, now: DateTime<Utc>) -> SyncEvent {
        SyncEvent::new(
            event_type,
            payload,
            &client.player_id,
            &client.shard_id,
            now.timestamp_millis(),
        )
    }

    /// Delivers `event` to local members of `room`. Returns the number of
    /// recipients.
    pub async fn fan_out(&self, room: &str, event: &SyncEvent, exclude: Option<&ConnectionId>) -> usize {
        let outboxes = self.inner.registry.read().await.room_outboxes(room, exclude);
        for outbox in &outboxes {
            deliver(outbox, ServerMessage::SyncEvent(event.clone()));
        }
        outboxes.len()
    }

    async fn relay(&self, channel: &str, event: &SyncEvent) {
        if let Err(err) = self.inner.broker.publish(channel, event).await {
            if !self.inner.broker.is_shutting_down() {
                warn!(%err, channel, event_type = event.event_type.as_str(), "gateway: broker relay failed");
            }
        }
    }

    async fn emit(
        &self,
        event: SyncEvent,
        room: &str,
        exclude: Option<&ConnectionId>,
        channel: Option<&str>,
    ) {
        self.fan_out(room, &event, exclude).await;
        if let Some(channel) = channel {
            self.relay(channel, &event).await;
        }
        self.inner.replication.spawn_sync_log(event);
    }

    // ---- introspection & maintenance ----

    pub async fn get_stats(&self) -> GatewayStats {
        let registry = self.inner.registry.read().await;
        GatewayStats {
            online_count: registry.online_count(),
            shard_counts: registry.shard_counts(),
        }
    }

    /// Disconnects every connection idle for longer than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let timeout = chrono::Duration::from_std(self.inner.options.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let cutoff = self.now() - timeout;
        let idle: Vec<(ConnectionId, Option<Outbox>)> = {
            let registry = self.inner.registry.read().await;
            registry
                .idle_since(cutoff)
                .into_iter()
                .map(|id| (id, registry.outbox(&id).cloned()))
                .collect()
        };

        let mut reaped = 0;
        for (connection_id, outbox) in idle {
            if let Some(outbox) = outbox {
                let _ = outbox.send(Outbound::Close {
                    code: close_code::GOING_AWAY,
                    reason: "idle timeout".to_string(),
                });
            }
            if self.disconnect(&connection_id, "timeout").await {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped, "gateway: idle connections reaped");
        }
        reaped
    }

    pub fn spawn_idle_reaper(&self, shutdown_rx: ShutdownReceiver) -> JoinHandle<()> {
        let gateway = self.clone();
        let period = (self.inner.options.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let stopped = shutdown::wait(shutdown_rx);
            tokio::pin!(stopped);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        gateway.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Announces shutdown, waits out the drain window, then closes every
    /// socket. Safe to call more than once.
    pub async fn close_connections(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let outboxes = self.inner.registry.read().await.outboxes();
        info!(connections = outboxes.len(), "gateway: announcing shutdown");
        for outbox in &outboxes {
            deliver(outbox, ServerMessage::error(ErrorCode::ServerShutdown, "server is shutting down"));
        }

        shutdown::drain(self.inner.options.shutdown_drain).await;

        let removed = self.inner.registry.write().await.drain();
        for entry in &removed {
            let _ = entry.outbox.send(Outbound::Close {
                code: close_code::GOING_AWAY,
                reason: "server shutdown".to_string(),
            });
            if entry.client.is_some() {
                if let Err(err) = self
                    .inner
                    .replication
                    .end_player_session(&entry.connection_id.to_string())
                    .await
                {
                    debug!(%err, connection_id = %entry.connection_id, "gateway: session close failed during shutdown");
                }
            }
        }
        let metrics = gateway_metrics();
        metrics.players_online.set(0);
        metrics.connections_open.set(0);
        info!(closed = removed.len(), "gateway: connections closed");
    }

    /// Full stop: close every connection, then the broker bridge.
    pub async fn shutdown(&self) {
        self.close_connections().await;
        self.inner.broker.shutdown().await;
    }
}

#[async_trait]
impl BrokerHandler for Gateway {
    async fn handle(&self, channel: &str, event: SyncEvent) {
        let Some(room) = room_for_channel(channel) else {
            debug!(channel, "gateway: inbound message on unmapped channel dropped");
            return;
        };
        let delivered = self.fan_out(&room, &event, None).await;

        if event.event_type == SyncEventType::RaidCompleted {
            if let Some(raid_id) = channel.strip_prefix("raid:") {
                self.schedule_raid_close(raid_id.to_string());
            }
        }
        debug!(channel, room = %room, delivered, event_type = event.event_type.as_str(), "gateway: inbound relay");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reasons_normalise() {
        assert_eq!(DisconnectReason::normalize("logout"), DisconnectReason::Logout);
        assert_eq!(DisconnectReason::normalize("client namespace disconnect"), DisconnectReason::Logout);
        assert_eq!(DisconnectReason::normalize("ping timeout"), DisconnectReason::Timeout);
        assert_eq!(DisconnectReason::normalize("Timeout"), DisconnectReason::Timeout);
        assert_eq!(DisconnectReason::normalize("transport close"), DisconnectReason::Disconnect);
        assert_eq!(DisconnectReason::normalize(""), DisconnectReason::Disconnect);
    }

    #[test]
    fn channels_map_to_rooms() {
        assert_eq!(room_for_channel("global").as_deref(), Some("global"));
        assert_eq!(room_for_channel("corporations").as_deref(), Some("global"));
        assert_eq!(room_for_channel("leaderboard").as_deref(), Some("global"));
        assert_eq!(room_for_channel("shard:eu-1").as_deref(), Some("shard:eu-1"));
        assert_eq!(room_for_channel("corp:c1").as_deref(), Some("corp:c1"));
        assert_eq!(room_for_channel("raid:r9").as_deref(), Some("raid:r9"));
        assert_eq!(room_for_channel("elsewhere"), None);
    }
}
