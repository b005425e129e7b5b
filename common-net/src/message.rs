use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Canonical event kinds carried in a [`SyncEvent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventType {
    PlayerJoin,
    PlayerLeave,
    PlayerUpdate,
    ChatGlobal,
    ChatMessage,
    CorpAction,
    RaidParticipantJoined,
    RaidHackAttempt,
    RaidProgressUpdate,
    RaidDamage,
    RaidLootDrop,
    RaidCompleted,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerJoin => "PLAYER_JOIN",
            Self::PlayerLeave => "PLAYER_LEAVE",
            Self::PlayerUpdate => "PLAYER_UPDATE",
            Self::ChatGlobal => "CHAT_GLOBAL",
            Self::ChatMessage => "CHAT_MESSAGE",
            Self::CorpAction => "CORP_ACTION",
            Self::RaidParticipantJoined => "RAID_PARTICIPANT_JOINED",
            Self::RaidHackAttempt => "RAID_HACK_ATTEMPT",
            Self::RaidProgressUpdate => "RAID_PROGRESS_UPDATE",
            Self::RaidDamage => "RAID_DAMAGE",
            Self::RaidLootDrop => "RAID_LOOT_DROP",
            Self::RaidCompleted => "RAID_COMPLETED",
        }
    }
}

/// Immutable envelope used for local fan-out and broker relay alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub payload: Value,
    /// Epoch milliseconds at the emitting node.
    pub timestamp: i64,
    pub sender_id: String,
    pub shard_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_shard_id: Option<String>,
    pub event_id: String,
}

impl SyncEvent {
    pub fn new(
        event_type: SyncEventType,
        payload: Value,
        sender_id: impl Into<String>,
        shard_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type,
            payload,
            timestamp,
            sender_id: sender_id.into(),
            shard_id: shard_id.into(),
            target_shard_id: None,
            event_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_target_shard(mut self, shard_id: impl Into<String>) -> Self {
        self.target_shard_id = Some(shard_id.into());
        self
    }
}

/// Raw `{event, data}` frame as it travels over the client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event kind '{0}'")]
    UnknownEvent(String),
    #[error("invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },
}

impl ProtocolError {
    fn invalid(event: &str, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            event: event.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub player_id: String,
    #[serde(default)]
    pub player_name: String,
    pub shard_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub corp_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatChannel {
    Global,
    Shard,
    Corp,
    Private,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub channel: ChatChannel,
    pub content: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub corp_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerUpdateRequest {
    pub updates: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSyncRequest {
    #[serde(rename = "type", default = "default_sync_type")]
    pub sync_type: String,
}

fn default_sync_type() -> String {
    "shard".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpActionRequest {
    pub action: String,
    pub corp_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub timestamp: i64,
}

/// Raid commands carry a raid id plus an opaque body relayed as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidRequest {
    pub raid_id: String,
    #[serde(flatten)]
    pub body: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidPhase {
    Join,
    HackAttempt,
    Progress,
    Damage,
    LootDrop,
    Complete,
}

impl RaidPhase {
    pub fn event_type(&self) -> SyncEventType {
        match self {
            Self::Join => SyncEventType::RaidParticipantJoined,
            Self::HackAttempt => SyncEventType::RaidHackAttempt,
            Self::Progress => SyncEventType::RaidProgressUpdate,
            Self::Damage => SyncEventType::RaidDamage,
            Self::LootDrop => SyncEventType::RaidLootDrop,
            Self::Complete => SyncEventType::RaidCompleted,
        }
    }
}

/// Client → gateway commands.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Auth(AuthRequest),
    Chat(ChatRequest),
    PlayerUpdate(PlayerUpdateRequest),
    StateSync(StateSyncRequest),
    CorpAction(CorpActionRequest),
    Ping(PingRequest),
    Raid(RaidPhase, RaidRequest),
}

impl ClientCommand {
    /// Event names the gateway understands.
    pub const AUTH: &'static str = "auth";

    pub fn parse(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame { event, data } = frame;
        let command = match event.as_str() {
            "auth" => Self::Auth(payload(&event, data)?),
            "chat:message" => Self::Chat(payload(&event, data)?),
            "player:update" => Self::PlayerUpdate(payload(&event, data)?),
            "state:sync" => Self::StateSync(payload(&event, data)?),
            "corp:action" => Self::CorpAction(payload(&event, data)?),
            "ping" => Self::Ping(payload(&event, data)?),
            "raid:join" => Self::Raid(RaidPhase::Join, payload(&event, data)?),
            "raid:hack-attempt" => Self::Raid(RaidPhase::HackAttempt, payload(&event, data)?),
            "raid:progress" => Self::Raid(RaidPhase::Progress, payload(&event, data)?),
            "raid:damage" => Self::Raid(RaidPhase::Damage, payload(&event, data)?),
            "raid:loot-drop" => Self::Raid(RaidPhase::LootDrop, payload(&event, data)?),
            "raid:complete" => Self::Raid(RaidPhase::Complete, payload(&event, data)?),
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(command)
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    // `ping` and `state:sync` may legitimately arrive without a body.
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|err| ProtocolError::invalid(event, err))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DuplicateSession,
    NotAuthenticated,
    ServerShutdown,
    InvalidPayload,
    AlreadyAuthenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub player_id: String,
    pub player_name: String,
    pub shard_id: String,
    pub connected_at: i64,
}

/// Gateway → client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "auth:success", rename_all = "camelCase")]
    AuthSuccess {
        connection_id: String,
        shard_id: String,
        server_time: i64,
        online_count: usize,
    },
    #[serde(rename = "sync:event")]
    SyncEvent(SyncEvent),
    #[serde(rename = "state:sync:response", rename_all = "camelCase")]
    StateSyncResponse {
        #[serde(rename = "type")]
        sync_type: String,
        shard_id: String,
        players: Vec<PlayerSummary>,
        online_count: usize,
        server_time: i64,
    },
    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong {
        client_timestamp: i64,
        server_timestamp: i64,
    },
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Gateway stats as surfaced on the operational endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub online_count: usize,
    pub shard_counts: BTreeMap<String, usize>,
}

pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
