//! Wire protocol and shared data model
//!
//! Every payload on the bus is JSON: changes on `/change/<peer>` and info
//! envelopes on `/info` and `/info/<peer>`.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row as carried on the wire: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Broadcast topic for presence and feedback traffic.
pub const INFO_TOPIC: &str = "/info";

pub fn now_millis() -> EpochMillis {
    chrono::Utc::now().timestamp_millis() as EpochMillis
}

/// Point-to-point change topic for a peer.
pub fn change_topic(peer: &str) -> String {
    format!("/change/{peer}")
}

/// Point-to-point info topic for a peer.
pub fn info_topic(peer: &str) -> String {
    format!("/info/{peer}")
}

/// Key of a `sync_status` row: md5 of `<table>-<id>-<remote>`, lowercase hex.
pub fn status_id(table: &str, id: &str, remote: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(table.as_bytes());
    hasher.update(b"-");
    hasher.update(id.as_bytes());
    hasher.update(b"-");
    hasher.update(remote.as_bytes());
    hex::encode(hasher.finalize())
}

/// A captured row mutation. `entity = None` denotes a delete; otherwise `id`
/// equals the string form of the entity's primary-key value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub sender: String,
    pub table: String,
    pub id: String,
    pub date: EpochMillis,
    pub entity: Option<Row>,
}

/// Envelope for `/info` and `/info/<peer>` traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub sender: String,
    pub message: InfoKind,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKind {
    Connected,
    ConnectionLost,
    DataReceived,
    Error,
}

/// Args of a `connected` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedArgs {
    pub until: EpochMillis,
}

/// Args of `data_received` and `error` feedback. All fields except `message`
/// are required on reception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackArgs {
    pub table: String,
    pub id: String,
    pub date: EpochMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Replication outcome persisted in `sync_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Successful,
    Pending,
    Error,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Successful => "successful",
            SyncOutcome::Pending => "pending",
            SyncOutcome::Error => "error",
        }
    }
}

/// A status report for one (table, id) as seen by one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub sender: String,
    pub table: String,
    pub id: String,
    pub date: EpochMillis,
    pub status: SyncOutcome,
    pub message: Option<String>,
}

/// Payload of `local-save-successful`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub sender: String,
    pub table: String,
    pub id: String,
    pub date: EpochMillis,
}

/// Payload of `local-save-failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeError {
    pub sender: String,
    pub table: String,
    pub id: String,
    pub date: EpochMillis,
    pub message: String,
}
