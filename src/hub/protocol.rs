//! WebSocket frame shapes, both directions.

use serde::{Deserialize, Serialize};

use crate::model::LogMessage;

pub const ERR_INVALID_SUBSCRIPTION: &str = "invalid_subscription";
pub const ERR_FILTER: &str = "filter_error";
pub const ERR_UNKNOWN_ACTION: &str = "unknown_action";

/// Client to server: `{"action": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Server to client: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Log(LogMessage),
    Batch(BatchMessage),
    Ack { message: String },
    Pong { timestamp: i64 },
    Stats(StatsFrame),
    Error { code: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMessage {
    pub messages: Vec<LogMessage>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsFrame {
    /// Currently connected sessions.
    pub connected: usize,
    /// Session cap.
    pub total_clients: usize,
    /// Messages waiting in this session's outbound queue.
    pub queued: usize,
    /// Messages this session dropped (rate limit + queue overflow).
    pub dropped: u64,
}
