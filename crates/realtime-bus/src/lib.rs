//! Realtime publish/subscribe transport used by reading-session clients.
//!
//! A channel multiplexes three kinds of traffic for one topic:
//! - ephemeral broadcasts between members
//! - presence (who is connected, with a small metadata blob per member)
//! - row-change notifications pushed by the row store
//!
//! `LocalBus` is an in-process hub for tests and single-process wiring;
//! `phoenix::PhoenixRealtime` speaks the Supabase Realtime websocket protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;
pub mod phoenix;

pub use local::LocalBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("channel closed")]
    Closed,
    #[error("channel {0} is not joined")]
    NotJoined(String),
    #[error("channel join rejected: {0}")]
    JoinRejected(String),
    #[error("realtime transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowChangeKind {
    Insert,
    Update,
    Delete,
}

impl RowChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RowChangeKind::Insert => "INSERT",
            RowChangeKind::Update => "UPDATE",
            RowChangeKind::Delete => "DELETE",
        }
    }
}

/// Server-side filter for row-change notifications: `kind` events on `table`
/// where `column = value`. A `kind` of `None` subscribes to every event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub table: String,
    pub kind: Option<RowChangeKind>,
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn updates(table: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: Some(RowChangeKind::Update),
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn all(table: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: None,
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table {
            return false;
        }
        if let Some(kind) = self.kind {
            if kind != change.kind {
                return false;
            }
        }
        let record = if change.kind == RowChangeKind::Delete {
            &change.old_record
        } else {
            &change.record
        };
        record
            .get(&self.column)
            .and_then(Value::as_str)
            .map(|v| v == self.value)
            .unwrap_or(false)
    }

    /// PostgREST-style filter expression, e.g. `id=eq.abc`.
    pub fn expression(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub kind: RowChangeKind,
    pub record: Value,
    pub old_record: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub key: String,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast { event: String, payload: Value },
    /// Full presence state, delivered once right after joining.
    PresenceSync(Vec<PresenceEntry>),
    /// A member started tracking or replaced its metadata.
    PresenceJoin(PresenceEntry),
    PresenceLeave(PresenceEntry),
    RowChange(RowChange),
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub presence_key: Option<String>,
    pub row_filters: Vec<RowFilter>,
    pub receive_own_broadcasts: bool,
}

/// One client's membership in a topic.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Event stream for this membership. Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn broadcast(&self, event: &str, payload: Value) -> BusResult<()>;

    async fn track(&self, meta: Value) -> BusResult<()>;

    async fn untrack(&self) -> BusResult<()>;

    fn presence(&self) -> Vec<PresenceEntry>;

    /// Leaves the topic. Calling it more than once is a no-op.
    async fn unsubscribe(&self) -> BusResult<()>;
}

#[async_trait]
pub trait Realtime: Send + Sync {
    async fn channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> BusResult<Arc<dyn RealtimeChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(kind: RowChangeKind, record: Value) -> RowChange {
        RowChange {
            table: "reading_sessions".into(),
            kind,
            record,
            old_record: Value::Null,
        }
    }

    #[test]
    fn update_filter_matches_only_its_row() {
        let filter = RowFilter::updates("reading_sessions", "id", "s-1");
        assert!(filter.matches(&change(RowChangeKind::Update, json!({"id": "s-1"}))));
        assert!(!filter.matches(&change(RowChangeKind::Update, json!({"id": "s-2"}))));
        assert!(!filter.matches(&change(RowChangeKind::Insert, json!({"id": "s-1"}))));
    }

    #[test]
    fn wildcard_filter_accepts_every_kind() {
        let filter = RowFilter::all("reading_sessions", "id", "s-1");
        assert!(filter.matches(&change(RowChangeKind::Insert, json!({"id": "s-1"}))));
        let mut deleted = change(RowChangeKind::Delete, Value::Null);
        deleted.old_record = json!({"id": "s-1"});
        assert!(filter.matches(&deleted));
        assert_eq!(filter.expression(), "id=eq.s-1");
    }
}
