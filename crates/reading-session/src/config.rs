use std::time::Duration;

use serde::Deserialize;

use crate::model::DEFAULT_DECK_ID;

/// Timing and naming knobs for the engine. All intervals are milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Recency window applied to row-change pushes.
    #[serde(default = "default_push_recent_window_ms")]
    pub push_recent_window_ms: u64,
    /// Recency window applied to the periodic full resync.
    #[serde(default = "default_resync_recent_window_ms")]
    pub resync_recent_window_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_presence_interval_ms")]
    pub presence_interval_ms: u64,
    #[serde(default = "default_expiry_check_interval_ms")]
    pub expiry_check_interval_ms: u64,
    #[serde(default = "default_participant_stale_after_ms")]
    pub participant_stale_after_ms: u64,
    #[serde(default = "default_deck_id")]
    pub default_deck_id: String,
    #[serde(default)]
    pub tables: TableNames,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableNames {
    #[serde(default = "default_sessions_table")]
    pub sessions: String,
    #[serde(default = "default_participants_table")]
    pub participants: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            sessions: default_sessions_table(),
            participants: default_participants_table(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_recent_window_ms: default_push_recent_window_ms(),
            resync_recent_window_ms: default_resync_recent_window_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            presence_interval_ms: default_presence_interval_ms(),
            expiry_check_interval_ms: default_expiry_check_interval_ms(),
            participant_stale_after_ms: default_participant_stale_after_ms(),
            default_deck_id: default_deck_id(),
            tables: TableNames::default(),
        }
    }
}

impl SyncConfig {
    pub fn push_recent_window(&self) -> Duration {
        Duration::from_millis(self.push_recent_window_ms)
    }

    pub fn resync_recent_window(&self) -> Duration {
        Duration::from_millis(self.resync_recent_window_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms.max(1))
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn participant_stale_after(&self) -> Duration {
        Duration::from_millis(self.participant_stale_after_ms)
    }
}

fn default_push_recent_window_ms() -> u64 {
    2_000
}

fn default_resync_recent_window_ms() -> u64 {
    10_000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_presence_interval_ms() -> u64 {
    30_000
}

fn default_expiry_check_interval_ms() -> u64 {
    300_000
}

fn default_participant_stale_after_ms() -> u64 {
    3_600_000
}

fn default_deck_id() -> String {
    DEFAULT_DECK_ID.to_string()
}

fn default_sessions_table() -> String {
    "reading_sessions".to_string()
}

fn default_participants_table() -> String {
    "reading_session_participants".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SyncConfig =
            serde_json::from_value(json!({"sync_interval_ms": 5000, "tables": {}})).unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.push_recent_window(), Duration::from_secs(2));
        assert_eq!(config.resync_recent_window(), Duration::from_secs(10));
        assert_eq!(config.participant_stale_after(), Duration::from_secs(3600));
        assert_eq!(config.default_deck_id, DEFAULT_DECK_ID);
        assert_eq!(config.tables.sessions, "reading_sessions");
    }
}
