use std::path::PathBuf;

use reading_session::{CallConfig, SyncConfig, TableNames};
use serde::Deserialize;

/// Settings read from `READING_*` environment variables. Nested sections use
/// `__`, e.g. `READING_SYNC__SYNC_INTERVAL_MS`.
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub anonymous_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    /// Comma separated ICE server urls.
    #[serde(default)]
    pub ice_servers: Option<String>,
    #[serde(default)]
    pub sessions_table: Option<String>,
    #[serde(default)]
    pub participants_table: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("READING")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.supabase_url = Self::normalize_opt(self.supabase_url.take());
        self.supabase_anon_key = Self::normalize_opt(self.supabase_anon_key.take());
        self.access_token = Self::normalize_opt(self.access_token.take());
        self.user_id = Self::normalize_opt(self.user_id.take());
        self.anonymous_id = Self::normalize_opt(self.anonymous_id.take());
        self.display_name = Self::normalize_opt(self.display_name.take());
        self.data_dir = Self::normalize_opt(self.data_dir.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.ice_servers = Self::normalize_opt(self.ice_servers.take());
        self.sessions_table = Self::normalize_opt(self.sessions_table.take());
        self.participants_table = Self::normalize_opt(self.participants_table.take());
        if let Some(sessions) = self.sessions_table.clone() {
            self.sync.tables.sessions = sessions;
        }
        if let Some(participants) = self.participants_table.clone() {
            self.sync.tables.participants = participants;
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn tables(&self) -> TableNames {
        self.sync.tables.clone()
    }

    pub fn call(&self) -> CallConfig {
        match &self.ice_servers {
            Some(list) => CallConfig {
                ice_servers: list
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            None => CallConfig::default(),
        }
    }

    /// `data_dir`, else the platform data directory for the app.
    pub fn data_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Some(PathBuf::from(dir));
        }
        directories::ProjectDirs::from("", "", "reading-sync")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_normalise_to_none() {
        let config = AppConfig {
            supabase_url: Some("  https://x.supabase.co ".into()),
            access_token: Some("   ".into()),
            participants_table: Some("guests".into()),
            ..AppConfig::default()
        }
        .normalize();
        assert_eq!(config.supabase_url.as_deref(), Some("https://x.supabase.co"));
        assert_eq!(config.access_token, None);
        assert_eq!(config.tables().participants, "guests");
        assert_eq!(config.tables().sessions, "reading_sessions");
    }

    #[test]
    fn ice_server_list_is_split() {
        let config = AppConfig {
            ice_servers: Some("stun:a:3478, turn:b:3478,".into()),
            ..AppConfig::default()
        };
        assert_eq!(
            config.call().ice_servers,
            vec!["stun:a:3478".to_string(), "turn:b:3478".to_string()]
        );
        assert_eq!(
            AppConfig::default().call().ice_servers,
            CallConfig::default().ice_servers
        );
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = AppConfig {
            data_dir: Some("/tmp/readings".into()),
            ..AppConfig::default()
        };
        assert_eq!(config.data_dir(), Some(PathBuf::from("/tmp/readings")));
    }
}
