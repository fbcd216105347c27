use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::IdentityKey;
use crate::model::{Participant, SessionRecord};
use crate::patch::SessionPatch;

/// Remote row store holding session and participant rows. The only component
/// that persists anything.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn insert_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError>;

    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn update_session(&self, session_id: &str, patch: &SessionPatch)
        -> Result<(), StoreError>;

    /// Active participant row of `session_id` matching `key`, if any.
    async fn find_participant(
        &self,
        session_id: &str,
        key: &IdentityKey,
    ) -> Result<Option<Participant>, StoreError>;

    async fn insert_participant(&self, participant: &Participant)
        -> Result<Participant, StoreError>;

    async fn update_participant(
        &self,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> Result<(), StoreError>;

    async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParticipantPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl ParticipantPatch {
    pub fn seen(now: DateTime<Utc>) -> Self {
        Self {
            last_seen_at: Some(now),
            ..Self::default()
        }
    }

    pub fn inactive(now: DateTime<Utc>) -> Self {
        Self {
            is_active: Some(false),
            last_seen_at: Some(now),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, participant: &mut Participant) {
        if let Some(user_id) = &self.user_id {
            participant.user_id = user_id.clone();
        }
        if let Some(anonymous_id) = &self.anonymous_id {
            participant.anonymous_id = anonymous_id.clone();
        }
        if let Some(name) = &self.name {
            participant.name = name.clone();
        }
        if let Some(is_active) = self.is_active {
            participant.is_active = is_active;
        }
        if let Some(last_seen_at) = self.last_seen_at {
            participant.last_seen_at = last_seen_at;
        }
    }
}
