use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::identity::{Identity, IdentityKey};
use crate::model::{Participant, ParticipantRole};
use crate::row_store::{ParticipantPatch, RowStore};

/// Finds or creates the participant row for an identity, so reconnecting
/// never produces a second active row.
#[derive(Clone)]
pub struct ParticipantResolver {
    rows: Arc<dyn RowStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryVerdict {
    Alive,
    NoActiveParticipants,
    AllStale,
}

impl ExpiryVerdict {
    pub fn should_expire(self) -> bool {
        !matches!(self, ExpiryVerdict::Alive)
    }
}

impl ParticipantResolver {
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self { rows }
    }

    pub async fn lookup(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<Option<Participant>, StoreError> {
        self.rows.find_participant(session_id, &identity.key()).await
    }

    /// Reuses the identity's active row (refreshing `last_seen_at`) or inserts one.
    pub async fn resolve(
        &self,
        session_id: &str,
        identity: &Identity,
        name: &str,
        role: ParticipantRole,
    ) -> Result<Participant, StoreError> {
        let now = Utc::now();
        if let Some(mut existing) = self.lookup(session_id, identity).await? {
            let patch = ParticipantPatch::seen(now);
            self.rows.update_participant(&existing.id, &patch).await?;
            patch.apply_to(&mut existing);
            debug!(
                target = "reading_session::store",
                session_id,
                participant_id = %existing.id,
                "reusing participant row"
            );
            return Ok(existing);
        }

        let participant = Participant {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: identity.user_id().map(str::to_string),
            anonymous_id: identity.anonymous_id().map(str::to_string),
            name: name.to_string(),
            role,
            is_active: true,
            joined_at: now,
            last_seen_at: now,
        };
        let inserted = self.rows.insert_participant(&participant).await?;
        debug!(
            target = "reading_session::store",
            session_id,
            participant_id = %inserted.id,
            role = ?inserted.role,
            "inserted participant row"
        );
        Ok(inserted)
    }

    pub async fn touch(&self, participant_id: &str) -> Result<(), StoreError> {
        self.rows
            .update_participant(participant_id, &ParticipantPatch::seen(Utc::now()))
            .await
    }

    pub async fn leave(&self, participant_id: &str) -> Result<(), StoreError> {
        self.rows
            .update_participant(participant_id, &ParticipantPatch::inactive(Utc::now()))
            .await
    }

    /// Moves an anonymous participant onto `user_id` in place. If the account
    /// already has its own row in this session, that row is kept and the
    /// anonymous one is retired instead.
    pub async fn upgrade(
        &self,
        participant: &Participant,
        user_id: &str,
    ) -> Result<Participant, StoreError> {
        if participant.user_id.as_deref() == Some(user_id) {
            return Ok(participant.clone());
        }
        let key = IdentityKey::UserId(user_id.to_string());
        if let Some(existing) = self.rows.find_participant(&participant.session_id, &key).await? {
            if existing.id != participant.id {
                self.leave(&participant.id).await?;
                return Ok(existing);
            }
        }

        let patch = ParticipantPatch {
            user_id: Some(Some(user_id.to_string())),
            anonymous_id: Some(None),
            last_seen_at: Some(Utc::now()),
            ..ParticipantPatch::default()
        };
        self.rows.update_participant(&participant.id, &patch).await?;
        let mut upgraded = participant.clone();
        patch.apply_to(&mut upgraded);
        Ok(upgraded)
    }

    pub async fn expiry_verdict(
        &self,
        session_id: &str,
        stale_after: Duration,
    ) -> Result<ExpiryVerdict, StoreError> {
        let participants = self.rows.list_participants(session_id).await?;
        Ok(expiry_verdict(&participants, Utc::now(), stale_after))
    }
}

/// A session expires when it has no active participants or every active
/// participant has been silent longer than `stale_after`.
pub fn expiry_verdict(
    participants: &[Participant],
    now: DateTime<Utc>,
    stale_after: Duration,
) -> ExpiryVerdict {
    let mut active = participants.iter().filter(|p| p.is_active).peekable();
    if active.peek().is_none() {
        return ExpiryVerdict::NoActiveParticipants;
    }
    let is_stale = |p: &Participant| {
        now.signed_duration_since(p.last_seen_at)
            .to_std()
            .map(|age| age > stale_after)
            .unwrap_or(false)
    };
    if active.all(is_stale) {
        ExpiryVerdict::AllStale
    } else {
        ExpiryVerdict::Alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str, seen_mins_ago: i64, active: bool) -> Participant {
        let now = Utc::now();
        Participant {
            id: id.into(),
            session_id: "s".into(),
            user_id: None,
            anonymous_id: Some(format!("anon-{id}")),
            name: id.into(),
            role: ParticipantRole::Participant,
            is_active: active,
            joined_at: now,
            last_seen_at: now - chrono::Duration::minutes(seen_mins_ago),
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn empty_session_expires_immediately() {
        assert_eq!(
            expiry_verdict(&[], Utc::now(), HOUR),
            ExpiryVerdict::NoActiveParticipants
        );
        let gone = [participant("a", 0, false)];
        assert_eq!(
            expiry_verdict(&gone, Utc::now(), HOUR),
            ExpiryVerdict::NoActiveParticipants
        );
    }

    #[test]
    fn one_recent_participant_keeps_session_alive() {
        let list = [participant("a", 120, true), participant("b", 5, true)];
        assert_eq!(expiry_verdict(&list, Utc::now(), HOUR), ExpiryVerdict::Alive);
    }

    #[test]
    fn all_stale_participants_expire_session() {
        let list = [participant("a", 120, true), participant("b", 61, true)];
        let verdict = expiry_verdict(&list, Utc::now(), HOUR);
        assert_eq!(verdict, ExpiryVerdict::AllStale);
        assert!(verdict.should_expire());
    }
}
