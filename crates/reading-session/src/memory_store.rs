//! In-process row store with simulated row-level security.
//!
//! Mirrors what the hosted store enforces closely enough to exercise the
//! engine's fallbacks: non-host session writes are denied, participants may
//! only write their own rows, and the whole store can be taken offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use realtime_bus::{LocalBus, RowChange, RowChangeKind};
use serde_json::Value;

use crate::config::TableNames;
use crate::error::StoreError;
use crate::identity::{IdentityKey, IdentityProvider};
use crate::model::{Participant, ParticipantRole, SessionRecord};
use crate::patch::SessionPatch;
use crate::row_store::{ParticipantPatch, RowStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct RlsPolicy {
    /// Let any caller update sessions whose `host_user_id` is null.
    pub allow_anonymous_host_writes: bool,
}

#[derive(Default)]
struct Db {
    sessions: HashMap<String, SessionRecord>,
    participants: Vec<Participant>,
}

pub struct InMemoryRowStore {
    db: Mutex<Db>,
    online: AtomicBool,
    policy: RwLock<RlsPolicy>,
    bus: Option<LocalBus>,
    tables: TableNames,
}

impl InMemoryRowStore {
    pub fn new() -> Arc<Self> {
        Self::build(None, TableNames::default())
    }

    /// Store that announces every write on `bus`, like database change feeds.
    pub fn with_bus(bus: LocalBus, tables: TableNames) -> Arc<Self> {
        Self::build(Some(bus), tables)
    }

    fn build(bus: Option<LocalBus>, tables: TableNames) -> Arc<Self> {
        Arc::new(Self {
            db: Mutex::new(Db::default()),
            online: AtomicBool::new(true),
            policy: RwLock::new(RlsPolicy::default()),
            bus,
            tables,
        })
    }

    /// A connection acting as whoever `identity` currently reports.
    pub fn client(self: &Arc<Self>, identity: Arc<dyn IdentityProvider>) -> Arc<RowStoreClient> {
        Arc::new(RowStoreClient {
            store: Arc::clone(self),
            identity,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_policy(&self, policy: RlsPolicy) {
        *self.policy.write() = policy;
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.db.lock().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.db.lock().sessions.len()
    }

    pub fn participants(&self, session_id: &str) -> Vec<Participant> {
        self.db
            .lock()
            .participants
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Network("row store offline".into()))
        }
    }

    fn publish(&self, table: &str, kind: RowChangeKind, record: Value) {
        if let Some(bus) = &self.bus {
            bus.publish_row_change(RowChange {
                table: table.to_string(),
                kind,
                record,
                old_record: Value::Null,
            });
        }
    }
}

pub struct RowStoreClient {
    store: Arc<InMemoryRowStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl RowStoreClient {
    fn caller_user_id(&self) -> Option<String> {
        self.identity
            .current()
            .and_then(|identity| identity.user_id().map(str::to_string))
    }
}

fn denied(what: &str) -> StoreError {
    StoreError::WriteDenied(format!("new row violates row-level security policy for {what}"))
}

#[async_trait]
impl RowStore for RowStoreClient {
    async fn insert_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        self.store.check_online()?;
        if record.host_user_id.is_some() && record.host_user_id != self.caller_user_id() {
            return Err(denied("reading session"));
        }
        {
            let mut db = self.store.db.lock();
            if db.sessions.contains_key(&record.id) {
                return Err(StoreError::Conflict(format!("session {} exists", record.id)));
            }
            db.sessions.insert(record.id.clone(), record.clone());
        }
        self.store.publish(
            &self.store.tables.sessions,
            RowChangeKind::Insert,
            serde_json::to_value(record)?,
        );
        Ok(record.clone())
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.store.check_online()?;
        Ok(self.store.session(session_id))
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        self.store.check_online()?;
        let caller = self.caller_user_id();
        let policy = *self.store.policy.read();
        let updated = {
            let mut db = self.store.db.lock();
            let claims_host = match (&caller, &patch.host_user_id) {
                (Some(uid), Some(Some(claimed))) if uid == claimed => {
                    db.participants.iter().any(|p| {
                        p.session_id == session_id
                            && p.is_active
                            && p.role == ParticipantRole::Host
                            && p.user_id.as_deref() == Some(uid.as_str())
                    })
                }
                _ => false,
            };
            let Some(row) = db.sessions.get_mut(session_id) else {
                return Err(denied("reading session"));
            };
            let allowed = match &row.host_user_id {
                Some(owner) => caller.as_deref() == Some(owner.as_str()),
                None => policy.allow_anonymous_host_writes || claims_host,
            };
            if !allowed {
                return Err(denied("reading session"));
            }
            patch.apply_to(row);
            row.clone()
        };
        self.store.publish(
            &self.store.tables.sessions,
            RowChangeKind::Update,
            serde_json::to_value(&updated)?,
        );
        Ok(())
    }

    async fn find_participant(
        &self,
        session_id: &str,
        key: &IdentityKey,
    ) -> Result<Option<Participant>, StoreError> {
        self.store.check_online()?;
        let db = self.store.db.lock();
        Ok(db
            .participants
            .iter()
            .find(|p| {
                p.session_id == session_id
                    && p.is_active
                    && match key {
                        IdentityKey::UserId(id) => p.user_id.as_deref() == Some(id.as_str()),
                        IdentityKey::AnonymousId(id) => {
                            p.anonymous_id.as_deref() == Some(id.as_str())
                        }
                    }
            })
            .cloned())
    }

    async fn insert_participant(
        &self,
        participant: &Participant,
    ) -> Result<Participant, StoreError> {
        self.store.check_online()?;
        if participant.user_id.is_some() && participant.user_id != self.caller_user_id() {
            return Err(denied("reading session participant"));
        }
        {
            let mut db = self.store.db.lock();
            if db.participants.iter().any(|p| p.id == participant.id) {
                return Err(StoreError::Conflict(format!(
                    "participant {} exists",
                    participant.id
                )));
            }
            db.participants.push(participant.clone());
        }
        self.store.publish(
            &self.store.tables.participants,
            RowChangeKind::Insert,
            serde_json::to_value(participant)?,
        );
        Ok(participant.clone())
    }

    async fn update_participant(
        &self,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> Result<(), StoreError> {
        self.store.check_online()?;
        let caller = self.caller_user_id();
        let updated = {
            let mut db = self.store.db.lock();
            let Some(row) = db.participants.iter_mut().find(|p| p.id == participant_id) else {
                return Err(denied("reading session participant"));
            };
            let owns_row = match &row.user_id {
                None => true,
                Some(owner) => caller.as_deref() == Some(owner.as_str()),
            };
            let claims_row = matches!(
                (&patch.user_id, &caller),
                (Some(Some(claimed)), Some(uid)) if claimed == uid
            );
            if !(owns_row || claims_row) {
                return Err(denied("reading session participant"));
            }
            patch.apply_to(row);
            row.clone()
        };
        self.store.publish(
            &self.store.tables.participants,
            RowChangeKind::Update,
            serde_json::to_value(&updated)?,
        );
        Ok(())
    }

    async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError> {
        self.store.check_online()?;
        let mut list = self.store.participants(session_id);
        list.sort_by_key(|p| p.joined_at);
        Ok(list)
    }
}
