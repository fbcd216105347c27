use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::LocalStoreError;
use crate::local_store::LocalStore;

pub const FINGERPRINT_KEY: &str = "tarot_browser_fingerprint";

/// Who the current client is, most to least durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Authenticated account.
    User(String),
    /// Anonymous auth session id.
    Anonymous(String),
    /// Persistent per-install id for clients with no auth session at all.
    Fingerprint(String),
}

/// Column/value pair a participant row is looked up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKey {
    UserId(String),
    AnonymousId(String),
}

impl IdentityKey {
    pub fn column(&self) -> &'static str {
        match self {
            IdentityKey::UserId(_) => "user_id",
            IdentityKey::AnonymousId(_) => "anonymous_id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            IdentityKey::UserId(v) | IdentityKey::AnonymousId(v) => v,
        }
    }
}

impl Identity {
    pub fn key(&self) -> IdentityKey {
        match self {
            Identity::User(id) => IdentityKey::UserId(id.clone()),
            Identity::Anonymous(id) | Identity::Fingerprint(id) => {
                IdentityKey::AnonymousId(id.clone())
            }
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User(id) => Some(id),
            _ => None,
        }
    }

    pub fn anonymous_id(&self) -> Option<&str> {
        match self {
            Identity::Anonymous(id) | Identity::Fingerprint(id) => Some(id),
            Identity::User(_) => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_))
    }
}

/// Source of the caller's auth state.
pub trait IdentityProvider: Send + Sync {
    /// `None` when there is no auth session (not even an anonymous one).
    fn current(&self) -> Option<Identity>;

    fn display_name(&self) -> Option<String>;
}

/// Identity held in memory, switchable at runtime by a sign-in.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    state: RwLock<(Option<Identity>, Option<String>)>,
}

impl StaticIdentity {
    pub fn new(identity: Option<Identity>, display_name: Option<String>) -> Self {
        Self {
            state: RwLock::new((identity, display_name)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>, display_name: Option<String>) {
        let mut state = self.state.write();
        state.0 = Some(Identity::User(user_id.into()));
        if display_name.is_some() {
            state.1 = display_name;
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<Identity> {
        self.state.read().0.clone()
    }

    fn display_name(&self) -> Option<String> {
        self.state.read().1.clone()
    }
}

/// Returns the stored install fingerprint, creating it on first use.
pub fn browser_fingerprint(local: &dyn LocalStore) -> Result<String, LocalStoreError> {
    if let Some(existing) = local.get(FINGERPRINT_KEY)? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let fingerprint = Uuid::new_v4().to_string();
    local.set(FINGERPRINT_KEY, &fingerprint)?;
    Ok(fingerprint)
}

pub fn resolve_identity(
    provider: &dyn IdentityProvider,
    local: &dyn LocalStore,
) -> Result<Identity, LocalStoreError> {
    match provider.current() {
        Some(identity) => Ok(identity),
        None => browser_fingerprint(local).map(Identity::Fingerprint),
    }
}
