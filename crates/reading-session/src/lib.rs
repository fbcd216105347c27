//! Live sync engine for shared tarot-reading sessions.
//!
//! A [`SessionEngine`] keeps one session record consistent between a host
//! that writes the row directly, guests that relay mutations over the
//! session's realtime channel, and clients running offline from local
//! storage. The same channel carries presence and full-mesh call signaling.

pub mod call;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod local_store;
pub mod memory_store;
pub mod model;
pub mod participants;
pub mod patch;
pub mod postgrest;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod row_store;

pub use call::{CallConfig, CallCoordinator, CallEvent, LinkState, MediaBackend, WebRtcMedia};
pub use config::{SyncConfig, TableNames};
pub use engine::{AccessMethod, EngineDeps, SessionEngine, SessionMode, SyncReport};
pub use error::{LocalStoreError, SessionError, StoreError};
pub use events::SessionEvent;
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use local_store::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use memory_store::{InMemoryRowStore, RlsPolicy};
pub use model::{
    Card, Participant, ParticipantRole, ReadingStep, SelectedCard, SessionRecord, VideoCallState,
    DEFAULT_DECK_ID,
};
pub use patch::SessionPatch;
pub use postgrest::PostgrestRowStore;
pub use reconcile::{reconcile, GuardedField, Reconciled};
pub use row_store::RowStore;
