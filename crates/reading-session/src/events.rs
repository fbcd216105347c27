use crate::call::CallEvent;
use crate::model::{Participant, SessionRecord};
use crate::protocol::PresenceMeta;

/// Notifications for whoever renders the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// In-memory snapshot changed (local edit, relayed action or remote push).
    Updated(SessionRecord),
    ParticipantsChanged(Vec<Participant>),
    PresenceChanged(Vec<PresenceMeta>),
    /// A local session was written to the row store under a new id.
    Migrated { from: String, to: String },
    /// The row store could not be reached; working from local state.
    Offline,
    /// The session was marked inactive.
    Ended,
    Call(CallEvent),
}
