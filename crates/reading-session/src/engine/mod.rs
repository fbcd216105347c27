//! The session engine: one constructed handle owning a session's in-memory
//! snapshot, its realtime channel, background timers and call coordinator.
//!
//! Every user action applies optimistically to memory first. Persistence then
//! depends on the mode: local sessions write to [`LocalStore`], hosts write
//! the row, guests relay through the channel.

mod inbound;
mod sync;

pub use sync::SyncReport;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use realtime_bus::Realtime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallCoordinator, LinkState, MediaBackend};
use crate::channel::{ChannelHandler, SessionChannel};
use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::identity::{resolve_identity, Identity, IdentityProvider};
use crate::local_store::{load_session, save_session, LocalStore};
use crate::model::{
    is_local_id, new_local_session_id, new_session_id, Participant, ParticipantRole,
    SelectedCard, SessionRecord, VideoCallState,
};
use crate::participants::ParticipantResolver;
use crate::patch::SessionPatch;
use crate::protocol::{ActionEnvelope, ChannelMessage, PresenceMeta, SessionAction};
use crate::reconcile::{reconcile, GuardedField};
use crate::relay::card_selection_patch;
use crate::row_store::RowStore;

const EVENT_CAPACITY: usize = 256;

/// Collaborators an engine is wired to.
pub struct EngineDeps {
    pub rows: Arc<dyn RowStore>,
    pub realtime: Arc<dyn Realtime>,
    pub local: Arc<dyn LocalStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub media: Arc<dyn MediaBackend>,
    pub config: SyncConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Idle,
    /// `local_` session living only in [`LocalStore`].
    Local,
    Remote,
}

/// How the caller reached the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    Invite,
    Direct,
}

/// Host rights are asserted locally: the caller owns the row, already holds a
/// host participant row, or opened an anonymously hosted session directly.
pub fn has_host_rights(
    identity: &Identity,
    record: &SessionRecord,
    existing: Option<&Participant>,
    access: AccessMethod,
) -> bool {
    if let (Some(user_id), Some(host)) = (identity.user_id(), record.host_user_id.as_deref()) {
        if user_id == host {
            return true;
        }
    }
    if existing.map(Participant::is_host).unwrap_or(false) {
        return true;
    }
    access == AccessMethod::Direct && record.host_user_id.is_none()
}

struct EngineState {
    mode: SessionMode,
    record: Option<SessionRecord>,
    participant: Option<Participant>,
    /// False when the participant row could not be written.
    participant_persisted: bool,
    is_host: bool,
    /// Remote session running from its cached snapshot.
    offline: bool,
    participants: Vec<Participant>,
    presence: Vec<PresenceMeta>,
    edits: FieldEdits,
    /// Host edits made while offline that the row has not seen yet.
    unsynced_edits: bool,
    last_expiry_check: Option<Instant>,
    ended: bool,
}

impl EngineState {
    fn idle() -> Self {
        Self {
            mode: SessionMode::Idle,
            record: None,
            participant: None,
            participant_persisted: false,
            is_host: false,
            offline: false,
            participants: Vec::new(),
            presence: Vec::new(),
            edits: FieldEdits::default(),
            unsynced_edits: false,
            last_expiry_check: None,
            ended: false,
        }
    }
}

/// When each guarded field was last edited on this client.
#[derive(Debug, Default)]
struct FieldEdits(HashMap<GuardedField, Instant>);

impl FieldEdits {
    fn record(&mut self, patch: &SessionPatch) {
        let now = Instant::now();
        for field in GuardedField::touched_by(patch) {
            self.0.insert(field, now);
        }
    }

    fn within(&self, window: Duration) -> Vec<GuardedField> {
        self.0
            .iter()
            .filter(|(_, at)| at.elapsed() < window)
            .map(|(field, _)| *field)
            .collect()
    }
}

pub(crate) struct EngineInner {
    rows: Arc<dyn RowStore>,
    realtime: Arc<dyn Realtime>,
    local: Arc<dyn LocalStore>,
    identity: Arc<dyn IdentityProvider>,
    resolver: ParticipantResolver,
    config: SyncConfig,
    state: RwLock<EngineState>,
    channel: Mutex<Option<Arc<SessionChannel>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
    call: CallCoordinator,
    sync_in_flight: AtomicBool,
}

/// Cheap, cloneable handle to one session engine.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let call = CallCoordinator::new(deps.media, events.clone());
        Self {
            inner: Arc::new(EngineInner {
                resolver: ParticipantResolver::new(Arc::clone(&deps.rows)),
                rows: deps.rows,
                realtime: deps.realtime,
                local: deps.local,
                identity: deps.identity,
                config: deps.config,
                state: RwLock::new(EngineState::idle()),
                channel: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                events,
                call,
                sync_in_flight: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Creates a session and returns its id. Never fails: when the row store
    /// is unreachable or refuses the insert, a `local_` session is created.
    pub async fn create(&self, deck_id: Option<&str>) -> String {
        self.cleanup().await;
        let inner = &self.inner;
        let deck = deck_id.unwrap_or(&inner.config.default_deck_id).to_string();
        let identity = inner.current_identity();
        let record = SessionRecord::new(
            new_session_id(),
            deck.as_str(),
            identity.user_id().map(str::to_string),
            Utc::now(),
        );

        let session_id = match inner.rows.insert_session(&record).await {
            Ok(stored) => {
                info!(
                    target = "reading_session::store",
                    session_id = %stored.id,
                    deck_id = %stored.deck_id,
                    "session created"
                );
                let (participant, persisted) = inner
                    .resolve_participant(&stored.id, &identity, ParticipantRole::Host)
                    .await;
                let id = stored.id.clone();
                inner.install(SessionMode::Remote, stored, participant, persisted, true);
                inner.attach_channel().await;
                id
            }
            Err(err) => {
                warn!(
                    target = "reading_session::store",
                    error = %err,
                    "remote create failed, starting local session"
                );
                inner.create_local(&deck, &identity)
            }
        };
        self.start_loops();
        session_id
    }

    /// Joins an existing session. `local_` ids are opened from local storage.
    pub async fn join(
        &self,
        session_id: &str,
        access: AccessMethod,
    ) -> Result<String, SessionError> {
        self.cleanup().await;
        let inner = &self.inner;
        let identity = inner.current_identity();

        if is_local_id(session_id) {
            let record = load_session(inner.local.as_ref(), session_id)?
                .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
            let participant = inner.ephemeral_participant(session_id, &identity, ParticipantRole::Host);
            inner.install(SessionMode::Local, record, participant, false, true);
            inner.emit(SessionEvent::Offline);
            self.start_loops();
            return Ok(session_id.to_string());
        }

        let (record, offline) = match inner.rows.fetch_session(session_id).await {
            Ok(Some(record)) if record.is_active => (record, false),
            Ok(_) => return Err(SessionError::SessionNotFound(session_id.to_string())),
            Err(err) if err.is_network() => match load_session(inner.local.as_ref(), session_id)? {
                Some(cached) if cached.is_active => {
                    warn!(
                        target = "reading_session::store",
                        session_id,
                        error = %err,
                        "row store unreachable, joining from cached snapshot"
                    );
                    (cached, true)
                }
                _ => return Err(SessionError::NetworkUnavailable(err.to_string())),
            },
            Err(err) => return Err(err.into()),
        };
        inner.cache(&record);

        let existing = if offline {
            None
        } else {
            match inner.resolver.lookup(session_id, &identity).await {
                Ok(existing) => existing,
                Err(err) => {
                    warn!(
                        target = "reading_session::store",
                        session_id,
                        error = %err,
                        "participant lookup failed"
                    );
                    None
                }
            }
        };
        let is_host = has_host_rights(&identity, &record, existing.as_ref(), access);
        let role = if is_host {
            ParticipantRole::Host
        } else {
            ParticipantRole::Participant
        };

        let (participant, persisted) = if offline {
            (inner.ephemeral_participant(session_id, &identity, role), false)
        } else {
            inner.resolve_participant(session_id, &identity, role).await
        };
        info!(
            target = "reading_session::store",
            session_id,
            participant_id = %participant.id,
            is_host,
            offline,
            "joined session"
        );
        inner.install(SessionMode::Remote, record, participant, persisted, is_host);
        if offline {
            inner.state.write().offline = true;
            inner.emit(SessionEvent::Offline);
        } else {
            inner.attach_channel().await;
        }
        self.start_loops();
        Ok(session_id.to_string())
    }

    /// Applies `patch` to the session. Only a missing session is an error;
    /// denied writes and lost connectivity degrade silently.
    pub async fn update(&self, patch: SessionPatch) -> Result<(), SessionError> {
        self.inner.apply_update(patch).await
    }

    /// Draws `card`: moves it from the deck to the drawn cards. Guests relay
    /// the request to the host after applying it locally.
    pub async fn draw_card(&self, card: SelectedCard) -> Result<(), SessionError> {
        self.inner.draw_card(card).await
    }

    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.inner.snapshot()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    pub fn participant(&self) -> Option<Participant> {
        self.inner.state.read().participant.clone()
    }

    pub fn participant_id(&self) -> Option<String> {
        self.inner.participant_id()
    }

    pub fn is_host(&self) -> bool {
        self.inner.state.read().is_host
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.state.read().mode
    }

    /// True for local sessions and remote ones running from cache.
    pub fn is_offline(&self) -> bool {
        let state = self.inner.state.read();
        state.mode == SessionMode::Local || state.offline
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.state.read().participants.clone()
    }

    pub fn presence(&self) -> Vec<PresenceMeta> {
        self.inner.state.read().presence.clone()
    }

    pub fn in_call(&self) -> bool {
        self.inner.call.in_call()
    }

    pub fn call_peers(&self) -> Vec<(String, LinkState)> {
        self.inner.call.peer_states()
    }

    /// Re-reads the identity provider after a sign-in and moves this
    /// participant onto the account. A host of an anonymously owned session
    /// also becomes its `host_user_id`.
    pub async fn upgrade_identity(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let Some(identity) = inner.identity.current() else {
            return Ok(());
        };
        let Some(user_id) = identity.user_id().map(str::to_string) else {
            return Ok(());
        };
        let (participant, persisted, is_host, owner_missing) = {
            let state = inner.state.read();
            let Some(record) = state.record.as_ref() else {
                return Err(SessionError::NoActiveSession);
            };
            (
                state.participant.clone(),
                state.participant_persisted && !state.offline,
                state.is_host,
                record.host_user_id.is_none(),
            )
        };
        let Some(participant) = participant else {
            return Err(SessionError::NoActiveSession);
        };

        let upgraded = if persisted {
            inner.resolver.upgrade(&participant, &user_id).await?
        } else {
            let mut local = participant.clone();
            local.user_id = Some(user_id.clone());
            local.anonymous_id = None;
            local
        };
        info!(
            target = "reading_session::store",
            participant_id = %upgraded.id,
            merged = upgraded.id != participant.id,
            "participant upgraded to account"
        );
        inner.state.write().participant = Some(upgraded);

        if is_host && owner_missing {
            let patch = SessionPatch {
                host_user_id: Some(Some(user_id)),
                ..SessionPatch::default()
            };
            inner.apply_update(patch).await?;
        }
        inner.retrack().await;
        Ok(())
    }

    /// Joins the session's call, starting it when none is active.
    pub async fn join_call(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let (session_id, participant_id) = inner.require_ids()?;
        inner.call.enter().await?;
        let current = inner
            .snapshot()
            .map(|record| record.call_state())
            .unwrap_or_default();
        let next = if current.is_active {
            current.with_participant(&participant_id)
        } else {
            VideoCallState::started(&session_id, &participant_id)
        };
        inner.apply_update(SessionPatch::call_state(next)).await?;
        inner.retrack().await;
        Ok(())
    }

    /// Stops local media, closes every peer link and leaves the call state.
    pub async fn leave_call(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let (_, participant_id) = inner.require_ids()?;
        inner.call.leave().await;
        let current = inner
            .snapshot()
            .map(|record| record.call_state())
            .unwrap_or_default();
        if current.contains(&participant_id) {
            let next = current.without_participant(&participant_id);
            inner.apply_update(SessionPatch::call_state(next)).await?;
        }
        inner.retrack().await;
        Ok(())
    }

    /// Leaves the call, marks this participant inactive and tears down.
    pub async fn leave(&self) {
        if self.inner.call.in_call() {
            if let Err(err) = self.leave_call().await {
                debug!(
                    target = "reading_session::call",
                    error = %err,
                    "leave call during session leave failed"
                );
            }
        }
        self.inner.retire_participant().await;
        self.cleanup().await;
    }

    /// Host marks the session inactive for everyone; anyone else just leaves.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        if !self.is_host() {
            self.leave().await;
            return Ok(());
        }
        if self.inner.call.in_call() {
            self.leave_call().await?;
        }
        let patch = SessionPatch {
            is_active: Some(false),
            ..SessionPatch::default()
        };
        self.inner.apply_update(patch).await?;
        self.inner.mark_ended();
        self.inner.retire_participant().await;
        self.cleanup().await;
        Ok(())
    }

    /// Stops timers, the call and the channel and forgets the session.
    /// Safe to call when nothing is running.
    pub async fn cleanup(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.inner.call.unbind().await;
        let channel = self.inner.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        *self.inner.state.write() = EngineState::idle();
    }

    /// Runs one scheduler pass immediately.
    pub async fn run_sync_cycle(&self) -> SyncReport {
        self.inner.run_sync_cycle().await
    }

    fn start_loops(&self) {
        let sync = tokio::spawn(sync::sync_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.sync_interval(),
        ));
        let presence = tokio::spawn(sync::presence_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.presence_interval(),
        ));
        self.inner.tasks.lock().extend([sync, presence]);
    }
}

impl EngineInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> Option<SessionRecord> {
        self.state.read().record.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.state.read().record.as_ref().map(|r| r.id.clone())
    }

    fn participant_id(&self) -> Option<String> {
        self.state.read().participant.as_ref().map(|p| p.id.clone())
    }

    fn channel(&self) -> Option<Arc<SessionChannel>> {
        self.channel.lock().clone()
    }

    fn require_ids(&self) -> Result<(String, String), SessionError> {
        let state = self.state.read();
        match (state.record.as_ref(), state.participant.as_ref()) {
            (Some(record), Some(participant)) => Ok((record.id.clone(), participant.id.clone())),
            _ => Err(SessionError::NoActiveSession),
        }
    }

    fn current_identity(&self) -> Identity {
        match resolve_identity(self.identity.as_ref(), self.local.as_ref()) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(
                    target = "reading_session::store",
                    error = %err,
                    "fingerprint unavailable, using a one-off identity"
                );
                Identity::Fingerprint(Uuid::new_v4().to_string())
            }
        }
    }

    fn display_name(&self, role: ParticipantRole) -> String {
        self.identity.display_name().unwrap_or_else(|| {
            match role {
                ParticipantRole::Host => "Host",
                ParticipantRole::Participant => "Guest",
            }
            .to_string()
        })
    }

    fn ephemeral_participant(
        &self,
        session_id: &str,
        identity: &Identity,
        role: ParticipantRole,
    ) -> Participant {
        let now = Utc::now();
        Participant {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: identity.user_id().map(str::to_string),
            anonymous_id: identity.anonymous_id().map(str::to_string),
            name: self.display_name(role),
            role,
            is_active: true,
            joined_at: now,
            last_seen_at: now,
        }
    }

    /// Resolved participant row, or an in-memory stand-in when the row store
    /// will not take one. The flag is true for a stored row.
    async fn resolve_participant(
        &self,
        session_id: &str,
        identity: &Identity,
        role: ParticipantRole,
    ) -> (Participant, bool) {
        let name = self.display_name(role);
        match self.resolver.resolve(session_id, identity, &name, role).await {
            Ok(participant) => (participant, true),
            Err(err) => {
                warn!(
                    target = "reading_session::store",
                    session_id,
                    error = %err,
                    "participant row unavailable, continuing unregistered"
                );
                (self.ephemeral_participant(session_id, identity, role), false)
            }
        }
    }

    fn install(
        &self,
        mode: SessionMode,
        record: SessionRecord,
        participant: Participant,
        persisted: bool,
        is_host: bool,
    ) {
        {
            let mut state = self.state.write();
            *state = EngineState::idle();
            state.mode = mode;
            state.record = Some(record.clone());
            if persisted {
                state.participants = vec![participant.clone()];
            }
            state.participant = Some(participant);
            state.participant_persisted = persisted;
            state.is_host = is_host;
        }
        self.emit(SessionEvent::Updated(record));
    }

    fn create_local(&self, deck_id: &str, identity: &Identity) -> String {
        let record = SessionRecord::new(
            new_local_session_id(),
            deck_id,
            identity.user_id().map(str::to_string),
            Utc::now(),
        );
        if let Err(err) = save_session(self.local.as_ref(), &record) {
            warn!(
                target = "reading_session::store",
                session_id = %record.id,
                error = %err,
                "could not persist local session"
            );
        }
        let id = record.id.clone();
        let participant = self.ephemeral_participant(&id, identity, ParticipantRole::Host);
        self.install(SessionMode::Local, record, participant, false, true);
        self.emit(SessionEvent::Offline);
        id
    }

    /// Keeps the local copy of a remote session fresh for offline joins.
    fn cache(&self, record: &SessionRecord) {
        if let Err(err) = save_session(self.local.as_ref(), record) {
            debug!(
                target = "reading_session::store",
                session_id = %record.id,
                error = %err,
                "snapshot cache write failed"
            );
        }
    }

    fn presence_meta(&self) -> Option<PresenceMeta> {
        let state = self.state.read();
        let participant = state.participant.as_ref()?;
        Some(PresenceMeta {
            participant_id: participant.id.clone(),
            name: participant.name.clone(),
            is_host: state.is_host,
            in_call: self.call.in_call(),
            online_at: Utc::now(),
        })
    }

    /// Subscribes the session channel, wires dispatch and the call
    /// coordinator to it and announces presence.
    async fn attach_channel(self: &Arc<Self>) {
        let Ok((session_id, participant_id)) = self.require_ids() else {
            return;
        };
        let channel = match SessionChannel::open(
            self.realtime.as_ref(),
            &session_id,
            &participant_id,
            &self.config.tables,
        )
        .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    target = "reading_session::channel",
                    session_id = %session_id,
                    error = %err,
                    "channel subscribe failed, will retry on next sync"
                );
                return;
            }
        };
        let handler: Weak<dyn ChannelHandler> = Arc::downgrade(self) as Weak<dyn ChannelHandler>;
        channel.spawn_dispatch(handler);
        self.call.bind(Arc::clone(&channel), &participant_id);
        let previous = self.channel.lock().replace(Arc::clone(&channel));
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.retrack().await;

        let roster = channel.roster();
        self.state.write().presence = roster.clone();
        self.emit(SessionEvent::PresenceChanged(roster));

        match self.rows.list_participants(&session_id).await {
            Ok(participants) => {
                self.state.write().participants = participants.clone();
                self.emit(SessionEvent::ParticipantsChanged(participants));
            }
            Err(err) => debug!(
                target = "reading_session::store",
                session_id = %session_id,
                error = %err,
                "participant list unavailable"
            ),
        }
    }

    async fn retrack(&self) {
        let (Some(channel), Some(meta)) = (self.channel(), self.presence_meta()) else {
            return;
        };
        if let Err(err) = channel.track(&meta).await {
            warn!(
                target = "reading_session::channel",
                participant_id = %meta.participant_id,
                error = %err,
                "presence track failed"
            );
        }
    }

    /// Optimistic apply followed by mode-dependent persistence.
    async fn apply_update(&self, patch: SessionPatch) -> Result<(), SessionError> {
        if patch.is_empty() {
            return Ok(());
        }
        let patch = patch.stamped(Utc::now());
        let (mode, offline, is_host, record) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(record) = state.record.as_mut() else {
                return Err(SessionError::NoActiveSession);
            };
            patch.apply_to(record);
            let snapshot = record.clone();
            state.edits.record(&patch);
            if state.offline && state.is_host {
                state.unsynced_edits = true;
            }
            (state.mode, state.offline, state.is_host, snapshot)
        };
        self.emit(SessionEvent::Updated(record.clone()));

        match mode {
            SessionMode::Idle => {}
            SessionMode::Local => {
                if let Err(err) = save_session(self.local.as_ref(), &record) {
                    warn!(
                        target = "reading_session::store",
                        session_id = %record.id,
                        error = %err,
                        "local session write failed"
                    );
                }
            }
            SessionMode::Remote if offline => self.cache(&record),
            SessionMode::Remote if is_host => self.persist(&record, patch).await,
            SessionMode::Remote => {
                debug!(
                    target = "reading_session::relay",
                    session_id = %record.id,
                    "relaying guest update to host"
                );
                self.broadcast_action(SessionAction::UpdateSession(patch)).await;
            }
        }
        Ok(())
    }

    async fn persist(&self, record: &SessionRecord, patch: SessionPatch) {
        match self.rows.update_session(&record.id, &patch).await {
            Ok(()) => debug!(
                target = "reading_session::store",
                session_id = %record.id,
                "session row updated"
            ),
            Err(err) if err.is_write_denied() => {
                warn!(
                    target = "reading_session::relay",
                    session_id = %record.id,
                    error = %err,
                    "host write denied, broadcasting hostUpdate"
                );
                self.broadcast_action(SessionAction::HostUpdate(patch)).await;
            }
            Err(err) if err.is_network() => {
                warn!(
                    target = "reading_session::store",
                    session_id = %record.id,
                    error = %err,
                    "row store unreachable, working offline"
                );
                self.cache(record);
                self.go_offline(&record.id);
            }
            Err(err) => warn!(
                target = "reading_session::store",
                session_id = %record.id,
                error = %err,
                "session update failed"
            ),
        }
    }

    /// Switches a remote session to offline after a write could not reach
    /// the row store. Its snapshot is written back on reconnect.
    fn go_offline(&self, session_id: &str) {
        let newly = {
            let mut state = self.state.write();
            let current = state.record.as_ref().map(|r| r.id.as_str()) == Some(session_id);
            if !current || state.mode != SessionMode::Remote {
                return;
            }
            state.unsynced_edits = true;
            !std::mem::replace(&mut state.offline, true)
        };
        if newly {
            self.emit(SessionEvent::Offline);
        }
    }

    async fn broadcast_action(&self, action: SessionAction) {
        let (Some(channel), Some(participant_id)) = (self.channel(), self.participant_id()) else {
            debug!(
                target = "reading_session::relay",
                action = action.name(),
                "no channel, dropping relayed action"
            );
            return;
        };
        let message = ChannelMessage::Action(ActionEnvelope::new(action, participant_id));
        if let Err(err) = channel.send(&message).await {
            warn!(
                target = "reading_session::relay",
                error = %err,
                "relay broadcast failed"
            );
        }
    }

    async fn draw_card(&self, card: SelectedCard) -> Result<(), SessionError> {
        let (patch, relay) = {
            let state = self.state.read();
            let record = state.record.as_ref().ok_or(SessionError::NoActiveSession)?;
            let relay = state.mode == SessionMode::Remote && !state.is_host && !state.offline;
            (card_selection_patch(record, &card), relay)
        };
        let Some(patch) = patch else {
            debug!(
                target = "reading_session::relay",
                card_id = %card.card.id,
                "card already drawn"
            );
            return Ok(());
        };
        if relay {
            self.apply_locally(patch, true);
            self.broadcast_action(SessionAction::CardSelection(card)).await;
            Ok(())
        } else {
            self.apply_update(patch).await
        }
    }

    /// Applies a patch to memory only.
    fn apply_locally(&self, patch: SessionPatch, local_edit: bool) {
        let record = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(record) = state.record.as_mut() else {
                return;
            };
            patch.apply_to(record);
            let snapshot = record.clone();
            if local_edit {
                state.edits.record(&patch);
            }
            snapshot
        };
        self.emit(SessionEvent::Updated(record));
    }

    /// Reconciles a remote snapshot into memory using `window`.
    fn merge_snapshot(&self, incoming: SessionRecord, window: Duration) {
        let (record, newly_ended) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(local) = state.record.as_ref() else {
                return;
            };
            if local.id != incoming.id {
                return;
            }
            let recent = state.edits.within(window);
            let merged = reconcile(local, &incoming, &recent);
            if merged.is_stale() {
                debug!(
                    target = "reading_session::reconcile",
                    session_id = %incoming.id,
                    kept_local = ?merged.kept_local,
                    "stale snapshot fields discarded"
                );
            }
            let newly_ended = !merged.record.is_active && !state.ended;
            if newly_ended {
                state.ended = true;
            }
            state.record = Some(merged.record.clone());
            (merged.record, newly_ended)
        };
        self.cache(&record);
        self.emit(SessionEvent::Updated(record));
        if newly_ended {
            info!(
                target = "reading_session::store",
                "session ended remotely"
            );
            self.emit(SessionEvent::Ended);
        }
    }

    fn mark_ended(&self) {
        let newly = {
            let mut state = self.state.write();
            !std::mem::replace(&mut state.ended, true)
        };
        if newly {
            self.emit(SessionEvent::Ended);
        }
    }

    async fn retire_participant(&self) {
        let participant = {
            let state = self.state.read();
            if !state.participant_persisted || state.offline {
                return;
            }
            state.participant.clone()
        };
        if let Some(participant) = participant {
            if let Err(err) = self.resolver.leave(&participant.id).await {
                warn!(
                    target = "reading_session::store",
                    participant_id = %participant.id,
                    error = %err,
                    "could not mark participant inactive"
                );
            }
        }
    }
}
