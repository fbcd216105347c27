//! Background scheduling: local-session migration, full resync for guests,
//! reconnecting cached sessions, expiry checks and the presence heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{EngineInner, SessionMode};
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::local_store::{remove_session, save_session};
use crate::model::{new_session_id, ParticipantRole};
use crate::patch::SessionPatch;
use crate::protocol::SessionAction;

/// What one scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another pass was still running.
    pub skipped: bool,
    pub migrated_to: Option<String>,
    pub reconnected: bool,
    pub resynced: bool,
    pub expired: bool,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EngineInner {
    pub(super) async fn run_sync_cycle(self: &Arc<Self>) -> SyncReport {
        let Some(_guard) = InFlight::acquire(&self.sync_in_flight) else {
            debug!(
                target = "reading_session::sync",
                "previous sync cycle still running"
            );
            return SyncReport {
                skipped: true,
                ..SyncReport::default()
            };
        };

        let mut report = SyncReport::default();
        let (mode, offline, is_host) = {
            let state = self.state.read();
            (state.mode, state.offline, state.is_host)
        };
        match mode {
            SessionMode::Idle => {}
            SessionMode::Local => match self.migrate_local().await {
                Ok(migrated) => report.migrated_to = migrated,
                Err(err) => debug!(
                    target = "reading_session::sync",
                    error = %err,
                    "local session not migrated yet"
                ),
            },
            SessionMode::Remote if offline => match self.reconnect().await {
                Ok(reconnected) => report.reconnected = reconnected,
                Err(err) => debug!(
                    target = "reading_session::sync",
                    error = %err,
                    "still offline"
                ),
            },
            SessionMode::Remote => {
                if self.channel().is_none() {
                    self.attach_channel().await;
                }
                if !is_host {
                    match self.resync().await {
                        Ok(resynced) => report.resynced = resynced,
                        Err(err) => warn!(
                            target = "reading_session::sync",
                            error = %err,
                            "full resync failed"
                        ),
                    }
                }
                if self.expiry_due() {
                    match self.check_expiry().await {
                        Ok(expired) => report.expired = expired,
                        Err(err) => warn!(
                            target = "reading_session::sync",
                            error = %err,
                            "expiry check failed"
                        ),
                    }
                }
            }
        }
        report
    }

    /// Inserts the local snapshot under a fresh remote id and switches the
    /// session over to it.
    async fn migrate_local(self: &Arc<Self>) -> Result<Option<String>, SessionError> {
        let Some(snapshot) = self.snapshot() else {
            return Ok(None);
        };
        if !snapshot.is_local() {
            return Ok(None);
        }
        let old_id = snapshot.id.clone();
        let mut candidate = snapshot.clone();
        candidate.id = new_session_id();
        let stored = self.rows.insert_session(&candidate).await?;

        let edited_meanwhile = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(record) = state.record.as_mut() else {
                return Ok(None);
            };
            if record.id != old_id {
                warn!(
                    target = "reading_session::sync",
                    session_id = %stored.id,
                    "session switched during migration, remote copy left behind"
                );
                return Ok(None);
            }
            let edited = *record != snapshot;
            record.id = stored.id.clone();
            let current = record.clone();
            state.mode = SessionMode::Remote;
            if let Some(participant) = state.participant.as_mut() {
                participant.session_id = stored.id.clone();
            }
            state.last_expiry_check = Some(Instant::now());
            (current, edited)
        };
        let (current, edited) = edited_meanwhile;
        if edited {
            if let Err(err) = self
                .rows
                .update_session(&stored.id, &SessionPatch::from_record(&current))
                .await
            {
                warn!(
                    target = "reading_session::sync",
                    session_id = %stored.id,
                    error = %err,
                    "edits made during migration not persisted"
                );
            }
        }

        if let Err(err) = remove_session(self.local.as_ref(), &old_id) {
            warn!(
                target = "reading_session::sync",
                session_id = %old_id,
                error = %err,
                "could not remove migrated local session"
            );
        }
        if let Err(err) = save_session(self.local.as_ref(), &current) {
            debug!(
                target = "reading_session::sync",
                session_id = %current.id,
                error = %err,
                "snapshot cache write failed"
            );
        }
        info!(
            target = "reading_session::sync",
            from = %old_id,
            to = %stored.id,
            "local session migrated"
        );
        self.emit(SessionEvent::Migrated {
            from: old_id,
            to: stored.id.clone(),
        });
        self.emit(SessionEvent::Updated(current));

        let identity = self.current_identity();
        let (participant, persisted) = self
            .resolve_participant(&stored.id, &identity, ParticipantRole::Host)
            .await;
        {
            let mut state = self.state.write();
            if persisted {
                state.participants = vec![participant.clone()];
            }
            state.participant = Some(participant);
            state.participant_persisted = persisted;
        }
        self.attach_channel().await;
        Ok(Some(stored.id))
    }

    /// Brings an offline remote session back online. A host that edited
    /// while offline writes its snapshot back over the row; everyone else
    /// reconciles against the fetched row.
    async fn reconnect(self: &Arc<Self>) -> Result<bool, SessionError> {
        let Some(session_id) = self.session_id() else {
            return Ok(false);
        };
        let fetched = self.rows.fetch_session(&session_id).await?;
        let Some(record) = fetched.filter(|record| record.is_active) else {
            self.mark_ended();
            return Ok(false);
        };
        let (is_host, unsynced) = {
            let state = self.state.read();
            (state.is_host, state.unsynced_edits)
        };

        let mut denied = None;
        let written = if is_host && unsynced {
            match self.snapshot() {
                Some(snapshot) => {
                    let patch = SessionPatch::from_record(&snapshot);
                    match self.rows.update_session(&session_id, &patch).await {
                        Ok(()) => info!(
                            target = "reading_session::sync",
                            session_id = %session_id,
                            "offline edits written back"
                        ),
                        Err(err) if err.is_write_denied() => {
                            warn!(
                                target = "reading_session::sync",
                                session_id = %session_id,
                                error = %err,
                                "offline edits denied, broadcasting hostUpdate"
                            );
                            denied = Some(patch);
                        }
                        Err(err) => return Err(err.into()),
                    }
                    Some(snapshot)
                }
                None => None,
            }
        } else {
            None
        };

        let edited_meanwhile = {
            let mut state = self.state.write();
            state.offline = false;
            state.unsynced_edits = false;
            match (&written, state.record.as_ref()) {
                (Some(written), Some(current)) if current != written => Some(current.clone()),
                _ => None,
            }
        };
        match written {
            Some(_) => {
                if let Some(current) = edited_meanwhile {
                    if let Err(err) = self
                        .rows
                        .update_session(&session_id, &SessionPatch::from_record(&current))
                        .await
                    {
                        warn!(
                            target = "reading_session::sync",
                            session_id = %session_id,
                            error = %err,
                            "edits made during reconnect not persisted"
                        );
                    }
                }
            }
            None => self.merge_snapshot(record, self.config.resync_recent_window()),
        }

        let identity = self.current_identity();
        let role = if is_host {
            ParticipantRole::Host
        } else {
            ParticipantRole::Participant
        };
        let (participant, persisted) = self.resolve_participant(&session_id, &identity, role).await;
        {
            let mut state = self.state.write();
            state.participant = Some(participant);
            state.participant_persisted = persisted;
        }
        info!(
            target = "reading_session::sync",
            session_id = %session_id,
            "reconnected to row store"
        );
        self.attach_channel().await;
        if let Some(patch) = denied {
            self.broadcast_action(SessionAction::HostUpdate(patch)).await;
        }
        Ok(true)
    }

    /// Full fetch-and-reconcile, recovering from missed row-change pushes.
    async fn resync(&self) -> Result<bool, SessionError> {
        let Some(session_id) = self.session_id() else {
            return Ok(false);
        };
        match self.rows.fetch_session(&session_id).await? {
            Some(incoming) => {
                self.merge_snapshot(incoming, self.config.resync_recent_window());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn expiry_due(&self) -> bool {
        let mut state = self.state.write();
        let due = state
            .last_expiry_check
            .map(|at| at.elapsed() >= self.config.expiry_check_interval())
            .unwrap_or(true);
        if due {
            state.last_expiry_check = Some(Instant::now());
        }
        due
    }

    /// Only the host marks an expired session inactive.
    async fn check_expiry(&self) -> Result<bool, SessionError> {
        let (session_id, is_host) = {
            let state = self.state.read();
            match state.record.as_ref() {
                Some(record) if record.is_active => (record.id.clone(), state.is_host),
                _ => return Ok(false),
            }
        };
        let verdict = self
            .resolver
            .expiry_verdict(&session_id, self.config.participant_stale_after())
            .await?;
        if !verdict.should_expire() || !is_host {
            return Ok(false);
        }
        info!(
            target = "reading_session::sync",
            session_id = %session_id,
            verdict = ?verdict,
            "session expired"
        );
        let patch = SessionPatch {
            is_active: Some(false),
            ..SessionPatch::default()
        };
        self.apply_update(patch).await?;
        self.mark_ended();
        Ok(true)
    }

    /// Refreshes `last_seen_at` on this participant's row.
    async fn presence_tick(&self) {
        let participant_id = {
            let state = self.state.read();
            if state.mode != SessionMode::Remote || state.offline || !state.participant_persisted {
                return;
            }
            match state.participant.as_ref() {
                Some(participant) => participant.id.clone(),
                None => return,
            }
        };
        if let Err(err) = self.resolver.touch(&participant_id).await {
            warn!(
                target = "reading_session::sync",
                participant_id = %participant_id,
                error = %err,
                "presence heartbeat failed"
            );
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub(super) async fn sync_loop(engine: Weak<EngineInner>, period: Duration) {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let report = inner.run_sync_cycle().await;
        if report != SyncReport::default() {
            debug!(
                target = "reading_session::sync",
                report = ?report,
                "sync cycle finished"
            );
        }
    }
}

pub(super) async fn presence_loop(engine: Weak<EngineInner>, period: Duration) {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        inner.presence_tick().await;
    }
}
