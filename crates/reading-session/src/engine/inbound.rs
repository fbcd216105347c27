use async_trait::async_trait;
use realtime_bus::RowChangeKind;
use tracing::debug;

use super::EngineInner;
use crate::channel::{ChannelHandler, Inbound, PresenceUpdate};
use crate::events::SessionEvent;
use crate::model::Participant;
use crate::patch::SessionPatch;
use crate::protocol::{ActionEnvelope, ChannelMessage, PresenceMeta};
use crate::relay::{card_selection_patch, route_inbound, RelayRoute};

#[async_trait]
impl ChannelHandler for EngineInner {
    async fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::SessionRow(record) => {
                self.merge_snapshot(record, self.config.push_recent_window());
            }
            Inbound::ParticipantRow { kind, participant } => {
                self.on_participant_row(kind, participant);
            }
            Inbound::Message(ChannelMessage::Action(envelope)) => self.on_action(envelope).await,
            Inbound::Message(signal) => self.call.handle_signal(signal).await,
            Inbound::Presence(update) => self.on_presence(update).await,
        }
    }
}

impl EngineInner {
    fn on_participant_row(&self, kind: RowChangeKind, participant: Participant) {
        let participants = {
            let mut state = self.state.write();
            state.participants.retain(|p| p.id != participant.id);
            if kind != RowChangeKind::Delete {
                if state.participant.as_ref().map(|p| p.id.as_str()) == Some(participant.id.as_str()) {
                    state.participant = Some(participant.clone());
                }
                state.participants.push(participant);
                state.participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
            }
            state.participants.clone()
        };
        self.emit(SessionEvent::ParticipantsChanged(participants));
    }

    async fn on_action(&self, envelope: ActionEnvelope) {
        let (self_id, is_host) = {
            let state = self.state.read();
            match state.participant.as_ref() {
                Some(participant) => (participant.id.clone(), state.is_host),
                None => return,
            }
        };
        let route = route_inbound(&envelope, &self_id, is_host);
        debug!(
            target = "reading_session::relay",
            action = envelope.action.name(),
            participant_id = %envelope.participant_id,
            route = ?route,
            "relayed action received"
        );
        match route {
            RelayRoute::Persist(patch) => self.persist_relayed(patch).await,
            RelayRoute::Draw(card) => {
                let patch = self
                    .snapshot()
                    .and_then(|record| card_selection_patch(&record, &card));
                if let Some(patch) = patch {
                    self.persist_relayed(patch).await;
                }
            }
            RelayRoute::ApplyLocally(patch) => self.apply_locally(patch, false),
            RelayRoute::Ignore => {}
        }
    }

    async fn persist_relayed(&self, patch: SessionPatch) {
        if let Err(err) = self.apply_update(patch).await {
            debug!(
                target = "reading_session::relay",
                error = %err,
                "relayed update dropped"
            );
        }
    }

    async fn on_presence(&self, update: PresenceUpdate) {
        let self_id = self.participant_id();
        let (roster, changed) = {
            let mut state = self.state.write();
            let changed = match &update {
                PresenceUpdate::Sync(metas) => metas.clone(),
                PresenceUpdate::Joined(meta) => {
                    state.presence.retain(|m| m.participant_id != meta.participant_id);
                    state.presence.push(meta.clone());
                    vec![meta.clone()]
                }
                PresenceUpdate::Left(meta) => {
                    state.presence.retain(|m| m.participant_id != meta.participant_id);
                    Vec::new()
                }
            };
            if let PresenceUpdate::Sync(metas) = &update {
                state.presence = metas.clone();
            }
            (state.presence.clone(), changed)
        };
        self.emit(SessionEvent::PresenceChanged(roster));

        for meta in changed.iter() {
            self.call.on_presence(meta).await;
        }
        if let PresenceUpdate::Left(meta) = update {
            if Some(&meta.participant_id) != self_id.as_ref() {
                self.on_member_left(&meta).await;
            }
        }
    }

    /// Drops the peer link and takes the member out of an active call.
    async fn on_member_left(&self, meta: &PresenceMeta) {
        self.call.on_presence_left(&meta.participant_id).await;
        let call = self.snapshot().map(|record| record.call_state()).unwrap_or_default();
        if call.is_active && call.contains(&meta.participant_id) {
            debug!(
                target = "reading_session::call",
                participant_id = %meta.participant_id,
                "call member left"
            );
            let next = call.without_participant(&meta.participant_id);
            if let Err(err) = self.apply_update(SessionPatch::call_state(next)).await {
                debug!(
                    target = "reading_session::call",
                    error = %err,
                    "call state update after leave failed"
                );
            }
        }
    }
}
