//! Guest action relay: how relayed actions are routed on receipt.

use crate::model::{SelectedCard, SessionRecord};
use crate::patch::SessionPatch;
use crate::protocol::{ActionEnvelope, SessionAction};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayRoute {
    /// Host re-issues the change as its own persisted update.
    Persist(SessionPatch),
    /// Host draws the requested card and persists the result.
    Draw(SelectedCard),
    /// Applied to in-memory state only.
    ApplyLocally(SessionPatch),
    Ignore,
}

/// Routing is by role: only the host acts on guest requests, and host
/// fallbacks are applied by everyone without persisting.
pub fn route_inbound(envelope: &ActionEnvelope, self_id: &str, is_host: bool) -> RelayRoute {
    if envelope.participant_id == self_id {
        return RelayRoute::Ignore;
    }
    match &envelope.action {
        SessionAction::UpdateSession(patch) if is_host => RelayRoute::Persist(patch.clone()),
        SessionAction::CardSelection(card) if is_host => RelayRoute::Draw(card.clone()),
        SessionAction::UpdateSession(_) | SessionAction::CardSelection(_) => RelayRoute::Ignore,
        SessionAction::HostUpdate(patch) => RelayRoute::ApplyLocally(patch.clone()),
    }
}

/// Patch that moves `selected` from the deck into the drawn cards.
/// `None` if that card is already drawn.
pub fn card_selection_patch(record: &SessionRecord, selected: &SelectedCard) -> Option<SessionPatch> {
    if record
        .selected_cards
        .iter()
        .any(|c| c.card.id == selected.card.id)
    {
        return None;
    }
    let mut cards = record.selected_cards.clone();
    cards.push(selected.clone());
    let deck = record
        .shuffled_deck
        .iter()
        .filter(|c| c.id != selected.card.id)
        .cloned()
        .collect();
    Some(SessionPatch {
        selected_cards: Some(cards),
        shuffled_deck: Some(deck),
        ..SessionPatch::default()
    })
}
