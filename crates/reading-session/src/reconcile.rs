//! Merging remote snapshots into in-memory state.
//!
//! Pure and clock-free: callers pass the guarded fields edited locally inside
//! the recency window, so the merge can be exercised without a network or
//! timers.

use crate::model::SessionRecord;
use crate::patch::SessionPatch;

/// Fields a recent local edit protects from an incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardedField {
    ReadingStep,
    SelectedLayout,
    Question,
    SelectedCards,
    Interpretation,
    ActiveCardIndex,
}

impl GuardedField {
    /// Guarded fields `patch` writes. The deck counts as part of the draw.
    pub fn touched_by(patch: &SessionPatch) -> Vec<GuardedField> {
        let mut fields = Vec::new();
        if patch.reading_step.is_some() {
            fields.push(GuardedField::ReadingStep);
        }
        if patch.selected_layout.is_some() {
            fields.push(GuardedField::SelectedLayout);
        }
        if patch.question.is_some() {
            fields.push(GuardedField::Question);
        }
        if patch.selected_cards.is_some() || patch.shuffled_deck.is_some() {
            fields.push(GuardedField::SelectedCards);
        }
        if patch.interpretation.is_some() {
            fields.push(GuardedField::Interpretation);
        }
        if patch.active_card_index.is_some() {
            fields.push(GuardedField::ActiveCardIndex);
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub record: SessionRecord,
    /// Fields where the incoming value differed and was discarded.
    pub kept_local: Vec<GuardedField>,
}

impl Reconciled {
    /// True when at least part of the incoming snapshot lost to local state.
    pub fn is_stale(&self) -> bool {
        !self.kept_local.is_empty()
    }
}

/// Merges `incoming` over `local`.
///
/// `recent` names the guarded fields edited locally inside the recency
/// window; every other field takes the incoming value. For a recent field:
/// - question, layout, interpretation and active card keep their local values
/// - the reading step never moves to a lower ordinal
/// - drawn cards and the remaining deck are kept as a pair when the incoming
///   snapshot has fewer drawn cards
///
/// Zoom, pan, modal, call state, activity and timestamps always take the
/// incoming value.
pub fn reconcile(
    local: &SessionRecord,
    incoming: &SessionRecord,
    recent: &[GuardedField],
) -> Reconciled {
    let mut record = incoming.clone();
    record.id = local.id.clone();
    let mut kept_local = Vec::new();
    let guarded = |field: GuardedField| recent.contains(&field);

    if guarded(GuardedField::ReadingStep)
        && incoming.reading_step.ordinal() < local.reading_step.ordinal()
    {
        record.reading_step = local.reading_step;
        kept_local.push(GuardedField::ReadingStep);
    }
    if guarded(GuardedField::SelectedLayout) && incoming.selected_layout != local.selected_layout {
        record.selected_layout = local.selected_layout.clone();
        kept_local.push(GuardedField::SelectedLayout);
    }
    if guarded(GuardedField::Question) && incoming.question != local.question {
        record.question = local.question.clone();
        kept_local.push(GuardedField::Question);
    }
    if guarded(GuardedField::SelectedCards)
        && incoming.selected_cards.len() < local.selected_cards.len()
    {
        record.selected_cards = local.selected_cards.clone();
        record.shuffled_deck = local.shuffled_deck.clone();
        kept_local.push(GuardedField::SelectedCards);
    }
    if guarded(GuardedField::Interpretation) && incoming.interpretation != local.interpretation {
        record.interpretation = local.interpretation.clone();
        kept_local.push(GuardedField::Interpretation);
    }
    if guarded(GuardedField::ActiveCardIndex) && incoming.active_card_index != local.active_card_index
    {
        record.active_card_index = local.active_card_index;
        kept_local.push(GuardedField::ActiveCardIndex);
    }

    Reconciled { record, kept_local }
}
