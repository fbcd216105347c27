use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{
    Card, Point, ReadingStep, SelectedCard, SessionRecord, SharedModalState, VideoCallState,
};

/// Partial update of a [`SessionRecord`]. Absent fields are left untouched;
/// nullable columns use `Some(None)` to clear.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub host_user_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck_id: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub selected_layout: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub question: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_step: Option<ReadingStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_cards: Option<Vec<SelectedCard>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffled_deck: Option<Vec<Card>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_offset: Option<Point>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub zoom_focus: Option<Option<Point>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub active_card_index: Option<Option<usize>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub shared_modal_state: Option<Option<SharedModalState>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub video_call_state: Option<Option<VideoCallState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

macro_rules! apply_fields {
    ($patch:expr, $record:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$patch.$field {
                $record.$field = value.clone();
            }
        )+
    };
}

impl SessionPatch {
    pub fn apply_to(&self, record: &mut SessionRecord) {
        apply_fields!(
            self,
            record,
            host_user_id,
            deck_id,
            selected_layout,
            question,
            reading_step,
            selected_cards,
            shuffled_deck,
            interpretation,
            zoom_level,
            pan_offset,
            zoom_focus,
            active_card_index,
            shared_modal_state,
            video_call_state,
            is_active,
            updated_at,
        );
    }

    pub fn is_empty(&self) -> bool {
        *self == SessionPatch::default()
    }

    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = Some(now);
        self
    }

    /// Every mutable column of `record`, used to overwrite a remote row.
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            host_user_id: Some(record.host_user_id.clone()),
            deck_id: Some(record.deck_id.clone()),
            selected_layout: Some(record.selected_layout.clone()),
            question: Some(record.question.clone()),
            reading_step: Some(record.reading_step),
            selected_cards: Some(record.selected_cards.clone()),
            shuffled_deck: Some(record.shuffled_deck.clone()),
            interpretation: Some(record.interpretation.clone()),
            zoom_level: Some(record.zoom_level),
            pan_offset: Some(record.pan_offset),
            zoom_focus: Some(record.zoom_focus),
            active_card_index: Some(record.active_card_index),
            shared_modal_state: Some(record.shared_modal_state.clone()),
            video_call_state: Some(record.video_call_state.clone()),
            is_active: Some(record.is_active),
            updated_at: Some(record.updated_at),
        }
    }

    pub fn question(text: impl Into<String>) -> Self {
        Self {
            question: Some(Some(text.into())),
            ..Self::default()
        }
    }

    pub fn step(step: ReadingStep) -> Self {
        Self {
            reading_step: Some(step),
            ..Self::default()
        }
    }

    pub fn call_state(state: VideoCallState) -> Self {
        Self {
            video_call_state: Some(Some(state)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_DECK_ID;
    use serde_json::json;

    fn record() -> SessionRecord {
        SessionRecord::new("s-1", DEFAULT_DECK_ID, None, Utc::now())
    }

    #[test]
    fn absent_fields_are_omitted_and_null_clears() {
        let patch: SessionPatch =
            serde_json::from_value(json!({"question": null, "zoom_level": 2.0})).unwrap();
        assert_eq!(patch.question, Some(None));
        assert_eq!(patch.selected_layout, None);

        let mut rec = record();
        rec.question = Some("old".into());
        patch.apply_to(&mut rec);
        assert_eq!(rec.question, None);
        assert_eq!(rec.zoom_level, 2.0);

        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(wire, json!({"question": null, "zoom_level": 2.0}));
    }

    #[test]
    fn full_patch_reproduces_record() {
        let mut source = record();
        source.question = Some("Will it rain?".into());
        source.reading_step = ReadingStep::Drawing;
        source.selected_cards = vec![SelectedCard {
            card: Card::new("c1", "The Fool"),
            position: 0,
            is_reversed: true,
        }];

        let mut target = record();
        target.created_at = source.created_at;
        SessionPatch::from_record(&source).apply_to(&mut target);
        assert_eq!(target, source);
    }

    #[test]
    fn empty_patch_detection() {
        assert!(SessionPatch::default().is_empty());
        assert!(!SessionPatch::question("x").is_empty());
        assert!(!SessionPatch::default().stamped(Utc::now()).is_empty());
    }
}
