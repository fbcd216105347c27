use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_DECK_ID: &str = "rider-waite-classic";
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Progress through a reading. Ordered; reconciliation never lets a stale
/// snapshot move it backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingStep {
    #[default]
    Setup,
    AskQuestion,
    Drawing,
    Interpretation,
}

impl ReadingStep {
    pub fn ordinal(self) -> u8 {
        match self {
            ReadingStep::Setup => 0,
            ReadingStep::AskQuestion => 1,
            ReadingStep::Drawing => 2,
            ReadingStep::Interpretation => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReadingStep::Setup => "setup",
            ReadingStep::AskQuestion => "ask-question",
            ReadingStep::Drawing => "drawing",
            ReadingStep::Interpretation => "interpretation",
        }
    }
}

impl fmt::Display for ReadingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStep(pub String);

impl fmt::Display for UnknownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown reading step `{}`", self.0)
    }
}

impl std::error::Error for UnknownStep {}

impl FromStr for ReadingStep {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(ReadingStep::Setup),
            "ask-question" => Ok(ReadingStep::AskQuestion),
            "drawing" => Ok(ReadingStep::Drawing),
            "interpretation" => Ok(ReadingStep::Interpretation),
            other => Err(UnknownStep(other.to_string())),
        }
    }
}

/// Deck content is owned elsewhere; the engine only needs a stable id and
/// carries every other attribute through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Card {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedCard {
    pub card: Card,
    pub position: u32,
    #[serde(default)]
    pub is_reversed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SharedModalState {
    pub is_open: bool,
    #[serde(default)]
    pub card_index: Option<usize>,
    #[serde(default)]
    pub show_description: bool,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VideoCallState {
    pub is_active: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub host_participant_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

impl VideoCallState {
    pub fn started(session_id: &str, host_participant_id: &str) -> Self {
        Self {
            is_active: true,
            session_id: Some(session_id.to_string()),
            host_participant_id: Some(host_participant_id.to_string()),
            participants: vec![host_participant_id.to_string()],
        }
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p == participant_id)
    }

    pub fn with_participant(&self, participant_id: &str) -> Self {
        let mut next = self.clone();
        if !next.contains(participant_id) {
            next.participants.push(participant_id.to_string());
        }
        next
    }

    /// Removes a member. The call ends when its host leaves or nobody is left.
    pub fn without_participant(&self, participant_id: &str) -> Self {
        let mut next = self.clone();
        next.participants.retain(|p| p != participant_id);
        let host_left = next.host_participant_id.as_deref() == Some(participant_id);
        if host_left || next.participants.is_empty() {
            next.is_active = false;
            next.participants.clear();
            next.host_participant_id = None;
        }
        next
    }
}

/// The shared root record, one row per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub host_user_id: Option<String>,
    pub deck_id: String,
    #[serde(default)]
    pub selected_layout: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub reading_step: ReadingStep,
    #[serde(default, deserialize_with = "null_as_default")]
    pub selected_cards: Vec<SelectedCard>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub shuffled_deck: Vec<Card>,
    #[serde(default)]
    pub interpretation: Option<String>,
    #[serde(default = "default_zoom")]
    pub zoom_level: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pan_offset: Point,
    #[serde(default)]
    pub zoom_focus: Option<Point>,
    #[serde(default)]
    pub active_card_index: Option<usize>,
    #[serde(default)]
    pub shared_modal_state: Option<SharedModalState>,
    #[serde(default)]
    pub video_call_state: Option<VideoCallState>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_zoom() -> f64 {
    1.0
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        deck_id: impl Into<String>,
        host_user_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            host_user_id,
            deck_id: deck_id.into(),
            selected_layout: None,
            question: None,
            reading_step: ReadingStep::Setup,
            selected_cards: Vec::new(),
            shuffled_deck: Vec::new(),
            interpretation: None,
            zoom_level: default_zoom(),
            pan_offset: Point::default(),
            zoom_focus: None,
            active_card_index: None,
            shared_modal_state: None,
            video_call_state: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_local(&self) -> bool {
        is_local_id(&self.id)
    }

    pub fn call_state(&self) -> VideoCallState {
        self.video_call_state.clone().unwrap_or_default()
    }
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_local_session_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    #[default]
    Participant,
}

/// One row per (session, identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub anonymous_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub role: ParticipantRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Participant {
    pub fn is_host(&self) -> bool {
        self.role == ParticipantRole::Host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn steps_are_ordered_and_kebab_cased() {
        assert!(ReadingStep::Drawing.ordinal() > ReadingStep::AskQuestion.ordinal());
        assert_eq!(
            serde_json::to_value(ReadingStep::AskQuestion).unwrap(),
            json!("ask-question")
        );
        assert_eq!(
            "interpretation".parse::<ReadingStep>().unwrap(),
            ReadingStep::Interpretation
        );
        assert!("finale".parse::<ReadingStep>().is_err());
    }

    #[test]
    fn call_ends_when_host_leaves() {
        let state = VideoCallState::started("s", "host")
            .with_participant("a")
            .with_participant("b");
        let after = state.without_participant("host");
        assert!(!after.is_active);
        assert!(after.participants.is_empty());
        assert_eq!(after.host_participant_id, None);
    }

    #[test]
    fn call_survives_a_guest_leaving() {
        let state = VideoCallState::started("s", "host").with_participant("a");
        let after = state.without_participant("a");
        assert!(after.is_active);
        assert_eq!(after.participants, vec!["host".to_string()]);
    }

    #[test]
    fn row_with_null_columns_decodes() {
        let row = json!({
            "id": "8d3c",
            "host_user_id": null,
            "deck_id": DEFAULT_DECK_ID,
            "selected_layout": null,
            "question": null,
            "reading_step": "drawing",
            "selected_cards": null,
            "shuffled_deck": [{"id": "c1", "name": "The Fool", "arcana": "major"}],
            "interpretation": null,
            "zoom_level": 1.5,
            "pan_offset": null,
            "zoom_focus": null,
            "active_card_index": null,
            "shared_modal_state": null,
            "video_call_state": {"isActive": true, "participants": ["p1"]},
            "is_active": true,
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        });
        let record: SessionRecord = serde_json::from_value(row).unwrap();
        assert_eq!(record.reading_step, ReadingStep::Drawing);
        assert!(record.selected_cards.is_empty());
        assert_eq!(record.shuffled_deck[0].attributes["arcana"], "major");
        assert_eq!(record.pan_offset, Point::default());
        assert!(record.call_state().contains("p1"));
        assert!(!record.is_local());
    }

    #[test]
    fn local_ids_are_prefixed() {
        let id = new_local_session_id();
        assert!(is_local_id(&id));
        assert!(!is_local_id(&new_session_id()));
    }
}
