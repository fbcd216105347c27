//! Messages exchanged over a session channel.
//!
//! Every broadcast decodes into a closed [`ChannelMessage`]; unknown events or
//! actions are rejected instead of being passed along as loose JSON.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::SelectedCard;
use crate::patch::SessionPatch;

pub const GUEST_ACTION_EVENT: &str = "guest_action";
pub const VIDEO_OFFER_EVENT: &str = "video_offer";
pub const VIDEO_ANSWER_EVENT: &str = "video_answer";
pub const VIDEO_ICE_CANDIDATE_EVENT: &str = "video_ice_candidate";

const UPDATE_SESSION: &str = "updateSession";
const HOST_UPDATE: &str = "hostUpdate";
const CARD_SELECTION: &str = "cardSelection";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown broadcast event `{0}`")]
    UnknownEvent(String),
    #[error("unknown session action `{0}`")]
    UnknownAction(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Mutation relayed over the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Guest asks the host to persist a change.
    UpdateSession(SessionPatch),
    /// Host could not persist; every peer applies the change locally.
    HostUpdate(SessionPatch),
    /// Guest asks the host to draw a specific card.
    CardSelection(SelectedCard),
}

impl SessionAction {
    pub fn name(&self) -> &'static str {
        match self {
            SessionAction::UpdateSession(_) => UPDATE_SESSION,
            SessionAction::HostUpdate(_) => HOST_UPDATE,
            SessionAction::CardSelection(_) => CARD_SELECTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEnvelope {
    pub action: SessionAction,
    pub participant_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    action: String,
    #[serde(default)]
    data: Value,
    participant_id: String,
    timestamp: i64,
}

impl ActionEnvelope {
    pub fn new(action: SessionAction, participant_id: impl Into<String>) -> Self {
        Self {
            action,
            participant_id: participant_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let data = match &self.action {
            SessionAction::UpdateSession(patch) | SessionAction::HostUpdate(patch) => {
                serde_json::to_value(patch)?
            }
            SessionAction::CardSelection(card) => serde_json::to_value(card)?,
        };
        let raw = RawEnvelope {
            action: self.action.name().to_string(),
            data,
            participant_id: self.participant_id.clone(),
            timestamp: self.timestamp.timestamp_millis(),
        };
        Ok(serde_json::to_value(raw)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        let action = match raw.action.as_str() {
            UPDATE_SESSION => SessionAction::UpdateSession(serde_json::from_value(raw.data)?),
            HOST_UPDATE => SessionAction::HostUpdate(serde_json::from_value(raw.data)?),
            CARD_SELECTION => SessionAction::CardSelection(serde_json::from_value(raw.data)?),
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        let timestamp = Utc
            .timestamp_millis_opt(raw.timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Self {
            action,
            participant_id: raw.participant_id,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferSignal {
    pub offer: SessionDescription,
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSignal {
    pub answer: SessionDescription,
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub candidate: IceCandidate,
    pub to: String,
    pub from: String,
}

/// Everything that travels as a channel broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Action(ActionEnvelope),
    VideoOffer(OfferSignal),
    VideoAnswer(AnswerSignal),
    VideoIceCandidate(CandidateSignal),
}

impl ChannelMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ChannelMessage::Action(_) => GUEST_ACTION_EVENT,
            ChannelMessage::VideoOffer(_) => VIDEO_OFFER_EVENT,
            ChannelMessage::VideoAnswer(_) => VIDEO_ANSWER_EVENT,
            ChannelMessage::VideoIceCandidate(_) => VIDEO_ICE_CANDIDATE_EVENT,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            ChannelMessage::Action(envelope) => &envelope.participant_id,
            ChannelMessage::VideoOffer(signal) => &signal.from,
            ChannelMessage::VideoAnswer(signal) => &signal.from,
            ChannelMessage::VideoIceCandidate(signal) => &signal.from,
        }
    }

    /// Addressee of a call signal; actions go to everyone.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            ChannelMessage::Action(_) => None,
            ChannelMessage::VideoOffer(signal) => Some(&signal.to),
            ChannelMessage::VideoAnswer(signal) => Some(&signal.to),
            ChannelMessage::VideoIceCandidate(signal) => Some(&signal.to),
        }
    }

    pub fn encode(&self) -> Result<(&'static str, Value), ProtocolError> {
        let payload = match self {
            ChannelMessage::Action(envelope) => envelope.to_value()?,
            ChannelMessage::VideoOffer(signal) => serde_json::to_value(signal)?,
            ChannelMessage::VideoAnswer(signal) => serde_json::to_value(signal)?,
            ChannelMessage::VideoIceCandidate(signal) => serde_json::to_value(signal)?,
        };
        Ok((self.event(), payload))
    }

    pub fn decode(event: &str, payload: Value) -> Result<Self, ProtocolError> {
        match event {
            GUEST_ACTION_EVENT => Ok(ChannelMessage::Action(ActionEnvelope::from_value(payload)?)),
            VIDEO_OFFER_EVENT => Ok(ChannelMessage::VideoOffer(serde_json::from_value(payload)?)),
            VIDEO_ANSWER_EVENT => Ok(ChannelMessage::VideoAnswer(serde_json::from_value(payload)?)),
            VIDEO_ICE_CANDIDATE_EVENT => Ok(ChannelMessage::VideoIceCandidate(
                serde_json::from_value(payload)?,
            )),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Presence metadata each member tracks on the session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    pub participant_id: String,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub in_call: bool,
    pub online_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Card;
    use serde_json::json;

    #[test]
    fn guest_action_uses_camel_case_envelope() {
        let envelope = ActionEnvelope::new(
            SessionAction::UpdateSession(SessionPatch::question("X")),
            "guest-1",
        );
        let (event, payload) = ChannelMessage::Action(envelope).encode().unwrap();
        assert_eq!(event, "guest_action");
        assert_eq!(payload["action"], "updateSession");
        assert_eq!(payload["participantId"], "guest-1");
        assert_eq!(payload["data"], json!({"question": "X"}));
        assert!(payload["timestamp"].is_i64());
    }

    #[test]
    fn card_selection_decodes() {
        let payload = json!({
            "action": "cardSelection",
            "data": {"card": {"id": "c1", "name": "The Fool"}, "position": 2, "isReversed": true},
            "participantId": "guest-1",
            "timestamp": 1_714_557_600_000i64
        });
        let message = ChannelMessage::decode("guest_action", payload).unwrap();
        let ChannelMessage::Action(envelope) = message else {
            panic!("expected action");
        };
        assert_eq!(
            envelope.action,
            SessionAction::CardSelection(SelectedCard {
                card: Card::new("c1", "The Fool"),
                position: 2,
                is_reversed: true,
            })
        );
        assert_eq!(envelope.timestamp.timestamp_millis(), 1_714_557_600_000);
    }

    #[test]
    fn unknown_action_and_event_are_rejected() {
        let payload = json!({"action": "deleteEverything", "data": {}, "participantId": "x", "timestamp": 0});
        assert!(matches!(
            ChannelMessage::decode("guest_action", payload),
            Err(ProtocolError::UnknownAction(name)) if name == "deleteEverything"
        ));
        assert!(matches!(
            ChannelMessage::decode("chat", json!({})),
            Err(ProtocolError::UnknownEvent(_))
        ));
    }

    #[test]
    fn signals_carry_to_and_from() {
        let payload = json!({
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
            "to": "b",
            "from": "a"
        });
        let message = ChannelMessage::decode("video_ice_candidate", payload).unwrap();
        assert_eq!(message.sender(), "a");
        assert_eq!(message.recipient(), Some("b"));
        let ChannelMessage::VideoIceCandidate(signal) = &message else {
            panic!("expected candidate");
        };
        assert_eq!(signal.candidate.sdp_m_line_index, Some(0));

        let offer = ChannelMessage::VideoOffer(OfferSignal {
            offer: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
            to: "b".into(),
            from: "a".into(),
        });
        let (event, payload) = offer.encode().unwrap();
        assert_eq!(event, "video_offer");
        assert_eq!(payload["offer"]["type"], "offer");
    }
}
