//! Full-mesh call signaling over the session channel.
//!
//! One [`PeerLink`] per remote call member. Existing members holding local
//! media offer to whoever shows up in presence with `in_call` set; offers,
//! answers and ICE candidates travel as addressed channel broadcasts.

pub mod rtc;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::SessionChannel;
use crate::events::SessionEvent;
use crate::protocol::{
    AnswerSignal, CandidateSignal, ChannelMessage, IceCandidate, OfferSignal, PresenceMeta,
    SessionDescription,
};

pub use rtc::{CallConfig, WebRtcMedia};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PeerStateChanged {
        participant_id: String,
        state: LinkState,
    },
    RemoteTrack {
        participant_id: String,
        kind: String,
    },
    /// Only this peer is torn down; the rest of the call carries on.
    PeerFailed {
        participant_id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    Media(String),
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("no session channel to signal over")]
    NoChannel,
}

/// What a peer link reports back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack(String),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, offer: SessionDescription)
        -> Result<SessionDescription, CallError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn close(&self);
}

/// Local media plus a factory for peer links.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire_local_media(&self) -> Result<(), CallError>;

    async fn release_local_media(&self);

    fn has_local_media(&self) -> bool;

    async fn connect(
        &self,
        remote_id: &str,
        signals: mpsc::UnboundedSender<LinkSignal>,
    ) -> Result<Arc<dyn PeerLink>, CallError>;
}

/// Glare rule: when two members offer to each other at once, the smaller
/// participant id keeps its offer and the other answers.
pub fn keeps_own_offer(self_id: &str, remote_id: &str) -> bool {
    self_id < remote_id
}

#[derive(Clone)]
struct CallContext {
    channel: Arc<SessionChannel>,
    self_id: String,
}

struct Peer {
    link: Arc<dyn PeerLink>,
    state: LinkState,
    offered: bool,
    generation: u64,
    pump: JoinHandle<()>,
}

struct CallShared {
    media: Arc<dyn MediaBackend>,
    events: broadcast::Sender<SessionEvent>,
    context: RwLock<Option<CallContext>>,
    peers: Mutex<HashMap<String, Peer>>,
    in_call: AtomicBool,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct CallCoordinator {
    shared: Arc<CallShared>,
}

impl CallCoordinator {
    pub fn new(media: Arc<dyn MediaBackend>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            shared: Arc::new(CallShared {
                media,
                events,
                context: RwLock::new(None),
                peers: Mutex::new(HashMap::new()),
                in_call: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn bind(&self, channel: Arc<SessionChannel>, self_id: &str) {
        *self.shared.context.write() = Some(CallContext {
            channel,
            self_id: self_id.to_string(),
        });
    }

    pub async fn unbind(&self) {
        self.leave().await;
        *self.shared.context.write() = None;
    }

    pub fn in_call(&self) -> bool {
        self.shared.in_call.load(Ordering::SeqCst)
    }

    pub fn has_local_media(&self) -> bool {
        self.shared.media.has_local_media()
    }

    pub fn peer_states(&self) -> Vec<(String, LinkState)> {
        let mut states: Vec<_> = self
            .shared
            .peers
            .lock()
            .iter()
            .map(|(id, peer)| (id.clone(), peer.state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Acquires local media and marks this member as in the call. Offers go
    /// out from the members already in the call once they see our presence.
    pub async fn enter(&self) -> Result<(), CallError> {
        if self.context().is_none() {
            return Err(CallError::NoChannel);
        }
        if !self.shared.media.has_local_media() {
            self.shared.media.acquire_local_media().await?;
        }
        self.shared.in_call.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Closes every peer link and stops local media.
    pub async fn leave(&self) {
        self.shared.in_call.store(false, Ordering::SeqCst);
        let peers: Vec<(String, Peer)> = self.shared.peers.lock().drain().collect();
        for (remote_id, peer) in peers {
            peer.pump.abort();
            peer.link.close().await;
            self.emit_state(&remote_id, LinkState::Closed);
        }
        if self.shared.media.has_local_media() {
            self.shared.media.release_local_media().await;
        }
    }

    pub async fn on_presence(&self, meta: &PresenceMeta) {
        let Some(ctx) = self.context() else {
            return;
        };
        if meta.participant_id == ctx.self_id {
            return;
        }
        if !meta.in_call {
            self.close_peer(&meta.participant_id).await;
            return;
        }
        if !self.in_call() || !self.shared.media.has_local_media() {
            return;
        }
        if self.shared.peers.lock().contains_key(&meta.participant_id) {
            return;
        }
        if let Err(err) = self.offer_to(&ctx, &meta.participant_id).await {
            self.fail_peer(&meta.participant_id, &err).await;
        }
    }

    pub async fn on_presence_left(&self, participant_id: &str) {
        self.close_peer(participant_id).await;
    }

    /// Handles a call signal addressed to this member.
    pub async fn handle_signal(&self, message: ChannelMessage) {
        let Some(ctx) = self.context() else {
            return;
        };
        if message.recipient() != Some(ctx.self_id.as_str()) {
            return;
        }
        let remote_id = message.sender().to_string();
        let result = match message {
            ChannelMessage::VideoOffer(signal) => self.accept_offer(&ctx, signal).await,
            ChannelMessage::VideoAnswer(signal) => self.accept_answer(signal).await,
            ChannelMessage::VideoIceCandidate(signal) => self.add_candidate(signal).await,
            ChannelMessage::Action(_) => Ok(()),
        };
        if let Err(err) = result {
            self.fail_peer(&remote_id, &err).await;
        }
    }

    async fn offer_to(&self, ctx: &CallContext, remote_id: &str) -> Result<(), CallError> {
        let link = self.open_link(ctx, remote_id, true).await?;
        let offer = link.create_offer().await?;
        debug!(
            target = "reading_session::call",
            participant_id = %remote_id,
            "sending offer"
        );
        send(
            ctx,
            ChannelMessage::VideoOffer(OfferSignal {
                offer,
                to: remote_id.to_string(),
                from: ctx.self_id.clone(),
            }),
        )
        .await
    }

    async fn accept_offer(&self, ctx: &CallContext, signal: OfferSignal) -> Result<(), CallError> {
        if !self.in_call() {
            debug!(
                target = "reading_session::call",
                participant_id = %signal.from,
                "ignoring offer while not in call"
            );
            return Ok(());
        }
        let remote_id = signal.from;
        let pending = self
            .shared
            .peers
            .lock()
            .get(&remote_id)
            .map(|peer| (peer.offered, peer.state));
        if let Some((offered, state)) = pending {
            if offered && state == LinkState::Connecting && keeps_own_offer(&ctx.self_id, &remote_id)
            {
                debug!(
                    target = "reading_session::call",
                    participant_id = %remote_id,
                    "offer glare, keeping ours"
                );
                return Ok(());
            }
            self.close_peer(&remote_id).await;
        }

        let link = self.open_link(ctx, &remote_id, false).await?;
        let answer = link.accept_offer(signal.offer).await?;
        debug!(
            target = "reading_session::call",
            participant_id = %remote_id,
            "sending answer"
        );
        send(
            ctx,
            ChannelMessage::VideoAnswer(AnswerSignal {
                answer,
                to: remote_id,
                from: ctx.self_id.clone(),
            }),
        )
        .await
    }

    async fn accept_answer(&self, signal: AnswerSignal) -> Result<(), CallError> {
        let Some(link) = self.link(&signal.from) else {
            debug!(
                target = "reading_session::call",
                participant_id = %signal.from,
                "answer for unknown link"
            );
            return Ok(());
        };
        link.accept_answer(signal.answer).await
    }

    async fn add_candidate(&self, signal: CandidateSignal) -> Result<(), CallError> {
        match self.link(&signal.from) {
            Some(link) => link.add_ice_candidate(signal.candidate).await,
            None => Ok(()),
        }
    }

    async fn open_link(
        &self,
        ctx: &CallContext,
        remote_id: &str,
        offered: bool,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let link = self.shared.media.connect(remote_id, signals_tx).await?;
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let pump = tokio::spawn(pump_signals(
            Arc::downgrade(&self.shared),
            ctx.clone(),
            remote_id.to_string(),
            generation,
            signals_rx,
        ));
        let previous = self.shared.peers.lock().insert(
            remote_id.to_string(),
            Peer {
                link: Arc::clone(&link),
                state: LinkState::Connecting,
                offered,
                generation,
                pump,
            },
        );
        if let Some(previous) = previous {
            previous.pump.abort();
            previous.link.close().await;
        }
        self.emit_state(remote_id, LinkState::Connecting);
        Ok(link)
    }

    async fn close_peer(&self, remote_id: &str) {
        let removed = self.shared.peers.lock().remove(remote_id);
        if let Some(peer) = removed {
            peer.pump.abort();
            peer.link.close().await;
            self.emit_state(remote_id, LinkState::Closed);
        }
    }

    async fn fail_peer(&self, remote_id: &str, err: &CallError) {
        warn!(
            target = "reading_session::call",
            participant_id = %remote_id,
            error = %err,
            "peer setup failed"
        );
        self.emit(CallEvent::PeerFailed {
            participant_id: remote_id.to_string(),
            reason: err.to_string(),
        });
        self.close_peer(remote_id).await;
    }

    fn link(&self, remote_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.shared
            .peers
            .lock()
            .get(remote_id)
            .map(|peer| Arc::clone(&peer.link))
    }

    fn context(&self) -> Option<CallContext> {
        self.shared.context.read().clone()
    }

    /// Returns false for signals from a replaced link or repeated states.
    fn record_state(&self, remote_id: &str, generation: u64, state: LinkState) -> bool {
        let mut peers = self.shared.peers.lock();
        match peers.get_mut(remote_id) {
            Some(peer) if peer.generation == generation && peer.state != state => {
                peer.state = state;
                true
            }
            _ => false,
        }
    }

    fn take_peer(&self, remote_id: &str, generation: u64) -> Option<Peer> {
        let mut peers = self.shared.peers.lock();
        if peers.get(remote_id).map(|peer| peer.generation) == Some(generation) {
            peers.remove(remote_id)
        } else {
            None
        }
    }

    fn emit_state(&self, remote_id: &str, state: LinkState) {
        self.emit(CallEvent::PeerStateChanged {
            participant_id: remote_id.to_string(),
            state,
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.shared.events.send(SessionEvent::Call(event));
    }
}

async fn send(ctx: &CallContext, message: ChannelMessage) -> Result<(), CallError> {
    ctx.channel
        .send(&message)
        .await
        .map_err(|err| CallError::Signaling(err.to_string()))
}

async fn pump_signals(
    shared: Weak<CallShared>,
    ctx: CallContext,
    remote_id: String,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<LinkSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = shared.upgrade() else {
            break;
        };
        let coordinator = CallCoordinator { shared: inner };
        match signal {
            LinkSignal::LocalCandidate(candidate) => {
                let message = ChannelMessage::VideoIceCandidate(CandidateSignal {
                    candidate,
                    to: remote_id.clone(),
                    from: ctx.self_id.clone(),
                });
                if let Err(err) = send(&ctx, message).await {
                    debug!(
                        target = "reading_session::call",
                        participant_id = %remote_id,
                        error = %err,
                        "candidate send failed"
                    );
                }
            }
            LinkSignal::RemoteTrack(kind) => coordinator.emit(CallEvent::RemoteTrack {
                participant_id: remote_id.clone(),
                kind,
            }),
            LinkSignal::StateChanged(state) => {
                if !coordinator.record_state(&remote_id, generation, state) {
                    continue;
                }
                coordinator.emit_state(&remote_id, state);
                match state {
                    LinkState::Failed => {
                        warn!(
                            target = "reading_session::call",
                            participant_id = %remote_id,
                            "peer connection failed"
                        );
                        coordinator.emit(CallEvent::PeerFailed {
                            participant_id: remote_id.clone(),
                            reason: "peer connection failed".into(),
                        });
                        if let Some(peer) = coordinator.take_peer(&remote_id, generation) {
                            peer.link.close().await;
                            coordinator.emit_state(&remote_id, LinkState::Closed);
                        }
                        break;
                    }
                    LinkState::Closed => {
                        coordinator.take_peer(&remote_id, generation);
                        break;
                    }
                    LinkState::Connecting | LinkState::Connected => {}
                }
            }
        }
    }
}
