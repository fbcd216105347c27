//! Shared wiring for engine integration tests: several engines on one
//! in-process bus and one row store with simulated RLS.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use realtime_bus::LocalBus;
use reading_session::call::{CallError, LinkSignal, LinkState, MediaBackend, PeerLink};
use reading_session::identity::Identity;
use reading_session::protocol::{IceCandidate, SdpKind, SessionDescription};
use reading_session::{
    EngineDeps, InMemoryRowStore, MemoryLocalStore, SessionEngine, StaticIdentity, SyncConfig,
    TableNames,
};
use tokio::sync::mpsc;

pub struct World {
    pub bus: LocalBus,
    pub rows: Arc<InMemoryRowStore>,
}

pub struct Client {
    pub engine: SessionEngine,
    pub identity: Arc<StaticIdentity>,
    pub local: Arc<MemoryLocalStore>,
    pub media: Arc<FakeMedia>,
}

impl World {
    pub fn new() -> Self {
        let bus = LocalBus::new();
        let rows = InMemoryRowStore::with_bus(bus.clone(), TableNames::default());
        Self { bus, rows }
    }

    pub fn client(&self, identity: StaticIdentity) -> Client {
        self.client_with(identity, SyncConfig::default(), FakeMedia::new())
    }

    pub fn client_with(
        &self,
        identity: StaticIdentity,
        config: SyncConfig,
        media: Arc<FakeMedia>,
    ) -> Client {
        let identity = Arc::new(identity);
        let local = Arc::new(MemoryLocalStore::new());
        let engine = SessionEngine::new(EngineDeps {
            rows: self.rows.client(identity.clone()),
            realtime: Arc::new(self.bus.clone()),
            local: local.clone(),
            identity: identity.clone(),
            media: media.clone(),
            config,
        });
        Client {
            engine,
            identity,
            local,
            media,
        }
    }
}

pub fn user(id: &str, name: &str) -> StaticIdentity {
    StaticIdentity::new(Some(Identity::User(id.to_string())), Some(name.to_string()))
}

/// No auth session at all; the engine falls back to the stored fingerprint.
pub fn guest(name: &str) -> StaticIdentity {
    StaticIdentity::new(None, Some(name.to_string()))
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub async fn settle<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

/// Media backend whose links "connect" as soon as negotiation completes.
pub struct FakeMedia {
    local: AtomicBool,
    fail_on_answer: AtomicBool,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: AtomicBool::new(false),
            fail_on_answer: AtomicBool::new(false),
        })
    }

    /// Links report `Failed` once the remote answer is applied.
    pub fn failing() -> Arc<Self> {
        let media = Self::new();
        media.fail_on_answer.store(true, Ordering::SeqCst);
        media
    }

    pub fn has_local_media_now(&self) -> bool {
        self.local.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn acquire_local_media(&self) -> Result<(), CallError> {
        self.local.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release_local_media(&self) {
        self.local.store(false, Ordering::SeqCst);
    }

    fn has_local_media(&self) -> bool {
        self.local.load(Ordering::SeqCst)
    }

    async fn connect(
        &self,
        remote_id: &str,
        signals: mpsc::UnboundedSender<LinkSignal>,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        Ok(Arc::new(FakeLink {
            remote_id: remote_id.to_string(),
            signals,
            fail_on_answer: self.fail_on_answer.load(Ordering::SeqCst),
        }))
    }
}

struct FakeLink {
    remote_id: String,
    signals: mpsc::UnboundedSender<LinkSignal>,
    fail_on_answer: bool,
}

impl FakeLink {
    fn candidate(&self) -> LinkSignal {
        LinkSignal::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 1 10.0.0.1 5000 typ host for {}", self.remote_id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        })
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let _ = self.signals.send(self.candidate());
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\nfake offer".into(),
        })
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        let _ = self.signals.send(self.candidate());
        let _ = self
            .signals
            .send(LinkSignal::StateChanged(LinkState::Connected));
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\nfake answer".into(),
        })
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<(), CallError> {
        let state = if self.fail_on_answer {
            LinkState::Failed
        } else {
            LinkState::Connected
        };
        let _ = self.signals.send(LinkSignal::StateChanged(state));
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), CallError> {
        Ok(())
    }

    async fn close(&self) {}
}
