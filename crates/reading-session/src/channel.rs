//! The single realtime channel a session uses for row changes, presence,
//! relayed actions and call signaling.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_bus::{
    BusError, ChannelConfig, ChannelEvent, PresenceEntry, Realtime, RealtimeChannel, RowChange,
    RowChangeKind, RowFilter,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TableNames;
use crate::error::SessionError;
use crate::model::{Participant, SessionRecord};
use crate::protocol::{ChannelMessage, PresenceMeta};

pub fn topic_for(session_id: &str) -> String {
    format!("reading-session:{session_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Sync(Vec<PresenceMeta>),
    Joined(PresenceMeta),
    Left(PresenceMeta),
}

/// Channel traffic after decoding.
#[derive(Debug, Clone)]
pub enum Inbound {
    SessionRow(SessionRecord),
    ParticipantRow {
        kind: RowChangeKind,
        participant: Participant,
    },
    Message(ChannelMessage),
    Presence(PresenceUpdate),
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_inbound(&self, inbound: Inbound);
}

pub struct SessionChannel {
    inner: Arc<dyn RealtimeChannel>,
    session_id: String,
    tables: TableNames,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl SessionChannel {
    pub async fn open(
        realtime: &dyn Realtime,
        session_id: &str,
        participant_id: &str,
        tables: &TableNames,
    ) -> Result<Arc<Self>, BusError> {
        let config = ChannelConfig {
            presence_key: Some(participant_id.to_string()),
            row_filters: vec![
                RowFilter::updates(&tables.sessions, "id", session_id),
                RowFilter::all(&tables.participants, "session_id", session_id),
            ],
            receive_own_broadcasts: false,
        };
        let inner = realtime.channel(&topic_for(session_id), config).await?;
        debug!(
            target = "reading_session::channel",
            session_id,
            participant_id,
            "session channel subscribed"
        );
        Ok(Arc::new(Self {
            inner,
            session_id: session_id.to_string(),
            tables: tables.clone(),
            dispatch: Mutex::new(None),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, message: &ChannelMessage) -> Result<(), SessionError> {
        let (event, payload) = message.encode()?;
        self.inner.broadcast(event, payload).await?;
        Ok(())
    }

    pub async fn track(&self, meta: &PresenceMeta) -> Result<(), SessionError> {
        self.inner.track(serde_json::to_value(meta)?).await?;
        Ok(())
    }

    pub fn roster(&self) -> Vec<PresenceMeta> {
        self.inner
            .presence()
            .iter()
            .filter_map(decode_presence)
            .collect()
    }

    /// Starts forwarding decoded traffic to `handler` until the channel
    /// closes or the handler is dropped.
    pub fn spawn_dispatch(&self, handler: Weak<dyn ChannelHandler>) {
        let Some(mut events) = self.inner.take_events() else {
            warn!(
                target = "reading_session::channel",
                session_id = %self.session_id,
                "channel events already taken"
            );
            return;
        };
        let tables = self.tables.clone();
        let session_id = self.session_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inbound) = decode_event(&tables, event) else {
                    continue;
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.on_inbound(inbound).await;
            }
            debug!(
                target = "reading_session::channel",
                session_id = %session_id,
                "dispatch loop finished"
            );
        });
        if let Some(previous) = self.dispatch.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Untracks, unsubscribes and stops dispatch. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
        if let Err(err) = self.inner.untrack().await {
            debug!(
                target = "reading_session::channel",
                session_id = %self.session_id,
                error = %err,
                "untrack failed"
            );
        }
        if let Err(err) = self.inner.unsubscribe().await {
            debug!(
                target = "reading_session::channel",
                session_id = %self.session_id,
                error = %err,
                "unsubscribe failed"
            );
        }
    }
}

fn decode_presence(entry: &PresenceEntry) -> Option<PresenceMeta> {
    serde_json::from_value(entry.meta.clone()).ok()
}

fn decode_row(tables: &TableNames, change: RowChange) -> Option<Inbound> {
    let record = match change.kind {
        RowChangeKind::Delete => change.old_record,
        _ => change.record,
    };
    if change.table == tables.sessions {
        decode_value::<SessionRecord>(record).map(Inbound::SessionRow)
    } else if change.table == tables.participants {
        decode_value::<Participant>(record).map(|participant| Inbound::ParticipantRow {
            kind: change.kind,
            participant,
        })
    } else {
        None
    }
}

fn decode_value<T: serde::de::DeserializeOwned>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            debug!(
                target = "reading_session::channel",
                error = %err,
                "dropping undecodable row change"
            );
            None
        }
    }
}

fn decode_event(tables: &TableNames, event: ChannelEvent) -> Option<Inbound> {
    match event {
        ChannelEvent::Broadcast { event, payload } => match ChannelMessage::decode(&event, payload) {
            Ok(message) => Some(Inbound::Message(message)),
            Err(err) => {
                debug!(
                    target = "reading_session::channel",
                    event = %event,
                    error = %err,
                    "dropping broadcast"
                );
                None
            }
        },
        ChannelEvent::PresenceSync(entries) => Some(Inbound::Presence(PresenceUpdate::Sync(
            entries.iter().filter_map(decode_presence).collect(),
        ))),
        ChannelEvent::PresenceJoin(entry) => {
            decode_presence(&entry).map(|meta| Inbound::Presence(PresenceUpdate::Joined(meta)))
        }
        ChannelEvent::PresenceLeave(entry) => {
            decode_presence(&entry).map(|meta| Inbound::Presence(PresenceUpdate::Left(meta)))
        }
        ChannelEvent::RowChange(change) => decode_row(tables, change),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// A membership whose socket is already gone: presence calls fail.
    #[derive(Default)]
    struct DroppedSocket {
        unsubscribes: AtomicUsize,
    }

    #[async_trait]
    impl RealtimeChannel for DroppedSocket {
        fn topic(&self) -> &str {
            "reading-session:s-1"
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
            None
        }

        async fn broadcast(&self, _event: &str, _payload: Value) -> realtime_bus::BusResult<()> {
            Err(BusError::Closed)
        }

        async fn track(&self, _meta: Value) -> realtime_bus::BusResult<()> {
            Err(BusError::Closed)
        }

        async fn untrack(&self) -> realtime_bus::BusResult<()> {
            Err(BusError::Closed)
        }

        fn presence(&self) -> Vec<PresenceEntry> {
            Vec::new()
        }

        async fn unsubscribe(&self) -> realtime_bus::BusResult<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct DroppedRealtime(Arc<DroppedSocket>);

    #[async_trait]
    impl Realtime for DroppedRealtime {
        async fn channel(
            &self,
            _topic: &str,
            _config: ChannelConfig,
        ) -> realtime_bus::BusResult<Arc<dyn RealtimeChannel>> {
            let channel: Arc<dyn RealtimeChannel> = self.0.clone();
            Ok(channel)
        }
    }

    #[test]
    fn topic_uses_session_prefix() {
        assert_eq!(topic_for("abc"), "reading-session:abc");
    }

    #[test]
    fn row_changes_route_by_table() {
        let tables = TableNames::default();
        let session = SessionRecord::new("s-1", "deck", None, Utc::now());
        let inbound = decode_event(
            &tables,
            ChannelEvent::RowChange(RowChange {
                table: "reading_sessions".into(),
                kind: RowChangeKind::Update,
                record: serde_json::to_value(&session).unwrap(),
                old_record: Value::Null,
            }),
        );
        assert!(matches!(inbound, Some(Inbound::SessionRow(r)) if r.id == "s-1"));

        let unknown = decode_event(
            &tables,
            ChannelEvent::RowChange(RowChange {
                table: "chat_messages".into(),
                kind: RowChangeKind::Insert,
                record: json!({}),
                old_record: Value::Null,
            }),
        );
        assert!(unknown.is_none());
    }

    #[test]
    fn presence_without_participant_meta_is_skipped() {
        let tables = TableNames::default();
        let stray = decode_event(
            &tables,
            ChannelEvent::PresenceJoin(PresenceEntry {
                key: "x".into(),
                meta: json!({"foo": 1}),
            }),
        );
        assert!(stray.is_none());

        let meta = json!({
            "participantId": "p-1", "name": "Ada", "isHost": true,
            "inCall": false, "onlineAt": "2024-05-01T10:00:00Z"
        });
        let joined = decode_event(
            &tables,
            ChannelEvent::PresenceJoin(PresenceEntry {
                key: "p-1".into(),
                meta,
            }),
        );
        assert!(matches!(
            joined,
            Some(Inbound::Presence(PresenceUpdate::Joined(m))) if m.is_host
        ));
    }

    #[tokio::test]
    async fn close_unsubscribes_even_when_untrack_fails() {
        let socket = Arc::new(DroppedSocket::default());
        let realtime = DroppedRealtime(socket.clone());
        let channel = SessionChannel::open(&realtime, "s-1", "p-1", &TableNames::default())
            .await
            .expect("open");

        channel.close().await;
        assert_eq!(socket.unsubscribes.load(Ordering::SeqCst), 1);
        channel.close().await;
        assert_eq!(socket.unsubscribes.load(Ordering::SeqCst), 2);
    }
}
