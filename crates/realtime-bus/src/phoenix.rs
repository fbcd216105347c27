//! Supabase Realtime client (Phoenix channels protocol, vsn 1.0.0).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::{
    BusError, BusResult, ChannelConfig, ChannelEvent, PresenceEntry, Realtime, RealtimeChannel,
    RowChange, RowChangeKind,
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Realtime websocket endpoint, e.g. `wss://<project>.supabase.co/realtime/v1/websocket`.
    pub endpoint: Url,
    pub api_key: String,
    pub access_token: Option<String>,
    pub heartbeat: Duration,
}

impl PhoenixConfig {
    pub fn new(endpoint: Url, api_key: impl Into<String>) -> Self {
        Self {
            endpoint,
            api_key: api_key.into(),
            access_token: None,
            heartbeat: Duration::from_secs(30),
        }
    }

    /// Derives the websocket endpoint from a project base URL (`https://x.supabase.co`).
    pub fn from_project_url(base: &Url, api_key: impl Into<String>) -> BusResult<Self> {
        let mut endpoint = base
            .join("realtime/v1/websocket")
            .map_err(|err| BusError::Transport(format!("invalid realtime url: {err}")))?;
        let scheme = match endpoint.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => other,
        }
        .to_string();
        endpoint
            .set_scheme(&scheme)
            .map_err(|_| BusError::Transport(format!("unsupported scheme {scheme}")))?;
        Ok(Self::new(endpoint, api_key))
    }

    pub fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        url
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

pub struct PhoenixRealtime {
    config: PhoenixConfig,
    socket: AsyncMutex<Option<Arc<Socket>>>,
}

impl PhoenixRealtime {
    pub fn new(config: PhoenixConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            socket: AsyncMutex::new(None),
        })
    }

    async fn socket(&self) -> BusResult<Arc<Socket>> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            if !socket.closed.load(Ordering::SeqCst) {
                return Ok(Arc::clone(socket));
            }
        }
        let socket = Socket::connect(&self.config).await?;
        *guard = Some(Arc::clone(&socket));
        Ok(socket)
    }
}

#[async_trait]
impl Realtime for PhoenixRealtime {
    async fn channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> BusResult<Arc<dyn RealtimeChannel>> {
        let socket = self.socket().await?;
        let full_topic = format!("realtime:{topic}");
        let (tx, rx) = mpsc::unbounded_channel();
        let presence = Arc::new(RwLock::new(BTreeMap::new()));
        socket.routes.write().insert(
            full_topic.clone(),
            Route {
                tx,
                presence: Arc::clone(&presence),
            },
        );

        let payload = join_payload(&config, self.config.access_token.as_deref());
        let reply = match socket.request(&full_topic, "phx_join", payload).await {
            Ok(reply) => reply,
            Err(err) => {
                socket.routes.write().remove(&full_topic);
                return Err(err);
            }
        };
        if let Err(err) = check_reply(&reply) {
            socket.routes.write().remove(&full_topic);
            return Err(err);
        }
        tracing::debug!(target = "realtime_bus::phoenix", topic = %full_topic, "channel joined");

        Ok(Arc::new(PhoenixChannel {
            socket,
            topic: topic.to_string(),
            full_topic,
            presence,
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Route {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    presence: Arc<RwLock<BTreeMap<String, Value>>>,
}

struct Socket {
    send_tx: mpsc::UnboundedSender<PhoenixMessage>,
    next_ref: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    routes: RwLock<HashMap<String, Route>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Socket {
    async fn connect(config: &PhoenixConfig) -> BusResult<Arc<Self>> {
        let url = config.socket_url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| BusError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "realtime_bus::phoenix",
            endpoint = %config.endpoint,
            "realtime websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<PhoenixMessage>();

        let socket = Arc::new(Socket {
            send_tx,
            next_ref: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader_socket = Arc::clone(&socket);
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(
                            target = "realtime_bus::phoenix",
                            event = "ws_in",
                            len = text.len()
                        );
                        match serde_json::from_str::<PhoenixMessage>(&text) {
                            Ok(message) => reader_socket.dispatch(message),
                            Err(err) => tracing::debug!(
                                target = "realtime_bus::phoenix",
                                error = %err,
                                "ignoring undecodable frame"
                            ),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "realtime_bus::phoenix",
                                    "realtime websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "realtime_bus::phoenix",
                                    "realtime websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            reader_socket.shutdown();
        });

        let heartbeat_socket = Arc::clone(&socket);
        let heartbeat = config.heartbeat;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reference = heartbeat_socket.make_ref();
                let message = PhoenixMessage {
                    topic: PHOENIX_TOPIC.into(),
                    event: "heartbeat".into(),
                    payload: json!({}),
                    reference: Some(reference),
                };
                if heartbeat_socket.send_tx.send(message).is_err() {
                    break;
                }
            }
        });

        {
            let mut guard = socket.tasks.lock();
            guard.push(writer_handle);
            guard.push(reader_handle);
            guard.push(heartbeat_handle);
        }
        Ok(socket)
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn push(&self, topic: &str, event: &str, payload: Value) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let message = PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(self.make_ref()),
        };
        self.send_tx.send(message).map_err(|_| BusError::Closed)
    }

    async fn request(&self, topic: &str, event: &str, payload: Value) -> BusResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let reference = self.make_ref();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(reference.clone(), tx);
        let message = PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.clone()),
        };
        if self.send_tx.send(message).is_err() {
            self.pending.lock().remove(&reference);
            return Err(BusError::Closed);
        }
        match tokio::time::timeout(JOIN_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.pending.lock().remove(&reference);
                Err(BusError::Transport(format!("{event} on {topic} timed out")))
            }
        }
    }

    fn dispatch(&self, message: PhoenixMessage) {
        if message.event == "phx_reply" {
            if let Some(reference) = message.reference.as_deref() {
                if let Some(waiter) = self.pending.lock().remove(reference) {
                    let _ = waiter.send(message.payload);
                }
            }
            return;
        }
        if message.topic == PHOENIX_TOPIC {
            return;
        }
        let routes = self.routes.read();
        let Some(route) = routes.get(&message.topic) else {
            return;
        };
        let events = {
            let mut presence = route.presence.write();
            inbound_events(&message.event, &message.payload, &mut presence)
        };
        for event in events {
            let _ = route.tx.send(event);
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().clear();
        self.routes.write().clear();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::debug!(target = "realtime_bus::phoenix", "realtime socket shut down");
    }
}

struct PhoenixChannel {
    socket: Arc<Socket>,
    topic: String,
    full_topic: String,
    presence: Arc<RwLock<BTreeMap<String, Value>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    closed: AtomicBool,
}

impl PhoenixChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::NotJoined(self.topic.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RealtimeChannel for PhoenixChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn broadcast(&self, event: &str, payload: Value) -> BusResult<()> {
        self.ensure_open()?;
        self.socket.push(
            &self.full_topic,
            "broadcast",
            json!({"type": "broadcast", "event": event, "payload": payload}),
        )
    }

    async fn track(&self, meta: Value) -> BusResult<()> {
        self.ensure_open()?;
        self.socket.push(
            &self.full_topic,
            "presence",
            json!({"type": "presence", "event": "track", "payload": meta}),
        )
    }

    async fn untrack(&self) -> BusResult<()> {
        self.ensure_open()?;
        self.socket.push(
            &self.full_topic,
            "presence",
            json!({"type": "presence", "event": "untrack"}),
        )
    }

    fn presence(&self) -> Vec<PresenceEntry> {
        self.presence
            .read()
            .iter()
            .map(|(key, meta)| PresenceEntry {
                key: key.clone(),
                meta: meta.clone(),
            })
            .collect()
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.socket.routes.write().remove(&self.full_topic);
        match self.socket.push(&self.full_topic, "phx_leave", json!({})) {
            Ok(()) | Err(BusError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for PhoenixChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.socket.routes.write().remove(&self.full_topic);
            let _ = self.socket.push(&self.full_topic, "phx_leave", json!({}));
        }
    }
}

fn join_payload(config: &ChannelConfig, access_token: Option<&str>) -> Value {
    let postgres_changes: Vec<Value> = config
        .row_filters
        .iter()
        .map(|filter| {
            json!({
                "event": filter.kind.map(RowChangeKind::as_str).unwrap_or("*"),
                "schema": "public",
                "table": filter.table,
                "filter": filter.expression(),
            })
        })
        .collect();
    let mut payload = json!({
        "config": {
            "broadcast": {"self": config.receive_own_broadcasts, "ack": false},
            "presence": {"key": config.presence_key.clone().unwrap_or_default()},
            "postgres_changes": postgres_changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

fn check_reply(reply: &Value) -> BusResult<()> {
    match reply.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        _ => Err(BusError::JoinRejected(
            reply
                .get("response")
                .map(Value::to_string)
                .unwrap_or_else(|| reply.to_string()),
        )),
    }
}

/// Latest tracked meta for a presence key, without the `phx_ref` bookkeeping.
fn latest_meta(entry: &Value) -> Value {
    let meta = entry
        .get("metas")
        .and_then(Value::as_array)
        .and_then(|metas| metas.last())
        .cloned()
        .unwrap_or(Value::Null);
    match meta {
        Value::Object(mut map) => {
            map.remove("phx_ref");
            map.remove("phx_ref_prev");
            Value::Object(map)
        }
        other => other,
    }
}

fn parse_row_change(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let kind: RowChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    Some(RowChange {
        table: data.get("table")?.as_str()?.to_string(),
        kind,
        record: data.get("record").cloned().unwrap_or(Value::Null),
        old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
    })
}

fn inbound_events(
    event: &str,
    payload: &Value,
    presence: &mut BTreeMap<String, Value>,
) -> Vec<ChannelEvent> {
    match event {
        "broadcast" => {
            let Some(name) = payload.get("event").and_then(Value::as_str) else {
                return Vec::new();
            };
            vec![ChannelEvent::Broadcast {
                event: name.to_string(),
                payload: payload.get("payload").cloned().unwrap_or(Value::Null),
            }]
        }
        "presence_state" => {
            presence.clear();
            if let Some(state) = payload.as_object() {
                for (key, entry) in state {
                    presence.insert(key.clone(), latest_meta(entry));
                }
            }
            vec![ChannelEvent::PresenceSync(
                presence
                    .iter()
                    .map(|(key, meta)| PresenceEntry {
                        key: key.clone(),
                        meta: meta.clone(),
                    })
                    .collect(),
            )]
        }
        "presence_diff" => {
            let mut events = Vec::new();
            let joins = payload.get("joins").and_then(Value::as_object);
            if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
                for (key, entry) in leaves {
                    // A meta replacement arrives as a leave plus a join for the same key.
                    if joins.map(|j| j.contains_key(key)).unwrap_or(false) {
                        continue;
                    }
                    presence.remove(key);
                    events.push(ChannelEvent::PresenceLeave(PresenceEntry {
                        key: key.clone(),
                        meta: latest_meta(entry),
                    }));
                }
            }
            if let Some(joins) = joins {
                for (key, entry) in joins {
                    let meta = latest_meta(entry);
                    presence.insert(key.clone(), meta.clone());
                    events.push(ChannelEvent::PresenceJoin(PresenceEntry {
                        key: key.clone(),
                        meta,
                    }));
                }
            }
            events
        }
        "postgres_changes" => parse_row_change(payload)
            .map(ChannelEvent::RowChange)
            .into_iter()
            .collect(),
        "phx_error" | "phx_close" => {
            tracing::warn!(
                target = "realtime_bus::phoenix",
                event,
                payload = %payload,
                "channel closed by server"
            );
            Vec::new()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowFilter;

    #[test]
    fn socket_url_carries_api_key_and_version() {
        let base = Url::parse("https://demo.supabase.co").unwrap();
        let config = PhoenixConfig::from_project_url(&base, "anon").unwrap();
        let url = config.socket_url();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert_eq!(url.query(), Some("apikey=anon&vsn=1.0.0"));
    }

    #[test]
    fn join_payload_lists_row_filters() {
        let config = ChannelConfig {
            presence_key: Some("p-1".into()),
            row_filters: vec![
                RowFilter::updates("reading_sessions", "id", "s-1"),
                RowFilter::all("reading_session_participants", "session_id", "s-1"),
            ],
            receive_own_broadcasts: false,
        };
        let payload = join_payload(&config, Some("jwt"));
        assert_eq!(payload["access_token"], "jwt");
        assert_eq!(payload["config"]["presence"]["key"], "p-1");
        assert_eq!(payload["config"]["broadcast"]["self"], false);
        let changes = payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes[0]["event"], "UPDATE");
        assert_eq!(changes[0]["filter"], "id=eq.s-1");
        assert_eq!(changes[1]["event"], "*");
        assert_eq!(changes[1]["table"], "reading_session_participants");
    }

    #[test]
    fn rejected_join_surfaces_response() {
        let err = check_reply(&json!({"status": "error", "response": {"reason": "unauthorized"}}))
            .unwrap_err();
        assert!(matches!(err, BusError::JoinRejected(reason) if reason.contains("unauthorized")));
        assert!(check_reply(&json!({"status": "ok", "response": {}})).is_ok());
    }

    #[test]
    fn presence_diff_tracks_state_and_collapses_replacements() {
        let mut presence = BTreeMap::new();
        let events = inbound_events(
            "presence_state",
            &json!({"a": {"metas": [{"phx_ref": "x", "participantId": "a"}]}}),
            &mut presence,
        );
        assert_eq!(
            events,
            vec![ChannelEvent::PresenceSync(vec![PresenceEntry {
                key: "a".into(),
                meta: json!({"participantId": "a"})
            }])]
        );

        let events = inbound_events(
            "presence_diff",
            &json!({
                "joins": {"a": {"metas": [{"participantId": "a", "inCall": true}]},
                          "b": {"metas": [{"participantId": "b"}]}},
                "leaves": {"a": {"metas": [{"participantId": "a"}]}}
            }),
            &mut presence,
        );
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, ChannelEvent::PresenceJoin(_))));
        assert_eq!(presence["a"]["inCall"], true);

        let events = inbound_events(
            "presence_diff",
            &json!({"joins": {}, "leaves": {"b": {"metas": [{"participantId": "b"}]}}}),
            &mut presence,
        );
        assert!(matches!(&events[0], ChannelEvent::PresenceLeave(entry) if entry.key == "b"));
        assert!(!presence.contains_key("b"));
    }

    #[test]
    fn postgres_change_and_broadcast_frames_decode() {
        let mut presence = BTreeMap::new();
        let events = inbound_events(
            "postgres_changes",
            &json!({"ids": [1], "data": {
                "type": "UPDATE", "schema": "public", "table": "reading_sessions",
                "record": {"id": "s-1"}, "old_record": {"id": "s-1"}
            }}),
            &mut presence,
        );
        match &events[0] {
            ChannelEvent::RowChange(change) => {
                assert_eq!(change.kind, RowChangeKind::Update);
                assert_eq!(change.table, "reading_sessions");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let events = inbound_events(
            "broadcast",
            &json!({"type": "broadcast", "event": "guest_action", "payload": {"action": "hostUpdate"}}),
            &mut presence,
        );
        assert_eq!(
            events,
            vec![ChannelEvent::Broadcast {
                event: "guest_action".into(),
                payload: json!({"action": "hostUpdate"})
            }]
        );
    }
}
