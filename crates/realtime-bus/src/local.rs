use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    BusError, BusResult, ChannelConfig, ChannelEvent, PresenceEntry, Realtime, RealtimeChannel,
    RowChange,
};

/// In-process realtime hub for tests and non-networked contexts.
///
/// Every call to [`Realtime::channel`] creates a new member; broadcasts reach
/// all other members of the topic, presence changes reach every member.
#[derive(Clone, Default)]
pub struct LocalBus {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    topics: RwLock<HashMap<String, Topic>>,
    next_member: AtomicU64,
}

#[derive(Default)]
struct Topic {
    members: HashMap<u64, Member>,
    presence: BTreeMap<String, (u64, Value)>,
}

struct Member {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    config: ChannelConfig,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fans a row change out to every member whose filters match.
    /// Returns the number of members it was delivered to.
    pub fn publish_row_change(&self, change: RowChange) -> usize {
        let topics = self.hub.topics.read();
        let mut delivered = 0;
        for topic in topics.values() {
            for member in topic.members.values() {
                if member.config.row_filters.iter().any(|f| f.matches(&change)) {
                    if member.tx.send(ChannelEvent::RowChange(change.clone())).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.hub
            .topics
            .read()
            .get(topic)
            .map(|t| t.members.len())
            .unwrap_or(0)
    }

    pub fn presence(&self, topic: &str) -> Vec<PresenceEntry> {
        self.hub
            .topics
            .read()
            .get(topic)
            .map(Topic::presence_entries)
            .unwrap_or_default()
    }
}

impl Topic {
    fn presence_entries(&self) -> Vec<PresenceEntry> {
        self.presence
            .iter()
            .map(|(key, (_, meta))| PresenceEntry {
                key: key.clone(),
                meta: meta.clone(),
            })
            .collect()
    }

    fn send_all(&self, event: ChannelEvent) {
        for member in self.members.values() {
            let _ = member.tx.send(event.clone());
        }
    }
}

#[async_trait]
impl Realtime for LocalBus {
    async fn channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> BusResult<Arc<dyn RealtimeChannel>> {
        let member_id = self.hub.next_member.fetch_add(1, Ordering::SeqCst);
        let presence_key = config
            .presence_key
            .clone()
            .unwrap_or_else(|| format!("member-{member_id}"));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.hub.topics.write();
            let entry = topics.entry(topic.to_string()).or_default();
            let _ = tx.send(ChannelEvent::PresenceSync(entry.presence_entries()));
            entry.members.insert(member_id, Member { tx, config });
        }
        tracing::trace!(target = "realtime_bus::local", topic, member_id, "member joined");
        Ok(Arc::new(LocalChannel {
            hub: Arc::clone(&self.hub),
            topic: topic.to_string(),
            member_id,
            presence_key,
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalChannel {
    hub: Arc<Hub>,
    topic: String,
    member_id: u64,
    presence_key: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    closed: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::NotJoined(self.topic.clone()))
        } else {
            Ok(())
        }
    }

    fn remove_presence(&self, topic: &mut Topic) {
        let owned = matches!(topic.presence.get(&self.presence_key), Some((owner, _)) if *owner == self.member_id);
        if owned {
            if let Some((_, meta)) = topic.presence.remove(&self.presence_key) {
                topic.send_all(ChannelEvent::PresenceLeave(PresenceEntry {
                    key: self.presence_key.clone(),
                    meta,
                }));
            }
        }
    }

    fn detach(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut topics = self.hub.topics.write();
        if let Some(topic) = topics.get_mut(&self.topic) {
            topic.members.remove(&self.member_id);
            self.remove_presence(topic);
            if topic.members.is_empty() && topic.presence.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

#[async_trait]
impl RealtimeChannel for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn broadcast(&self, event: &str, payload: Value) -> BusResult<()> {
        self.ensure_open()?;
        let topics = self.hub.topics.read();
        let topic = topics
            .get(&self.topic)
            .ok_or_else(|| BusError::NotJoined(self.topic.clone()))?;
        for (id, member) in &topic.members {
            if *id == self.member_id && !member.config.receive_own_broadcasts {
                continue;
            }
            let _ = member.tx.send(ChannelEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn track(&self, meta: Value) -> BusResult<()> {
        self.ensure_open()?;
        let mut topics = self.hub.topics.write();
        let topic = topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::NotJoined(self.topic.clone()))?;
        topic
            .presence
            .insert(self.presence_key.clone(), (self.member_id, meta.clone()));
        topic.send_all(ChannelEvent::PresenceJoin(PresenceEntry {
            key: self.presence_key.clone(),
            meta,
        }));
        Ok(())
    }

    async fn untrack(&self) -> BusResult<()> {
        self.ensure_open()?;
        let mut topics = self.hub.topics.write();
        if let Some(topic) = topics.get_mut(&self.topic) {
            self.remove_presence(topic);
        }
        Ok(())
    }

    fn presence(&self) -> Vec<PresenceEntry> {
        self.hub
            .topics
            .read()
            .get(&self.topic)
            .map(Topic::presence_entries)
            .unwrap_or_default()
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.detach();
    }
}
