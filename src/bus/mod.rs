//! Change Bus (§4.5): topic-based publish/subscribe with per-subscriber
//! back-pressure. Ordering is preserved per (topic, subscriber); a full
//! subscriber queue drops its oldest pending message rather than blocking
//! the publisher (§5 "publication enqueue when a subscriber channel is full
//! (non-blocking with drop)").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::model::{UniverseId, DMX_UNIVERSE_SIZE};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Topic identity, independent of any filter narrowing within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    DmxOutputChanged,
    CueListPlaybackUpdated,
    PreviewSessionUpdated,
}

/// An optional narrowing filter applied at subscribe time; `None` receives
/// every event published to the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Universe(UniverseId),
    CueListId(String),
    ProjectId(String),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Filter::Universe(u), Event::DmxOutputChanged { universe, .. }) => universe == u,
            (Filter::CueListId(id), Event::CueListPlaybackUpdated(s)) => &s.cue_list_id == id,
            (Filter::ProjectId(id), Event::PreviewSessionUpdated(s)) => &s.project_id == id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CueRef {
    pub id: String,
    pub cue_number: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CueListPlaybackStatus {
    pub cue_list_id: String,
    pub current_index: Option<usize>,
    pub is_playing: bool,
    pub fade_progress: f64,
    pub current_cue: Option<CueRef>,
    pub next_cue: Option<CueRef>,
    pub previous_cue: Option<CueRef>,
    pub last_updated_unix_ms: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewSessionStatus {
    pub id: String,
    pub project_id: String,
    pub is_active: bool,
    pub created_at_unix_ms: u64,
    /// Per-universe effective output at the moment of publication.
    pub dmx_output: Vec<(UniverseId, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub enum Event {
    DmxOutputChanged {
        universe: UniverseId,
        channels: Box<[u8; DMX_UNIVERSE_SIZE]>,
    },
    CueListPlaybackUpdated(CueListPlaybackStatus),
    PreviewSessionUpdated(PreviewSessionStatus),
}

impl Event {
    fn topic(&self) -> TopicKind {
        match self {
            Event::DmxOutputChanged { .. } => TopicKind::DmxOutputChanged,
            Event::CueListPlaybackUpdated(_) => TopicKind::CueListPlaybackUpdated,
            Event::PreviewSessionUpdated(_) => TopicKind::PreviewSessionUpdated,
        }
    }
}

struct SubscriberState {
    queue: VecDeque<Event>,
    dropped: u64,
}

struct Subscriber {
    filter: Option<Filter>,
    capacity: usize,
    state: Mutex<SubscriberState>,
    notify: Notify,
}

/// Handle returned by `subscribe`. Drop it (or call `unsubscribe`) to stop
/// receiving and release the queue.
pub struct Subscription {
    id: Uuid,
    topic: TopicKind,
    inner: Arc<Subscriber>,
    bus: ChangeBus,
}

impl Subscription {
    /// Waits for and returns the next event, in publish order. Returns
    /// `None` if the subscription has been removed from the bus.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut state = self.inner.state.lock().await;
                if let Some(ev) = state.queue.pop_front() {
                    return Some(ev);
                }
            }
            if !self.bus.contains(self.topic, self.id).await {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Count of messages dropped for this subscriber due to overflow.
    pub async fn dropped_count(&self) -> u64 {
        self.inner.state.lock().await.dropped
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let topic = self.topic;
        let id = self.id;
        tokio::spawn(async move {
            bus.unsubscribe(topic, id).await;
        });
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    topics: Arc<Mutex<HashMap<TopicKind, HashMap<Uuid, Arc<Subscriber>>>>>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        ChangeBus {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn subscribe(&self, topic: TopicKind, filter: Option<Filter>) -> Subscription {
        self.subscribe_with_capacity(topic, filter, DEFAULT_SUBSCRIBER_CAPACITY)
            .await
    }

    pub async fn subscribe_with_capacity(
        &self,
        topic: TopicKind,
        filter: Option<Filter>,
        capacity: usize,
    ) -> Subscription {
        let id = Uuid::new_v4();
        let inner = Arc::new(Subscriber {
            filter,
            capacity,
            state: Mutex::new(SubscriberState {
                queue: VecDeque::with_capacity(capacity.min(16)),
                dropped: 0,
            }),
            notify: Notify::new(),
        });

        let mut topics = self.topics.lock().await;
        topics.entry(topic).or_default().insert(id, inner.clone());

        Subscription {
            id,
            topic,
            inner,
            bus: self.clone(),
        }
    }

    pub async fn unsubscribe(&self, topic: TopicKind, id: Uuid) {
        let mut topics = self.topics.lock().await;
        if let Some(subs) = topics.get_mut(&topic) {
            subs.remove(&id);
        }
    }

    /// Drains every topic and wakes all subscribers so `Subscription::recv`
    /// observes the subscriber no longer registered and returns `None`
    /// (§5 shutdown: "drain Change Bus → close subscribers").
    pub async fn close_all(&self) {
        let mut topics = self.topics.lock().await;
        for subs in topics.values() {
            for sub in subs.values() {
                sub.notify.notify_waiters();
            }
        }
        topics.clear();
    }

    async fn contains(&self, topic: TopicKind, id: Uuid) -> bool {
        let topics = self.topics.lock().await;
        topics
            .get(&topic)
            .map(|s| s.contains_key(&id))
            .unwrap_or(false)
    }

    /// Enqueues `event` into every matching subscriber's queue. Never blocks:
    /// a full queue drops its oldest entry first.
    pub async fn publish(&self, event: Event) {
        let topic = event.topic();
        let topics = self.topics.lock().await;
        let Some(subs) = topics.get(&topic) else {
            return;
        };
        for sub in subs.values() {
            if let Some(filter) = &sub.filter {
                if !filter.matches(&event) {
                    continue;
                }
            }
            let mut state = sub.state.lock().await;
            if state.queue.len() >= sub.capacity {
                state.queue.pop_front();
                state.dropped += 1;
            }
            state.queue.push_back(event.clone());
            drop(state);
            sub.notify.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self, topic: TopicKind) -> usize {
        let topics = self.topics.lock().await;
        topics.get(&topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_status(cue_list_id: &str) -> CueListPlaybackStatus {
        CueListPlaybackStatus {
            cue_list_id: cue_list_id.to_string(),
            current_index: Some(0),
            is_playing: true,
            fade_progress: 0.0,
            current_cue: None,
            next_cue: None,
            previous_cue: None,
            last_updated_unix_ms: 0,
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn back_pressure_drops_oldest_and_preserves_order() {
        let bus = ChangeBus::new();
        let sub = bus
            .subscribe_with_capacity(TopicKind::CueListPlaybackUpdated, None, 2)
            .await;

        for i in 0..5u8 {
            let mut s = dummy_status("cl1");
            s.current_index = Some(i as usize);
            bus.publish(Event::CueListPlaybackUpdated(s)).await;
        }

        assert_eq!(sub.dropped_count().await, 3);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first, second) {
            (Event::CueListPlaybackUpdated(a), Event::CueListPlaybackUpdated(b)) => {
                assert_eq!(a.current_index, Some(3));
                assert_eq!(b.current_index, Some(4));
            }
            _ => panic!("wrong event type"),
        }
    }

    #[tokio::test]
    async fn filter_narrows_delivery() {
        let bus = ChangeBus::new();
        let sub = bus
            .subscribe(
                TopicKind::CueListPlaybackUpdated,
                Some(Filter::CueListId("wanted".into())),
            )
            .await;

        bus.publish(Event::CueListPlaybackUpdated(dummy_status("other")))
            .await;
        bus.publish(Event::CueListPlaybackUpdated(dummy_status("wanted")))
            .await;

        let ev = sub.recv().await.unwrap();
        match ev {
            Event::CueListPlaybackUpdated(s) => assert_eq!(s.cue_list_id, "wanted"),
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = ChangeBus::new();
        {
            let sub = bus.subscribe(TopicKind::PreviewSessionUpdated, None).await;
            assert_eq!(bus.subscriber_count(TopicKind::PreviewSessionUpdated).await, 1);
            drop(sub);
        }
        // Drop spawns an async unsubscribe; yield so it runs.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(bus.subscriber_count(TopicKind::PreviewSessionUpdated).await, 0);
    }
}
