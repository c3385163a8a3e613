use std::{collections::HashMap, collections::HashSet, fmt, sync::Arc};

use tokio::sync::{watch, RwLock};
use twi_hook_core::{Payload, Topic};
use uuid::Uuid;

/// Callback invoked with the subscription id and the normalized payload.
pub type EventHandler = Arc<dyn Fn(Uuid, &Payload) + Send + Sync>;

/// Lifecycle of a subscription record.
///
/// Transitions only move forward:
/// `PendingSubscribe -> Active -> PendingUnsubscribe -> Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    PendingSubscribe,
    Active,
    PendingUnsubscribe,
    Removed,
}

impl SubscriptionState {
    fn rank(self) -> u8 {
        match self {
            Self::PendingSubscribe => 0,
            Self::Active => 1,
            Self::PendingUnsubscribe => 2,
            Self::Removed => 3,
        }
    }

    /// Returns `true` once the lifecycle is at or past `target`.
    pub fn reached(self, target: Self) -> bool {
        self.rank() >= target.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingSubscribe => "pending_subscribe",
            Self::Active => "active",
            Self::PendingUnsubscribe => "pending_unsubscribe",
            Self::Removed => "removed",
        }
    }
}

/// Snapshot of one subscription.
#[derive(Clone)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub topic: Topic,
    /// Absolute Helix URL sent as `hub.topic`.
    pub topic_url: String,
    /// Local path plus `?uuid=` query, appended to the public callback base.
    pub callback_path: String,
    pub state: SubscriptionState,
    pub handlers: Vec<EventHandler>,
}

impl fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("topic_url", &self.topic_url)
            .field("callback_path", &self.callback_path)
            .field("state", &self.state)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

struct Entry {
    topic: Topic,
    topic_url: String,
    callback_path: String,
    handlers: Vec<EventHandler>,
    state: watch::Sender<SubscriptionState>,
}

impl Entry {
    fn snapshot(&self, id: Uuid) -> SubscriptionRecord {
        SubscriptionRecord {
            id,
            topic: self.topic,
            topic_url: self.topic_url.clone(),
            callback_path: self.callback_path.clone(),
            state: *self.state.borrow(),
            handlers: self.handlers.clone(),
        }
    }

    fn advance(&self, next: SubscriptionState) -> SubscriptionState {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        });
        *self.state.borrow()
    }
}

/// Shared map of subscription id to record.
///
/// Read by the callback server, written by the manager. Each record carries
/// a watch channel so callers can await a state transition without polling.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new `PendingSubscribe` record under a fresh id.
    pub async fn create(
        &self,
        topic: Topic,
        topic_url: String,
        handler: Option<EventHandler>,
    ) -> SubscriptionRecord {
        let mut entries = self.entries.write().await;
        let id = loop {
            let candidate = Uuid::new_v4();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let (state, _) = watch::channel(SubscriptionState::PendingSubscribe);
        let entry = Entry {
            topic,
            topic_url,
            callback_path: format!("{}?uuid={id}", topic.callback_path()),
            handlers: handler.into_iter().collect(),
            state,
        };
        let record = entry.snapshot(id);
        entries.insert(id, entry);
        record
    }

    pub async fn get(&self, id: Uuid) -> Option<SubscriptionRecord> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.snapshot(id))
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn state(&self, id: Uuid) -> Option<SubscriptionState> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| *entry.state.borrow())
    }

    /// Subscribe confirmation. Returns the resulting state, `None` when unknown.
    pub async fn mark_active(&self, id: Uuid) -> Option<SubscriptionState> {
        self.advance(id, SubscriptionState::Active).await
    }

    /// Hub accepted an unsubscribe; no further notifications are dispatched.
    pub async fn mark_pending_unsubscribe(&self, id: Uuid) -> Option<SubscriptionState> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        entry.handlers.clear();
        Some(entry.advance(SubscriptionState::PendingUnsubscribe))
    }

    /// Unsubscribe confirmation. The record stays for a caller still awaiting
    /// the transition and is dropped right away when nobody is watching.
    pub async fn mark_removed(&self, id: Uuid) -> Option<SubscriptionState> {
        let mut entries = self.entries.write().await;
        let entry = entries.get(&id)?;
        if entry.state.receiver_count() > 0 {
            return Some(entry.advance(SubscriptionState::Removed));
        }
        if let Some(entry) = entries.remove(&id) {
            entry.state.send_replace(SubscriptionState::Removed);
        }
        Some(SubscriptionState::Removed)
    }

    pub async fn remove(&self, id: Uuid) -> Option<SubscriptionRecord> {
        let entry = self.entries.write().await.remove(&id)?;
        entry.state.send_replace(SubscriptionState::Removed);
        Some(entry.snapshot(id))
    }

    /// Appends a handler. Returns `false` when the id is unknown.
    pub async fn add_handler(&self, id: Uuid, handler: EventHandler) -> bool {
        match self.entries.write().await.get_mut(&id) {
            Some(entry) => {
                entry.handlers.push(handler);
                true
            }
            None => false,
        }
    }

    /// Handlers to invoke for a notification, in registration order.
    pub async fn handlers(&self, id: Uuid) -> Vec<EventHandler> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.handlers.clone())
            .unwrap_or_default()
    }

    pub async fn watch(&self, id: Uuid) -> Option<watch::Receiver<SubscriptionState>> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.state.subscribe())
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn ids_in_state(&self, state: SubscriptionState) -> Vec<Uuid> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| *entry.state.borrow() == state)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn advance(&self, id: Uuid, next: SubscriptionState) -> Option<SubscriptionState> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.advance(next))
    }
}

/// Callback ids a bulk unsubscribe is still waiting to hear back about.
pub struct SweepTracker {
    pending: watch::Sender<HashSet<String>>,
}

impl Default for SweepTracker {
    fn default() -> Self {
        Self {
            pending: watch::channel(HashSet::new()).0,
        }
    }
}

impl SweepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the outstanding set with `ids`.
    pub fn begin(&self, ids: impl IntoIterator<Item = String>) {
        self.pending.send_replace(ids.into_iter().collect());
    }

    /// Records an unsubscribe confirmation. Returns `true` if `id` was outstanding.
    pub fn confirm(&self, id: &str) -> bool {
        self.pending.send_if_modified(|pending| pending.remove(id))
    }

    pub fn remaining(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn subscribe(&self) -> watch::Receiver<HashSet<String>> {
        self.pending.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_: Uuid, _: &Payload| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn create_builds_callback_path_with_uuid() {
        let registry = SubscriptionRegistry::new();
        let record = registry
            .create(
                Topic::StreamChanged,
                "https://api.twitch.tv/helix/streams?user_id=1".to_string(),
                None,
            )
            .await;

        assert_eq!(record.state, SubscriptionState::PendingSubscribe);
        assert_eq!(
            record.callback_path,
            format!("/streams?uuid={}", record.id)
        );
        assert!(registry.contains(record.id).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = SubscriptionRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let record = registry
                .create(Topic::UserFollows, "topic".to_string(), None)
                .await;
            assert!(seen.insert(record.id));
        }
        assert_eq!(registry.len().await, 64);
    }

    #[tokio::test]
    async fn unwatched_removal_drops_record() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await
            .id;
        registry.mark_pending_unsubscribe(id).await;

        assert_eq!(
            registry.mark_removed(id).await,
            Some(SubscriptionState::Removed)
        );
        assert!(!registry.contains(id).await);
        assert!(registry.is_empty().await);
        assert_eq!(registry.mark_removed(id).await, None);
    }

    #[tokio::test]
    async fn state_only_moves_forward() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await
            .id;
        let _waiter = registry.watch(id).await.expect("watch");

        assert_eq!(
            registry.mark_active(id).await,
            Some(SubscriptionState::Active)
        );
        assert_eq!(
            registry.mark_removed(id).await,
            Some(SubscriptionState::Removed)
        );
        assert_eq!(
            registry.mark_pending_unsubscribe(id).await,
            Some(SubscriptionState::Removed)
        );
        assert_eq!(
            registry.mark_active(id).await,
            Some(SubscriptionState::Removed)
        );
        assert_eq!(registry.mark_active(Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn pending_unsubscribe_drops_handlers() {
        let registry = SubscriptionRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry
            .create(
                Topic::StreamChanged,
                "topic".to_string(),
                Some(counting_handler(counter.clone())),
            )
            .await
            .id;
        assert!(registry.add_handler(id, counting_handler(counter)).await);
        assert_eq!(registry.handlers(id).await.len(), 2);

        registry.mark_pending_unsubscribe(id).await;
        assert!(registry.handlers(id).await.is_empty());
        assert!(
            !registry
                .add_handler(Uuid::new_v4(), Arc::new(|_: Uuid, _: &Payload| {}))
                .await
        );
    }

    #[tokio::test]
    async fn watch_observes_transition() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await
            .id;
        let mut rx = registry.watch(id).await.expect("watch");

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.mark_active(id).await;
        });

        let reached = tokio::time::timeout(Duration::from_secs(1), async {
            rx.wait_for(|state| *state == SubscriptionState::Active)
                .await
                .is_ok()
        })
        .await
        .expect("transition before timeout");
        assert!(reached);
    }

    #[tokio::test]
    async fn filters_ids_by_state() {
        let registry = SubscriptionRegistry::new();
        let active = registry
            .create(Topic::StreamChanged, "a".to_string(), None)
            .await
            .id;
        registry
            .create(Topic::StreamChanged, "b".to_string(), None)
            .await;
        registry.mark_active(active).await;

        assert_eq!(
            registry.ids_in_state(SubscriptionState::Active).await,
            vec![active]
        );
        assert_eq!(registry.ids().await.len(), 2);

        let removed = registry.remove(active).await.expect("removed");
        assert_eq!(removed.state, SubscriptionState::Removed);
        assert!(registry.get(active).await.is_none());
    }

    #[test]
    fn sweep_tracker_counts_down() {
        let tracker = SweepTracker::new();
        tracker.begin(["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.remaining(), 2);
        assert!(tracker.confirm("a"));
        assert!(!tracker.confirm("a"));
        assert!(!tracker.confirm("zzz"));
        assert_eq!(tracker.remaining(), 1);
    }
}
