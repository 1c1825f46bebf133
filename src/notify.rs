//! Notification Fabric: a bounded per-subscriber inbox of async events
//! (command status changes, heartbeats, session recovery, server health),
//! fed by `publish()` and drained by `next()`.
//!
//! Inboxes are bounded because a slow or absent subscriber must not let the
//! server's memory grow without limit. When an inbox is full, the oldest
//! *non-terminal* notification is dropped first (a stale heartbeat is safe
//! to lose; a `Completed`/`Cancelled`/`Failed` status is not) -- the same
//! drop-oldest discipline the event buffer this module is grounded on uses,
//! adapted from a reconnect buffer to a live per-subscriber channel.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Default inbox capacity before the drop-oldest policy kicks in.
const DEFAULT_INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    CommandStatus {
        session_id: String,
        command_id: String,
        state: String,
    },
    CommandHeartbeat {
        session_id: String,
        command_id: String,
        elapsed_ms: u64,
    },
    SessionRecovery {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
        succeeded: bool,
    },
    ServerHealth {
        active_sessions: usize,
        queued_commands: usize,
    },
}

impl Notification {
    /// The session this event concerns, or `None` for fabric-wide events
    /// (currently only `ServerHealth`).
    fn session_id(&self) -> Option<&str> {
        match self {
            Notification::CommandStatus { session_id, .. }
            | Notification::CommandHeartbeat { session_id, .. }
            | Notification::SessionRecovery { session_id, .. } => Some(session_id),
            Notification::ServerHealth { .. } => None,
        }
    }

    /// Terminal events (a command reaching its final state) are protected
    /// from the drop-oldest eviction policy; heartbeats and health pings are
    /// not.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notification::CommandStatus { state, .. }
                if matches!(state.as_str(), "completed" | "failed" | "cancelled" | "timed_out")
        )
    }
}

/// A single subscriber's bounded inbox.
struct Inbox {
    queue: std::sync::Mutex<VecDeque<Notification>>,
    ready: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, notification: Notification) {
        let mut queue = self.queue.lock().expect("inbox mutex poisoned");
        if queue.len() >= self.capacity {
            if !self.make_room(&mut queue) {
                // Every queued event is terminal and protected; drop the
                // incoming one instead rather than lose a delivered result.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        queue.push_back(notification);
        drop(queue);
        self.ready.notify_one();
    }

    /// Evict exactly one non-terminal entry (oldest first) to make room.
    /// Returns `false` if no evictable entry was found.
    fn make_room(&self, queue: &mut VecDeque<Notification>) -> bool {
        if let Some(pos) = queue.iter().position(|n| !n.is_terminal()) {
            queue.remove(pos);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    async fn next(&self) -> Notification {
        loop {
            {
                let mut queue = self.queue.lock().expect("inbox mutex poisoned");
                if let Some(n) = queue.pop_front() {
                    return n;
                }
            }
            self.ready.notified().await;
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live subscription. Dropping the handle does not unsubscribe --
/// call `NotificationFabric::unsubscribe` explicitly (the handle may be
/// cloned across tasks).
pub struct Subscription {
    pub id: u64,
    session_filter: Option<String>,
    inbox: Arc<Inbox>,
}

impl Subscription {
    pub async fn next(&self) -> Notification {
        self.inbox.next().await
    }

    pub fn dropped_count(&self) -> u64 {
        self.inbox.dropped_count()
    }
}

struct SubscriberEntry {
    session_filter: Option<String>,
    inbox: Arc<Inbox>,
}

/// Fan-out hub. Subscribers register for either a single session's events
/// or, with `session_filter = None`, every session's events plus
/// fabric-wide ones.
pub struct NotificationFabric {
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
}

impl NotificationFabric {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self, session_filter: Option<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox::new(DEFAULT_INBOX_CAPACITY));
        self.subscribers.write().await.insert(
            id,
            SubscriberEntry {
                session_filter: session_filter.clone(),
                inbox: inbox.clone(),
            },
        );
        Subscription {
            id,
            session_filter,
            inbox,
        }
    }

    /// Idempotent: unsubscribing an id that's already gone is a no-op.
    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn publish(&self, notification: Notification) {
        let subscribers = self.subscribers.read().await;
        let target_session = notification.session_id();
        for entry in subscribers.values() {
            let matches = match (&entry.session_filter, target_session) {
                (None, _) => true,
                (Some(filter), Some(session)) => filter == session,
                (Some(_), None) => false,
            };
            if matches {
                entry.inbox.push(notification.clone());
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for NotificationFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(session: &str, command: &str, state: &str) -> Notification {
        Notification::CommandStatus {
            session_id: session.to_string(),
            command_id: command.to_string(),
            state: state.to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_only_receives_matching_session_events() {
        let fabric = NotificationFabric::new();
        let sub_a = fabric.subscribe(Some("s1".into())).await;
        let sub_b = fabric.subscribe(Some("s2".into())).await;

        fabric.publish(status("s1", "c1", "completed")).await;

        let got = sub_a.next().await;
        assert!(matches!(got, Notification::CommandStatus { session_id, .. } if session_id == "s1"));

        // s2's subscriber got nothing -- don't block forever waiting on it.
        assert_eq!(sub_b.dropped_count(), 0);
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_every_session() {
        let fabric = NotificationFabric::new();
        let wildcard = fabric.subscribe(None).await;

        fabric.publish(status("s1", "c1", "completed")).await;
        fabric.publish(status("s2", "c2", "completed")).await;
        fabric
            .publish(Notification::ServerHealth {
                active_sessions: 2,
                queued_commands: 0,
            })
            .await;

        let first = wildcard.next().await;
        let second = wildcard.next().await;
        let third = wildcard.next().await;
        assert!(matches!(first, Notification::CommandStatus { .. }));
        assert!(matches!(second, Notification::CommandStatus { .. }));
        assert!(matches!(third, Notification::ServerHealth { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let fabric = NotificationFabric::new();
        let sub = fabric.subscribe(None).await;
        fabric.unsubscribe(sub.id).await;
        fabric.unsubscribe(sub.id).await;
        assert_eq!(fabric.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_inbox_drops_oldest_non_terminal_before_newest() {
        let inbox = Inbox::new(2);
        inbox.push(Notification::CommandHeartbeat {
            session_id: "s1".into(),
            command_id: "c1".into(),
            elapsed_ms: 10,
        });
        inbox.push(status("s1", "c1", "completed"));
        // Inbox is full: one heartbeat (non-terminal) + one terminal status.
        // A third push must evict the heartbeat, not the terminal status.
        inbox.push(Notification::CommandHeartbeat {
            session_id: "s1".into(),
            command_id: "c2".into(),
            elapsed_ms: 20,
        });

        let first = inbox.next().await;
        assert!(matches!(first, Notification::CommandStatus { .. }));
        let second = inbox.next().await;
        assert!(matches!(
            second,
            Notification::CommandHeartbeat { command_id, .. } if command_id == "c2"
        ));
        assert_eq!(inbox.dropped_count(), 1);
    }

    #[tokio::test]
    async fn full_inbox_of_only_terminal_events_drops_incoming() {
        let inbox = Inbox::new(1);
        inbox.push(status("s1", "c1", "completed"));
        inbox.push(status("s1", "c2", "completed"));
        assert_eq!(inbox.dropped_count(), 1);
        let only = inbox.next().await;
        assert!(matches!(only, Notification::CommandStatus { command_id, .. } if command_id == "c1"));
    }
}
