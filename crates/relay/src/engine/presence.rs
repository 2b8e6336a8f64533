// Connection-based presence.
//
// A participant is present while at least one of its live sockets is
// registered. Sockets that stop showing activity are evicted by `sweep`.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::{sync::broadcast, sync::RwLock, time::Instant};
use tracing::debug;
use uuid::Uuid;

const PRESENCE_CHANNEL_CAPACITY: usize = 256;

/// Published whenever a webinar's distinct participant count changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub webinar_id: Uuid,
    pub count: u64,
}

/// Identifies one registered live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
}

#[derive(Debug, Clone)]
struct Connection {
    webinar_id: Uuid,
    participant_id: Uuid,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    connections: RwLock<HashMap<Uuid, Connection>>,
    changes: broadcast::Sender<PresenceChange>,
    stale_after: Duration,
}

impl PresenceTracker {
    /// `stale_after` is the heartbeat interval plus the pong timeout.
    pub fn new(stale_after: Duration) -> Self {
        let (changes, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self { connections: RwLock::new(HashMap::new()), changes, stale_after }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    pub async fn register(&self, webinar_id: Uuid, participant_id: Uuid) -> ConnectionHandle {
        let handle = ConnectionHandle { connection_id: Uuid::new_v4(), webinar_id, participant_id };
        let mut guard = self.connections.write().await;
        let before = distinct_participants(&guard, webinar_id);
        guard.insert(
            handle.connection_id,
            Connection { webinar_id, participant_id, last_seen: Instant::now() },
        );
        self.publish_if_changed(&guard, webinar_id, before);
        handle
    }

    /// Record activity. A connection evicted by the sweeper is re-registered.
    pub async fn touch(&self, handle: &ConnectionHandle) {
        let mut guard = self.connections.write().await;
        if let Some(connection) = guard.get_mut(&handle.connection_id) {
            connection.last_seen = Instant::now();
            return;
        }
        let before = distinct_participants(&guard, handle.webinar_id);
        guard.insert(
            handle.connection_id,
            Connection {
                webinar_id: handle.webinar_id,
                participant_id: handle.participant_id,
                last_seen: Instant::now(),
            },
        );
        self.publish_if_changed(&guard, handle.webinar_id, before);
    }

    pub async fn remove(&self, handle: &ConnectionHandle) {
        let mut guard = self.connections.write().await;
        let before = distinct_participants(&guard, handle.webinar_id);
        if guard.remove(&handle.connection_id).is_some() {
            self.publish_if_changed(&guard, handle.webinar_id, before);
        }
    }

    /// Number of distinct participants with at least one live connection.
    pub async fn count(&self, webinar_id: Uuid) -> u64 {
        distinct_participants(&*self.connections.read().await, webinar_id)
    }

    /// Evict connections idle for longer than `stale_after`. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut guard = self.connections.write().await;
        let stale: Vec<(Uuid, Uuid)> = guard
            .iter()
            .filter(|(_, connection)| connection.last_seen.elapsed() > self.stale_after)
            .map(|(connection_id, connection)| (*connection_id, connection.webinar_id))
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let webinars: HashSet<Uuid> = stale.iter().map(|(_, webinar_id)| *webinar_id).collect();
        let before: HashMap<Uuid, u64> = webinars
            .iter()
            .map(|webinar_id| (*webinar_id, distinct_participants(&guard, *webinar_id)))
            .collect();
        for (connection_id, _) in &stale {
            guard.remove(connection_id);
        }
        for (webinar_id, count) in before {
            self.publish_if_changed(&guard, webinar_id, count);
        }

        debug!(evicted = stale.len(), "presence sweep evicted idle connections");
        stale.len()
    }

    fn publish_if_changed(&self, connections: &HashMap<Uuid, Connection>, webinar_id: Uuid, before: u64) {
        let count = distinct_participants(connections, webinar_id);
        if count != before {
            // Nobody listening is fine.
            let _ = self.changes.send(PresenceChange { webinar_id, count });
        }
    }
}

fn distinct_participants(connections: &HashMap<Uuid, Connection>, webinar_id: Uuid) -> u64 {
    connections
        .values()
        .filter(|connection| connection.webinar_id == webinar_id)
        .map(|connection| connection.participant_id)
        .collect::<HashSet<_>>()
        .len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_tabs_count_as_one_participant() {
        let tracker = PresenceTracker::new(Duration::from_secs(25));
        let webinar_id = Uuid::new_v4();
        let participant_id = Uuid::new_v4();

        let first = tracker.register(webinar_id, participant_id).await;
        let second = tracker.register(webinar_id, participant_id).await;
        assert_eq!(tracker.count(webinar_id).await, 1);

        tracker.remove(&first).await;
        assert_eq!(tracker.count(webinar_id).await, 1);
        tracker.remove(&second).await;
        assert_eq!(tracker.count(webinar_id).await, 0);
    }

    #[tokio::test]
    async fn count_changes_are_published_per_webinar() {
        let tracker = PresenceTracker::new(Duration::from_secs(25));
        let mut changes = tracker.subscribe();
        let webinar_id = Uuid::new_v4();
        let participant_id = Uuid::new_v4();

        let first = tracker.register(webinar_id, participant_id).await;
        tracker.register(webinar_id, participant_id).await;
        tracker.register(webinar_id, Uuid::new_v4()).await;
        tracker.remove(&first).await;

        assert_eq!(changes.recv().await.unwrap(), PresenceChange { webinar_id, count: 1 });
        assert_eq!(changes.recv().await.unwrap(), PresenceChange { webinar_id, count: 2 });
        assert!(changes.try_recv().is_err(), "second tab and its removal do not change the count");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_connections_only() {
        let tracker = PresenceTracker::new(Duration::from_secs(25));
        let webinar_id = Uuid::new_v4();
        let idle = tracker.register(webinar_id, Uuid::new_v4()).await;
        let active = tracker.register(webinar_id, Uuid::new_v4()).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.touch(&active).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(tracker.sweep().await, 1);
        assert_eq!(tracker.count(webinar_id).await, 1);

        // Activity after eviction brings the connection back.
        tracker.touch(&idle).await;
        assert_eq!(tracker.count(webinar_id).await, 2);
    }
}
