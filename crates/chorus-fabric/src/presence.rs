use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::events::ServerEvent;
use crate::router::MessageRouter;

/// Tracks who is online via heartbeats and notifies status subscribers.
///
/// A user is online iff their last heartbeat is younger than the timeout.
/// Transitions emit at most one `presence_change` per edge.
pub struct PresenceService {
    online: DashMap<String, Instant>,
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
    router: Arc<MessageRouter>,
    heartbeat_timeout: Duration,
    monitor_interval: Duration,
}

impl PresenceService {
    pub fn new(
        router: Arc<MessageRouter>,
        heartbeat_timeout: Duration,
        monitor_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            online: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            router,
            heartbeat_timeout,
            monitor_interval,
        })
    }

    /// Record a heartbeat. Emits `status_changed(online)` only on the
    /// offline→online edge.
    pub fn heartbeat(&self, user_id: &str) {
        let previous = self.online.insert(user_id.to_string(), Instant::now());
        if previous.is_none() {
            debug!(user_id, "user came online");
            self.notify_status_change(user_id, true);
        }
    }

    /// Force a user offline. Emits `status_changed(offline)` only when the
    /// user was actually online.
    pub fn set_offline(&self, user_id: &str) {
        if self.online.remove(user_id).is_some() {
            debug!(user_id, "user went offline");
            self.notify_status_change(user_id, false);
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online
            .get(user_id)
            .map(|at| at.elapsed() < self.heartbeat_timeout)
            .unwrap_or(false)
    }

    pub fn subscribe(&self, subscriber_id: &str, target_id: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_default()
            .insert(subscriber_id.to_string());
    }

    pub fn unsubscribe(&self, subscriber_id: &str, target_id: &str) {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(set) = subs.get_mut(target_id) {
            set.remove(subscriber_id);
            if set.is_empty() {
                subs.remove(target_id);
            }
        }
    }

    /// Transition every user whose heartbeat has expired to offline.
    pub fn check_timeouts(&self) {
        let stale: Vec<String> = self
            .online
            .iter()
            .filter(|entry| entry.value().elapsed() > self.heartbeat_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for user_id in stale {
            self.set_offline(&user_id);
        }
    }

    /// Monitor loop. Checks for expired heartbeats until shutdown flips.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("presence monitor started");
        let mut interval = tokio::time::interval(self.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_timeouts();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("presence monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn notify_status_change(&self, user_id: &str, online: bool) {
        let subscribers: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap()
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }
        let event = ServerEvent::presence_change(user_id, online);
        self.router.route_message(&event, &subscribers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn service(timeout_ms: u64) -> (Arc<PresenceService>, Arc<MessageRouter>) {
        let router = Arc::new(MessageRouter::new(100));
        let presence = PresenceService::new(
            router.clone(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        );
        (presence, router)
    }

    #[tokio::test]
    async fn heartbeat_marks_online_and_set_offline_sticks() {
        let (presence, _) = service(30_000);
        assert!(!presence.is_online("u1"));
        presence.heartbeat("u1");
        assert!(presence.is_online("u1"));
        presence.set_offline("u1");
        assert!(!presence.is_online("u1"));
        // stays offline until the next heartbeat
        assert!(!presence.is_online("u1"));
        presence.heartbeat("u1");
        assert!(presence.is_online("u1"));
    }

    #[tokio::test]
    async fn expired_heartbeat_counts_as_offline() {
        let (presence, _) = service(0);
        presence.heartbeat("u1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!presence.is_online("u1"));
        presence.check_timeouts();
        assert!(!presence.is_online("u1"));
    }

    #[tokio::test]
    async fn subscribers_get_one_event_per_edge() {
        let (presence, router) = service(30_000);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_connection("watcher", tx);
        presence.subscribe("watcher", "u1");

        presence.heartbeat("u1");
        presence.heartbeat("u1");
        presence.heartbeat("u1");
        presence.set_offline("u1");
        presence.set_offline("u1");

        // exactly two edges: online, offline
        match rx.recv().await {
            Some(ServerEvent::PresenceChange { status, .. }) => assert_eq!(status, "online"),
            other => panic!("expected online edge, got {other:?}"),
        }
        match rx.recv().await {
            Some(ServerEvent::PresenceChange { status, .. }) => assert_eq!(status, "offline"),
            other => panic!("expected offline edge, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_notifications() {
        let (presence, router) = service(30_000);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_connection("watcher", tx);
        presence.subscribe("watcher", "u1");
        presence.unsubscribe("watcher", "u1");

        presence.heartbeat("u1");
        assert!(rx.try_recv().is_err());
    }
}
