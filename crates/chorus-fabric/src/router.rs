use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::ServerEvent;

/// Opaque handle for one registered connection; used to unregister exactly
/// the handler that was added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId(String);

struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

/// Delivers events to in-memory connections and spools for offline users.
///
/// Connection senders are owned by the transport layer; the router holds
/// only the sending half and evicts it as soon as a send fails, so a
/// disconnected transport is never kept alive from here.
pub struct MessageRouter {
    connections: DashMap<String, Vec<ConnectionHandle>>,
    offline_spool: DashMap<String, VecDeque<ServerEvent>>,
    spool_capacity: usize,
}

impl MessageRouter {
    pub fn new(spool_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            offline_spool: DashMap::new(),
            spool_capacity,
        }
    }

    /// Register a connection for `user_id` and drain the user's offline
    /// spool into it: a summary event first, then each spooled message in
    /// FIFO order.
    pub fn register_connection(
        &self,
        user_id: &str,
        tx: mpsc::Sender<ServerEvent>,
    ) -> ConnectionId {
        let id = ConnectionId(Uuid::new_v4().to_string());
        let backlog: Vec<ServerEvent> = self
            .offline_spool
            .remove(user_id)
            .map(|(_, q)| q.into_iter().collect())
            .unwrap_or_default();

        if !backlog.is_empty() {
            let _ = tx.try_send(ServerEvent::summary(backlog.len()));
            for event in backlog {
                if tx.try_send(event).is_err() {
                    warn!(user_id, "connection filled up while draining spool");
                    break;
                }
            }
        }

        self.connections
            .entry(user_id.to_string())
            .or_default()
            .push(ConnectionHandle {
                id: id.clone(),
                tx,
            });
        debug!(user_id, "connection registered");
        id
    }

    /// Remove one handler; drops the user entry entirely when it was the
    /// last connection.
    pub fn unregister_connection(&self, user_id: &str, conn_id: &ConnectionId) {
        let mut remove_entry = false;
        if let Some(mut handles) = self.connections.get_mut(user_id) {
            handles.retain(|h| &h.id != conn_id);
            remove_entry = handles.is_empty();
        }
        if remove_entry {
            self.connections.remove_if(user_id, |_, v| v.is_empty());
        }
        debug!(user_id, "connection unregistered");
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections
            .get(user_id)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    pub fn spooled_count(&self, user_id: &str) -> usize {
        self.offline_spool
            .get(user_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Deliver to all live connections of a user; spool when none accept.
    ///
    /// Handlers whose channel rejects the send are evicted on the spot.
    /// Returns true when at least one connection took the event.
    pub fn deliver_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        let mut delivered = false;
        if let Some(mut handles) = self.connections.get_mut(user_id) {
            handles.retain(|h| match h.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered = true;
                    true
                }
                Err(e) => {
                    warn!(user_id, error = %e, "dropping dead connection handle");
                    false
                }
            });
        }
        if delivered {
            return true;
        }

        // Offline (or every handler just died): spool, bounded, oldest out.
        let mut spool = self
            .offline_spool
            .entry(user_id.to_string())
            .or_default();
        if spool.len() >= self.spool_capacity {
            spool.pop_front();
        }
        spool.push_back(event);
        false
    }

    /// Plural form: FIFO order per recipient is preserved; no ordering is
    /// promised across recipients.
    pub fn route_message(&self, event: &ServerEvent, recipients: &[String]) {
        for recipient in recipients {
            self.deliver_to_user(recipient, event.clone());
        }
    }
}
