use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use chorus_storage::{Session, Turn};

use crate::ttl::TtlCache;

/// The four cache regions used by the chat paths:
/// sessions by id, turns by id, user → session list, session → turn list.
///
/// List regions hold fully rendered JSON strings so callers stay decoupled
/// from each other's view types.
pub struct ChatCaches {
    pub sessions: TtlCache<Session>,
    pub turns: TtlCache<Turn>,
    pub user_sessions: TtlCache<String>,
    pub session_turns: TtlCache<String>,
    sweep_interval: Duration,
}

impl ChatCaches {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: TtlCache::new(ttl),
            turns: TtlCache::new(ttl),
            user_sessions: TtlCache::new(ttl),
            session_turns: TtlCache::new(ttl),
            sweep_interval,
        })
    }

    /// Post-write invalidation: the session itself, its turn list, and the
    /// session list of every participant.
    pub fn invalidate_for_write(&self, session_id: &str, participants: &[String]) {
        self.sessions.invalidate(session_id);
        self.session_turns.invalidate(session_id);
        for user in participants {
            self.user_sessions.invalidate(user);
        }
    }

    /// Admin escape hatch: clear every region.
    pub fn invalidate_all(&self) {
        self.sessions.invalidate_all();
        self.turns.invalidate_all();
        self.user_sessions.invalidate_all();
        self.session_turns.invalidate_all();
        info!("all cache regions cleared");
    }

    /// Background sweeper. Runs until the shutdown signal flips; each pass
    /// drops expired entries from every region.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.sessions.sweep()
                        + self.turns.sweep()
                        + self.user_sessions.sweep()
                        + self.session_turns.sweep();
                    if removed > 0 {
                        debug!(removed, "cache sweep dropped expired entries");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
