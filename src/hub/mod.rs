//! Fan-out hub: bounded session membership and per-record dispatch.
//!
//! One event-loop task owns the session set; membership never changes
//! outside it. Register, unregister and broadcast all arrive on channels,
//! and the broadcast channel is bounded so a stalled hub fills the channel
//! instead of blocking the ingest side.

pub mod filter;
pub mod protocol;
pub mod rate;
pub mod session;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::model::RawLogEntry;
use session::Session;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_clients: usize,
    pub broadcast_capacity: usize,
    pub session_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 20,
            broadcast_capacity: 1024,
            session_queue_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected: usize,
    pub max_clients: usize,
    pub queued_in_broadcast: usize,
    pub cumulative_drops: u64,
}

struct HubShared {
    max_clients: usize,
    connected: AtomicUsize,
    dropped_broadcasts: AtomicU64,
    next_session_id: AtomicU64,
}

/// Cheap handle onto the hub event loop.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::UnboundedSender<u64>,
    broadcast_tx: mpsc::Sender<Arc<RawLogEntry>>,
    broadcast_capacity: usize,
    session_queue_capacity: usize,
    shared: Arc<HubShared>,
}

impl Hub {
    /// Start the event loop. It runs until `shutdown` fires, then drains
    /// every remaining session.
    pub fn spawn(config: &HubConfig, shutdown: broadcast::Receiver<()>) -> Self {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);

        let shared = Arc::new(HubShared {
            max_clients: config.max_clients,
            connected: AtomicUsize::new(0),
            dropped_broadcasts: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
        });

        tokio::spawn(run_event_loop(
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown,
            shared.clone(),
        ));

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            broadcast_capacity: config.broadcast_capacity,
            session_queue_capacity: config.session_queue_capacity,
            shared,
        }
    }

    /// Create a session wired for this hub. The caller owns the returned
    /// queue receiver and must run the write pump over it.
    pub fn new_session(&self) -> (Arc<Session>, mpsc::Receiver<String>) {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        Session::new(id, self.session_queue_capacity)
    }

    /// Submit a session to the event loop. Over-cap sessions are refused
    /// there: their outbound queue is closed, which ends their write pump.
    pub async fn register(&self, session: Arc<Session>) {
        if self.register_tx.send(session).await.is_err() {
            warn!("hub is down, cannot register session");
        }
    }

    pub fn unregister(&self, session_id: u64) {
        let _ = self.unregister_tx.send(session_id);
    }

    /// Non-blocking broadcast. A full (or closed) channel drops the record
    /// and bumps the hub drop counter; the producer is never delayed.
    pub fn try_broadcast(&self, entry: RawLogEntry) {
        if self.broadcast_tx.try_send(Arc::new(entry)).is_err() {
            self.shared.dropped_broadcasts.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_broadcast_drop();
            debug!("broadcast channel full, dropping record");
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn max_clients(&self) -> usize {
        self.shared.max_clients
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected: self.client_count(),
            max_clients: self.shared.max_clients,
            queued_in_broadcast: self
                .broadcast_capacity
                .saturating_sub(self.broadcast_tx.capacity()),
            cumulative_drops: self.shared.dropped_broadcasts.load(Ordering::Relaxed),
        }
    }
}

async fn run_event_loop(
    mut register_rx: mpsc::Receiver<Arc<Session>>,
    mut unregister_rx: mpsc::UnboundedReceiver<u64>,
    mut broadcast_rx: mpsc::Receiver<Arc<RawLogEntry>>,
    mut shutdown: broadcast::Receiver<()>,
    shared: Arc<HubShared>,
) {
    let mut sessions: HashMap<u64, Arc<Session>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            Some(session) = register_rx.recv() => {
                if sessions.len() >= shared.max_clients {
                    warn!(
                        max_clients = shared.max_clients,
                        "session limit reached, refusing new session"
                    );
                    session.begin_drain();
                    continue;
                }
                info!(
                    session = session.id(),
                    connected = sessions.len() + 1,
                    max = shared.max_clients,
                    "session registered"
                );
                sessions.insert(session.id(), session);
                shared.connected.store(sessions.len(), Ordering::Relaxed);
            }

            Some(id) = unregister_rx.recv() => {
                if let Some(session) = sessions.remove(&id) {
                    session.begin_drain();
                    shared.connected.store(sessions.len(), Ordering::Relaxed);
                    info!(
                        session = id,
                        connected = sessions.len(),
                        max = shared.max_clients,
                        "session unregistered"
                    );
                }
            }

            Some(entry) = broadcast_rx.recv() => {
                // Offer never blocks (filter match + try_send), so inline
                // dispatch keeps per-session ordering without letting a
                // stalled consumer delay its peers. The event is consumed
                // once dispatch completes.
                for session in sessions.values() {
                    session.offer(&entry);
                }
            }

            else => break,
        }
    }

    for (_, session) in sessions.drain() {
        session.begin_drain();
    }
    shared.connected.store(0, Ordering::Relaxed);
    info!("hub event loop stopped");
}
