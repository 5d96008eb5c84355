use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::DomainEvent;

/// Frame pushed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A serialized domain event (JSON text).
    Event(String),
    /// Liveness probe; the writer maps this to a protocol ping.
    Ping,
    /// Reply to a client-level `ping` text frame.
    Pong,
    /// The hub is done with this connection; the writer should close.
    Close,
}

/// Per-connection lifecycle. `Closed` is terminal: a client that wants back
/// in establishes a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct ConnectionEntry {
    tx: mpsc::Sender<Frame>,
    state: ConnState,
    /// Saw a pong (or any inbound traffic) since the previous sweep.
    responsive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pinged: usize,
    pub reaped: usize,
}

/// Registry of live client connections and the fan-out path for domain
/// events. Explicitly constructed and injected; "one hub per process" is a
/// wiring decision, not a global.
///
/// All mutation and iteration goes through the single internal mutex;
/// broadcast snapshots the live set before writing so concurrent removal
/// never invalidates the iteration.
pub struct BroadcastHub {
    connections: Mutex<HashMap<Uuid, ConnectionEntry>>,
    send_buffer: usize,
    running: AtomicBool,
}

impl BroadcastHub {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            send_buffer: send_buffer.max(1),
            running: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection and hand back the frames its writer task
    /// must drain. Registering an id that is already present is a no-op
    /// returning `None`.
    pub fn register(&self, id: Uuid) -> Option<mpsc::Receiver<Frame>> {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let mut connections = self.lock();
        if connections.contains_key(&id) {
            return None;
        }
        connections.insert(
            id,
            ConnectionEntry {
                tx,
                state: ConnState::Connecting,
                responsive: true,
            },
        );
        debug!("connection {} registered ({} live)", id, connections.len());
        Some(rx)
    }

    /// The connection finished its handshake and may receive events.
    pub fn open(&self, id: Uuid) {
        if let Some(entry) = self.lock().get_mut(&id) {
            if entry.state == ConnState::Connecting {
                entry.state = ConnState::Open;
            }
        }
    }

    /// Record liveness for a connection (pong or any inbound traffic).
    pub fn mark_responsive(&self, id: Uuid) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.responsive = true;
        }
    }

    /// Remove a connection. Safe to call repeatedly or for ids that were
    /// never (or are no longer) registered.
    pub fn unregister(&self, id: Uuid) {
        let mut connections = self.lock();
        if connections.remove(&id).is_some() {
            debug!(
                "connection {} unregistered ({} live)",
                id,
                connections.len()
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Push one frame to one connection. A peer that cannot take it is
    /// removed, same as during broadcast.
    pub fn send_to(&self, id: Uuid, frame: Frame) -> bool {
        let tx = match self.lock().get(&id) {
            Some(entry) => entry.tx.clone(),
            None => return false,
        };
        if tx.try_send(frame).is_ok() {
            true
        } else {
            warn!("connection {} is dead, removing from live set", id);
            self.unregister(id);
            false
        }
    }

    /// Serialize the event once and write it to every open connection.
    /// Best-effort: a peer that cannot take the frame is removed, never
    /// surfaced to the caller. Returns how many connections were written.
    pub fn broadcast(&self, event: &DomainEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize domain event: {}", e);
                return 0;
            }
        };

        // Snapshot, then write without holding the lock.
        let snapshot: Vec<(Uuid, ConnState, mpsc::Sender<Frame>)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.state, entry.tx.clone()))
            .collect();

        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for (id, state, tx) in snapshot {
            match state {
                ConnState::Open => {
                    if tx.try_send(Frame::Event(payload.clone())).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(id);
                    }
                }
                // Still handshaking; it will catch later events.
                ConnState::Connecting => {}
                ConnState::Closing | ConnState::Closed => dead.push(id),
            }
        }

        for id in dead {
            warn!("connection {} is dead, removing from live set", id);
            self.unregister(id);
        }
        delivered
    }

    /// One liveness pass: reap connections that never answered the previous
    /// probe, probe the rest. Bounds the live set to peers that are actually
    /// reachable.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut reap = Vec::new();

        {
            let mut connections = self.lock();
            for (id, entry) in connections.iter_mut() {
                if entry.state == ConnState::Open && !entry.responsive {
                    entry.state = ConnState::Closing;
                    reap.push((*id, entry.tx.clone()));
                    continue;
                }
                entry.responsive = false;
                if entry.state == ConnState::Open {
                    if entry.tx.try_send(Frame::Ping).is_ok() {
                        stats.pinged += 1;
                    } else {
                        entry.state = ConnState::Closing;
                        reap.push((*id, entry.tx.clone()));
                    }
                }
            }
        }

        for (id, tx) in reap {
            // Best-effort close; the writer may already be gone.
            let _ = tx.try_send(Frame::Close);
            self.unregister(id);
            stats.reaped += 1;
        }

        if stats.reaped > 0 {
            info!("liveness sweep reaped {} dead connection(s)", stats.reaped);
        }
        stats
    }

    /// Spawn the periodic liveness sweep. Runs until `shutdown`.
    pub fn start_sweeper(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        let period = Duration::from_secs(interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !hub.running.load(Ordering::Acquire) {
                    break;
                }
                hub.sweep();
            }
        })
    }

    /// Stop the sweeper and close every connection.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let drained: Vec<(Uuid, mpsc::Sender<Frame>)> = {
            let mut connections = self.lock();
            connections
                .drain()
                .map(|(id, entry)| (id, entry.tx))
                .collect()
        };
        for (id, tx) in drained {
            let _ = tx.try_send(Frame::Close);
            debug!("connection {} closed at shutdown", id);
        }
    }
}
