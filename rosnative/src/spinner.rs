//! The spinner decouples socket I/O timing from user callback timing.
//!
//! Each registered client (one per publication or subscription) gets a
//! bounded queue of wire payloads and an optional minimum interval between
//! dispatches. A single ticking task drains eligible queues and hands each
//! client its whole batch in push order; the tick stays disarmed while
//! nothing is queued.

use abort_on_drop::ChildTask;
use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

pub(crate) const DEFAULT_SPIN_RATE_HZ: u32 = 200;

/// All payloads a client had queued at dispatch time, in push order.
pub(crate) type Batch = Vec<Vec<u8>>;

struct ClientQueue {
    queue: VecDeque<Vec<u8>>,
    /// Bound on queued payloads; 0 means unbounded.
    queue_size: usize,
    throttle: Duration,
    last_dispatch: Option<Instant>,
    sink: mpsc::UnboundedSender<Batch>,
}

#[derive(Clone)]
pub(crate) struct Spinner {
    clients: Arc<Mutex<HashMap<String, ClientQueue>>>,
    wake: Arc<Notify>,
    _spin_task: Arc<ChildTask<()>>,
}

impl Spinner {
    pub(crate) fn new(spin_rate_hz: u32) -> Self {
        let clients: Arc<Mutex<HashMap<String, ClientQueue>>> = Arc::new(Mutex::new(HashMap::new()));
        let wake = Arc::new(Notify::new());
        let period = Duration::from_secs_f64(1.0 / f64::from(spin_rate_hz.max(1)));
        let spin_task = tokio::spawn(Self::spin_task(clients.clone(), wake.clone(), period));
        Self {
            clients,
            wake,
            _spin_task: Arc::new(spin_task.into()),
        }
    }

    /// Registers a client queue under a stable id.
    ///
    /// Dispatched batches are sent to `sink`; the receiving end is owned by
    /// the publication/subscription so callback delivery stays on a single
    /// task per endpoint.
    pub(crate) fn register(
        &self,
        id: &str,
        queue_size: usize,
        throttle_ms: u64,
        sink: mpsc::UnboundedSender<Batch>,
    ) {
        let previous = self.clients.lock().unwrap().insert(
            id.to_string(),
            ClientQueue {
                queue: VecDeque::new(),
                queue_size,
                throttle: Duration::from_millis(throttle_ms),
                last_dispatch: None,
                sink,
            },
        );
        if previous.is_some() {
            warn!("Spinner client {id} re-registered, dropping its queued messages");
        }
    }

    /// Removes a client; anything still queued is discarded.
    pub(crate) fn deregister(&self, id: &str) {
        self.clients.lock().unwrap().remove(id);
    }

    /// Queues a payload for a client and arms the tick.
    ///
    /// When the queue is at capacity the OLDEST payload is dropped to make
    /// room, never the newest.
    pub(crate) fn ping(&self, id: &str, payload: Vec<u8>) {
        {
            let mut clients = self.clients.lock().unwrap();
            let Some(client) = clients.get_mut(id) else {
                debug!("Spinner ping for unregistered client {id}, dropping message");
                return;
            };
            if client.queue_size > 0 && client.queue.len() >= client.queue_size {
                client.queue.pop_front();
                trace!("Spinner queue for {id} is full, dropped the oldest message");
            }
            client.queue.push_back(payload);
        }
        self.wake.notify_one();
    }

    async fn spin_task(
        clients: Arc<Mutex<HashMap<String, ClientQueue>>>,
        wake: Arc<Notify>,
        period: Duration,
    ) {
        loop {
            // Stay disarmed until some client has work queued
            loop {
                let armed = clients
                    .lock()
                    .unwrap()
                    .values()
                    .any(|client| !client.queue.is_empty());
                if armed {
                    break;
                }
                wake.notified().await;
            }

            tokio::time::sleep(period).await;

            let now = Instant::now();
            let mut dispatches: Vec<(mpsc::UnboundedSender<Batch>, Batch)> = Vec::new();
            {
                let mut clients = clients.lock().unwrap();
                for client in clients.values_mut() {
                    if client.queue.is_empty() {
                        continue;
                    }
                    let eligible = client
                        .last_dispatch
                        .map_or(true, |last| now.duration_since(last) >= client.throttle);
                    if !eligible {
                        continue;
                    }
                    client.last_dispatch = Some(now);
                    dispatches.push((client.sink.clone(), client.queue.drain(..).collect()));
                }
            }
            for (sink, batch) in dispatches {
                // A closed sink means the endpoint is mid-teardown; it will
                // deregister itself
                let _ = sink.send(batch);
            }
        }
    }
}
