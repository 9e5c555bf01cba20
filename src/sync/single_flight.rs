//! Per-key single-flight execution.
//!
//! At most one operation runs per key. Intents submitted while one is in
//! flight wait in a single queue slot; a newer intent replaces a queued one,
//! so when the in-flight call returns the runner picks up the latest intent.
//! Completions for a key therefore arrive in submission order and the last
//! submitted intent is always the last one executed.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::debug;

pub type FlightFuture<T, E> = BoxFuture<'static, Result<T, E>>;

#[derive(Debug, Clone, PartialEq)]
pub enum FlightOutcome<T, E> {
    Completed(Result<T, E>),
    /// A newer intent for the same key replaced this one before it ran.
    Superseded,
}

/// Receipt for a submitted intent. Dropping it does not cancel anything.
pub struct FlightTicket<T, E> {
    rx: oneshot::Receiver<FlightOutcome<T, E>>,
}

impl<T, E> FlightTicket<T, E> {
    pub async fn outcome(self) -> FlightOutcome<T, E> {
        // A runner that went away without replying never executed this intent.
        self.rx.await.unwrap_or(FlightOutcome::Superseded)
    }
}

struct Waiting<I, T, E> {
    intent: I,
    reply: oneshot::Sender<FlightOutcome<T, E>>,
}

struct Lane<I, T, E> {
    queued: Option<Waiting<I, T, E>>,
}

type Lanes<K, I, T, E> = Arc<Mutex<HashMap<K, Lane<I, T, E>>>>;
type Operation<K, I, T, E> = Arc<dyn Fn(K, I) -> FlightFuture<T, E> + Send + Sync>;

pub struct SingleFlight<K, I, T, E> {
    lanes: Lanes<K, I, T, E>,
    operation: Operation<K, I, T, E>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, I, T, E> SingleFlight<K, I, T, E>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(operation: F) -> Self
    where
        F: Fn(K, I) -> FlightFuture<T, E> + Send + Sync + 'static,
    {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            operation: Arc::new(operation),
        }
    }

    /// Submits an intent for `key`. Runs it right away when the key is idle,
    /// otherwise parks it behind the in-flight call.
    pub fn submit(&self, key: K, intent: I) -> FlightTicket<T, E> {
        let (reply, rx) = oneshot::channel();
        let waiting = Waiting { intent, reply };

        let mut lanes = lock(&self.lanes);
        match lanes.get_mut(&key) {
            Some(lane) => {
                debug!("Queueing intent behind in-flight call for {:?}", key);
                if let Some(previous) = lane.queued.replace(waiting) {
                    let _ = previous.reply.send(FlightOutcome::Superseded);
                }
            }
            None => {
                lanes.insert(key.clone(), Lane { queued: None });
                drop(lanes);
                self.spawn_runner(key, waiting);
            }
        }

        FlightTicket { rx }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.lanes).contains_key(key)
    }

    pub fn has_queued(&self, key: &K) -> bool {
        lock(&self.lanes)
            .get(key)
            .map(|lane| lane.queued.is_some())
            .unwrap_or(false)
    }

    fn spawn_runner(&self, key: K, first: Waiting<I, T, E>) {
        let lanes = Arc::clone(&self.lanes);
        let operation = Arc::clone(&self.operation);

        tokio::spawn(async move {
            let mut current = first;
            loop {
                let result = operation(key.clone(), current.intent).await;
                let _ = current.reply.send(FlightOutcome::Completed(result));

                let next = {
                    let mut lanes = lock(&lanes);
                    let next = lanes.get_mut(&key).and_then(|lane| lane.queued.take());
                    if next.is_none() {
                        lanes.remove(&key);
                    }
                    next
                };

                match next {
                    Some(waiting) => current = waiting,
                    None => break,
                }
            }
        });
    }
}
