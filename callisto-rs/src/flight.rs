//! Provides the per-key coalescer which deduplicates concurrent loads.
//!
//! When several tasks miss the cache for the same key at the same time, only the first one may
//! actually consult the backing source - everybody else attaches to the in-flight call and
//! receives the very same result. Once the call completes its record is removed, so a retry
//! for a failed key starts a fresh load immediately.
//!
//! The map of in-flight calls is guarded by a plain mutex which is only held to attach or
//! create a record - the actual work always runs with no lock held. Completion is published
//! through a watch channel, a latch which transitions from pending to resolved exactly once
//! and provides the required happens-before between the final write of the result and every
//! waiter's read.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

/// Coalesces concurrent invocations of the same keyed work.
///
/// # Examples
/// ```
/// # use callisto::flight::SingleFlight;
/// # use std::sync::Arc;
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # #[tokio::main]
/// # async fn main() {
/// let flight = Arc::new(SingleFlight::new());
/// let calls = Arc::new(AtomicUsize::new(0));
///
/// let mut tasks = Vec::new();
/// for _ in 0..10 {
///     let flight = flight.clone();
///     let calls = calls.clone();
///     tasks.push(tokio::spawn(async move {
///         flight
///             .execute("answer", async move {
///                 calls.fetch_add(1, Ordering::SeqCst);
///                 tokio::time::sleep(std::time::Duration::from_millis(20)).await;
///                 42
///             })
///             .await
///             .unwrap()
///     }));
/// }
///
/// for task in tasks {
///     assert_eq!(task.await.unwrap(), 42);
/// }
/// assert_eq!(calls.load(Ordering::SeqCst), 1);
/// # }
/// ```
pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

/// Removes the in-flight record once the leader is done - or gone.
///
/// Dropping the guard without a published result closes the watch channel, which releases
/// every waiter with an error instead of leaving it parked forever.
struct FlightGuard<'a, T> {
    flights: &'a Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
    key: &'a str,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.flights.lock().unwrap().remove(self.key);
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

impl<T: Clone> SingleFlight<T> {
    /// Creates a coalescer with no calls in flight.
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Runs **work** unless a call for the same key is already in flight, in which case the
    /// result of that call is awaited and returned instead.
    ///
    /// Returns an error only if the in-flight call vanished without publishing a result,
    /// which happens when the leading task was cancelled or panicked. The work itself cannot
    /// fail from the coalescer's point of view - put a `Result` into `T` for fallible loads.
    pub async fn execute<F>(&self, key: &str, work: F) -> anyhow::Result<T>
    where
        F: Future<Output = T>,
    {
        let role = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key) {
                Some(receiver) => Role::Waiter(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    let _ = flights.insert(key.to_owned(), receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Leader(sender) => {
                // Remove the record when leaving this scope, no matter how. The guard is
                // created before the work runs so that a cancelled leader cannot leak its
                // record and block the key forever.
                let _cleanup = FlightGuard {
                    flights: &self.flights,
                    key,
                };

                let value = work.await;
                let _ = sender.send(Some(value.clone()));

                Ok(value)
            }
            Role::Waiter(mut receiver) => loop {
                // The borrow must not be held across the await below, hence the clone.
                let published = (*receiver.borrow_and_update()).clone();
                if let Some(value) = published {
                    return Ok(value);
                }

                if receiver.changed().await.is_err() {
                    return Err(anyhow::anyhow!(
                        "The coalesced load for '{}' was aborted before it produced a result.",
                        key
                    ));
                }
            },
        }
    }

    /// Returns the number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().unwrap().len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight::new()
    }
}
