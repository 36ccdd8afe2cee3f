//! Collapses concurrent loads for the same key into a single execution.
//!
//! When a cache misses, every concurrent caller would otherwise hammer the origin (or a peer)
//! with an identical request. The [SingleFlight](SingleFlight) guard ensures that for each key
//! at most one load is in progress at any time: the first caller becomes the **leader** and
//! actually runs its load, everybody else arriving while that load is in flight simply waits
//! and receives a clone of the leader's result.
//!
//! The in-flight entry is removed as soon as the load completes. This is deliberate: the
//! guard only collapses concurrent waves, it never caches results. A caller arriving after
//! completion starts a fresh load.
//!
//! # Example
//! ```
//! # use hivecache::singleflight::SingleFlight;
//! # #[tokio::main]
//! # async fn main() {
//! let flights: SingleFlight<u32> = SingleFlight::new();
//!
//! // With no concurrent callers, a load simply runs...
//! let value = flights.run("answer", async { 42 }).await;
//! assert_eq!(value, 42);
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;

type Flights<T> = Mutex<HashMap<String, watch::Receiver<Option<T>>>>;

/// Guards a set of keys so that each key has at most one load in flight.
///
/// The result type has to be **Clone** as the leader's result is handed out to every waiter.
/// For fallible loads this is typically a **Result** whose error side is cheap to clone
/// (e.g. wrapped in an **Arc**).
pub struct SingleFlight<T> {
    flights: Flights<T>,
}

impl<T: Clone> SingleFlight<T> {
    /// Creates a new guard with no in-flight loads.
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the given load for the given key, unless one is already in flight.
    ///
    /// The first caller for a key executes its **load** future and its result is broadcast to
    /// every caller which arrives before that execution completes (their own **load** futures
    /// are dropped unpolled). Once the result has been delivered, the key is forgotten and the
    /// next call starts over.
    ///
    /// If a leader is dropped before producing a result (its task was aborted), the waiters
    /// observe the vanished flight and race to lead a fresh one, so an abandoned load never
    /// wedges a key.
    pub async fn run(&self, key: &str, load: impl Future<Output = T>) -> T {
        let publisher = loop {
            let mut flight = {
                let mut flights = self.flights.lock().unwrap();
                match flights.get(key) {
                    Some(flight) => flight.clone(),
                    None => {
                        let (publisher, flight) = watch::channel(None);
                        let _ = flights.insert(key.to_owned(), flight);
                        break publisher;
                    }
                }
            };

            // Note that the map lock is released here: waiting must never block other keys
            // or the leader's cleanup.
            loop {
                if let Some(result) = flight.borrow_and_update().clone() {
                    return result;
                }
                if flight.changed().await.is_err() {
                    match flight.borrow().clone() {
                        Some(result) => return result,
                        // The leader vanished without publishing a result, so we return to
                        // the outer loop and try to lead ourselves...
                        None => break,
                    }
                }
            }
        };

        // We are the leader: run the load with the map lock released, publish the result and
        // forget the flight (in this order, see Cleanup).
        let _cleanup = Cleanup {
            flights: &self.flights,
            key,
        };
        let result = load.await;
        let _ = publisher.send(Some(result.clone()));
        result
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

/// Removes the in-flight entry for a key once its leader is done (or gone).
///
/// Running this in a Drop impl ensures the entry also disappears if the leader's task is
/// aborted mid-load, which in turn unblocks all waiters.
struct Cleanup<'a, T> {
    flights: &'a Flights<T>,
    key: &'a str,
}

impl<T> Drop for Cleanup<'_, T> {
    fn drop(&mut self) {
        let _ = self.flights.lock().unwrap().remove(self.key);
    }
}
