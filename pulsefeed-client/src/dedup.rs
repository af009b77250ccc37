//! In-flight request coalescing
//!
//! Concurrent callers asking for the same key share one execution. The first
//! caller installs a shared future in the in-flight map; everyone arriving
//! before it resolves awaits a clone of that future and receives the same
//! success or error.
//!
//! The work itself runs on its own task, so a caller going away does not stall
//! the others. Each caller holds a waiter guard; when the last guard is dropped
//! before completion the work is aborted and the entry removed.

use crate::cache::CacheValue;
use crate::error::{ClientError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
    waiters: usize,
    abort: AbortHandle,
}

type InFlightMap<T> = DashMap<String, InFlight<T>>;

/// Coalesces concurrent requests for the same key
pub struct RequestDeduplicator<T: Clone + Send + Sync + 'static = CacheValue> {
    in_flight: Arc<InFlightMap<T>>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Join the in-flight request for `key`, or start one with `producer`
    ///
    /// `producer` is only called when no request for `key` is in flight. The
    /// lookup and the install happen under the same map-slot lock.
    pub async fn join_or_start<F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (outcome, mut guard, driver) = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let flight = occupied.get_mut();
                flight.waiters += 1;
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight request {} ({} waiters)", key, flight.waiters);

                let guard = WaiterGuard::new(self.in_flight.clone(), key, flight.id);
                (flight.outcome.clone(), guard, None)
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (abort, registration) = AbortHandle::new_pair();
                let work = Abortable::new(producer(), registration);

                let map = self.in_flight.clone();
                let owned_key = key.to_string();
                let outcome = async move {
                    let result = match work.await {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::Cancelled(owned_key.clone())),
                    };
                    // Release the key before any waiter observes the result
                    map.remove_if(&owned_key, |_, flight| flight.id == id);
                    result
                }
                .boxed()
                .shared();

                vacant.insert(InFlight {
                    id,
                    outcome: outcome.clone(),
                    waiters: 1,
                    abort,
                });
                self.started.fetch_add(1, Ordering::Relaxed);
                debug!("Started request {}", key);

                let guard = WaiterGuard::new(self.in_flight.clone(), key, id);
                (outcome.clone(), guard, Some(outcome))
            }
        };

        if let Some(driver) = driver {
            tokio::spawn(driver);
        }

        let result = outcome.await;
        guard.completed = true;
        result
    }

    /// Number of keys with a request in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Callers currently waiting on `key`
    pub fn waiters(&self, key: &str) -> usize {
        self.in_flight.get(key).map(|f| f.waiters).unwrap_or(0)
    }

    /// Requests that actually started work
    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that attached to someone else's request
    pub fn joined_count(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

/// Tracks one caller's interest in an in-flight request
struct WaiterGuard<T: Clone> {
    map: Arc<InFlightMap<T>>,
    key: String,
    id: u64,
    completed: bool,
}

impl<T: Clone> WaiterGuard<T> {
    fn new(map: Arc<InFlightMap<T>>, key: &str, id: u64) -> Self {
        Self {
            map,
            key: key.to_string(),
            id,
            completed: false,
        }
    }
}

impl<T: Clone> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let mut abandoned = None;
        if let Entry::Occupied(mut occupied) = self.map.entry(self.key.clone()) {
            if occupied.get().id == self.id {
                let flight = occupied.get_mut();
                flight.waiters = flight.waiters.saturating_sub(1);
                if flight.waiters == 0 {
                    abandoned = Some(occupied.remove().abort);
                }
            }
        }

        if let Some(abort) = abandoned {
            debug!("Last waiter left {}, aborting request", self.key);
            abort.abort();
        }
    }
}
