//! Request deduplication and the concurrency gate in front of the comment API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

enum Slot<T> {
    Pending,
    Done(T),
    Abandoned,
}

struct Flight<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            match &*slot {
                Slot::Pending => self.ready.wait(&mut slot),
                Slot::Done(value) => return Some(value.clone()),
                Slot::Abandoned => return None,
            }
        }
    }

    fn finish(&self, next: Slot<T>) {
        *self.slot.lock() = next;
        self.ready.notify_all();
    }
}

/// At most one execution per key at a time; concurrent callers for the same
/// key share the leader's result.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, Arc<Flight<T>>>>,
    shared: AtomicUsize,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            shared: AtomicUsize::new(0),
        }
    }
}

struct Leader<'a, T: Clone> {
    owner: &'a SingleFlight<T>,
    key: &'a str,
    flight: Arc<Flight<T>>,
    done: bool,
}

impl<T: Clone> Drop for Leader<'_, T> {
    fn drop(&mut self) {
        self.owner.inflight.lock().remove(self.key);
        if !self.done {
            self.flight.finish(Slot::Abandoned);
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless an identical key is already in flight. The flag is
    /// `true` when the value came from another caller's execution.
    pub fn run<F>(&self, key: &str, work: F) -> (T, bool)
    where
        F: FnOnce() -> T,
    {
        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    inflight.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        if !leader {
            self.shared.fetch_add(1, Ordering::Relaxed);
            if let Some(value) = flight.wait() {
                return (value, true);
            }
            // the leader unwound before producing a value
            return self.run(key, work);
        }

        let mut guard = Leader {
            owner: self,
            key,
            flight,
            done: false,
        };
        let value = work();
        guard.flight.finish(Slot::Done(value.clone()));
        guard.done = true;
        (value, false)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn shared_count(&self) -> usize {
        self.shared.load(Ordering::Relaxed)
    }
}

/// Bounds the number of simultaneous requests. Callers beyond the limit poll
/// until a slot frees.
pub struct ConcurrencyGate {
    limit: usize,
    poll: Duration,
    active: Mutex<usize>,
}

pub struct GateSlot<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for GateSlot<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock();
        *active = active.saturating_sub(1);
    }
}

impl ConcurrencyGate {
    pub fn new(limit: usize, poll: Duration) -> Self {
        Self {
            limit: limit.max(1),
            poll,
            active: Mutex::new(0),
        }
    }

    pub fn acquire(&self) -> GateSlot<'_> {
        loop {
            {
                let mut active = self.active.lock();
                if *active < self.limit {
                    *active += 1;
                    return GateSlot { gate: self };
                }
            }
            thread::sleep(self.poll);
        }
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}
