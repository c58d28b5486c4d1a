//! Signals and the asynchronous handler thread.
//!
//! A signal is a 64-bit value that producers, consumers and the driver use to report progress.
//! Every mutation of a [`HostSignal`] rings a runtime-wide bell so blocked waiters and the handler
//! thread re-check their conditions; nothing is missed because a waiter samples the bell's
//! generation before it samples the value.

use crate::error::RuntimeError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Handle value meaning "no signal" inside packets.
pub const NULL_SIGNAL: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Gte,
}

impl Condition {
    pub fn holds(self, value: i64, compare: i64) -> bool {
        match self {
            Self::Eq => value == compare,
            Self::Ne => value != compare,
            Self::Lt => value < compare,
            Self::Gte => value >= compare,
        }
    }
}

/// Anything that can be loaded and stored like a signal: host signals, queue doorbells, proxy
/// queues.
pub trait Signal: Send + Sync {
    fn load(&self, order: Ordering) -> i64;
    fn store(&self, value: i64, order: Ordering);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Bell {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Bell {
    fn ring(&self) {
        *lock(&self.generation) += 1;
        self.cond.notify_all();
    }

    fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Blocks until the generation moves past `seen` or `deadline` passes.
    fn wait_past(&self, seen: u64, deadline: Option<Instant>) {
        let mut generation = lock(&self.generation);
        while *generation == seen {
            match deadline {
                None => {
                    generation = self
                        .cond
                        .wait(generation)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    generation = self
                        .cond
                        .wait_timeout(generation, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }
}

pub struct HostSignal {
    handle: u64,
    value: AtomicI64,
    bell: Arc<Bell>,
}

impl HostSignal {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    fn rmw(&self, f: impl FnOnce(&AtomicI64) -> i64) -> i64 {
        let prev = f(&self.value);
        self.bell.ring();
        prev
    }

    pub fn add(&self, v: i64, order: Ordering) -> i64 {
        self.rmw(|a| a.fetch_add(v, order))
    }

    pub fn sub(&self, v: i64, order: Ordering) -> i64 {
        self.rmw(|a| a.fetch_sub(v, order))
    }

    pub fn and(&self, v: i64, order: Ordering) -> i64 {
        self.rmw(|a| a.fetch_and(v, order))
    }

    pub fn or(&self, v: i64, order: Ordering) -> i64 {
        self.rmw(|a| a.fetch_or(v, order))
    }

    pub fn exchange(&self, v: i64, order: Ordering) -> i64 {
        self.rmw(|a| a.swap(v, order))
    }

    /// Returns the value observed; the swap happened iff it equals `expected`.
    pub fn compare_exchange(&self, expected: i64, v: i64, order: Ordering) -> i64 {
        let observed = match self.value.compare_exchange(expected, v, order, Ordering::Acquire) {
            Ok(prev) => {
                self.bell.ring();
                prev
            }
            Err(actual) => actual,
        };
        observed
    }

    /// Blocks until `condition` holds against `compare` or `timeout` elapses; returns the last
    /// value observed.
    pub fn wait(&self, condition: Condition, compare: i64, timeout: Option<Duration>) -> i64 {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.bell.generation();
            let value = self.value.load(Ordering::Acquire);
            if condition.holds(value, compare) {
                return value;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return value;
            }
            self.bell.wait_past(seen, deadline);
        }
    }
}

impl Signal for HostSignal {
    fn load(&self, order: Ordering) -> i64 {
        self.value.load(order)
    }

    fn store(&self, value: i64, order: Ordering) {
        self.value.store(value, order);
        self.bell.ring();
    }
}

impl core::fmt::Debug for HostSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostSignal")
            .field("handle", &self.handle)
            .field("value", &self.value.load(Ordering::Relaxed))
            .finish()
    }
}

/// Runs on the handler thread with the value that satisfied the wait. Returning `true` keeps the
/// handler armed with the same condition.
pub type AsyncHandler = Box<dyn FnMut(i64) -> bool + Send>;

struct Armed {
    signal: Arc<HostSignal>,
    condition: Condition,
    compare: i64,
    callback: AsyncHandler,
}

struct Shared {
    bell: Arc<Bell>,
    table: Mutex<HashMap<u64, Weak<HostSignal>>>,
    handlers: Mutex<Vec<Armed>>,
    next_handle: AtomicU64,
    shutdown: AtomicBool,
}

/// Signal table plus the single thread that runs asynchronous handlers, one at a time.
pub struct SignalRuntime {
    shared: Arc<Shared>,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SignalRuntime {
    pub fn new() -> Result<Arc<Self>, RuntimeError> {
        let shared = Arc::new(Shared {
            bell: Arc::new(Bell::default()),
            table: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });

        let worker = thread::Builder::new()
            .name("aql-signal-handler".into())
            .spawn({
                let shared = shared.clone();
                move || run_handlers(&shared)
            })
            .map_err(|_| RuntimeError::OutOfResources("signal handler thread"))?;

        Ok(Arc::new(Self {
            shared,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn create_signal(&self, initial: i64) -> Arc<HostSignal> {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(HostSignal {
            handle,
            value: AtomicI64::new(initial),
            bell: self.shared.bell.clone(),
        });
        let mut table = lock(&self.shared.table);
        table.retain(|_, weak| weak.strong_count() > 0);
        table.insert(handle, Arc::downgrade(&signal));
        signal
    }

    pub fn lookup(&self, handle: u64) -> Option<Arc<HostSignal>> {
        if handle == NULL_SIGNAL {
            return None;
        }
        lock(&self.shared.table).get(&handle).and_then(Weak::upgrade)
    }

    /// Arms `callback` to run once `condition` holds for `signal` against `compare`.
    pub fn set_async_handler(
        &self,
        signal: &Arc<HostSignal>,
        condition: Condition,
        compare: i64,
        callback: impl FnMut(i64) -> bool + Send + 'static,
    ) -> Result<(), RuntimeError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RuntimeError::Unsupported("signal runtime is shutting down"));
        }
        lock(&self.shared.handlers).push(Armed {
            signal: signal.clone(),
            condition,
            compare,
            callback: Box::new(callback),
        });
        self.shared.bell.ring();
        Ok(())
    }

    /// Whether the caller is the handler thread.
    pub fn is_handler_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn armed_handlers(&self) -> usize {
        lock(&self.shared.handlers).len()
    }
}

impl Drop for SignalRuntime {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.bell.ring();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            // The last owner may be a handler; it cannot join itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_handlers(shared: &Shared) {
    loop {
        let seen = shared.bell.generation();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let ready: Vec<(Armed, i64)> = {
            let mut handlers = lock(&shared.handlers);
            let mut ready = Vec::new();
            let mut i = 0;
            while i < handlers.len() {
                let h = &handlers[i];
                let value = h.signal.value.load(Ordering::Acquire);
                if h.condition.holds(value, h.compare) {
                    ready.push((handlers.remove(i), value));
                } else {
                    i += 1;
                }
            }
            ready
        };

        if ready.is_empty() {
            shared.bell.wait_past(seen, None);
            continue;
        }

        for (mut armed, value) in ready {
            if (armed.callback)(value) {
                lock(&shared.handlers).push(armed);
            }
        }
    }

    // Handlers own closures that may own queues; drop them outside the lock.
    let leftover = std::mem::take(&mut *lock(&shared.handlers));
    drop(leftover);
    tracing::debug!("signal handler thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn wait_returns_once_condition_holds() {
        let rt = SignalRuntime::new().unwrap();
        let s = rt.create_signal(3);
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.wait(Condition::Eq, 0, None))
        };
        s.sub(1, Ordering::Release);
        s.sub(2, Ordering::Release);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn wait_times_out_with_last_value() {
        let rt = SignalRuntime::new().unwrap();
        let s = rt.create_signal(5);
        let v = s.wait(Condition::Lt, 0, Some(Duration::from_millis(10)));
        assert_eq!(v, 5);
    }

    #[test]
    fn lookup_follows_lifetime() {
        let rt = SignalRuntime::new().unwrap();
        let s = rt.create_signal(0);
        let handle = s.handle();
        assert!(rt.lookup(handle).is_some());
        drop(s);
        assert!(rt.lookup(handle).is_none());
        assert!(rt.lookup(NULL_SIGNAL).is_none());
    }

    #[test]
    fn handler_rearms_until_it_declines() {
        let rt = SignalRuntime::new().unwrap();
        let s = rt.create_signal(0);
        let (tx, rx) = mpsc::channel();
        let sig = s.clone();
        rt.set_async_handler(&s, Condition::Ne, 0, move |v| {
            sig.store(0, Ordering::Relaxed);
            tx.send(v).unwrap();
            v < 3
        })
        .unwrap();

        for v in 1..=4 {
            s.store(v, Ordering::Release);
            if v <= 3 {
                assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), v);
            }
        }
        // Declined after 3: the store of 4 goes unanswered.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(rt.armed_handlers(), 0);
    }

    #[test]
    fn handler_thread_is_identified() {
        let rt = SignalRuntime::new().unwrap();
        let s = rt.create_signal(1);
        let (tx, rx) = mpsc::channel();
        let rt2 = Arc::downgrade(&rt);
        rt.set_async_handler(&s, Condition::Ne, 0, move |_| {
            let on_worker = rt2.upgrade().map(|rt| rt.is_handler_thread());
            tx.send(on_worker).unwrap();
            false
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(true));
        assert!(!rt.is_handler_thread());
    }
}
