//! Kolibri event queue: a deduplicating work queue keyed by resource identity.
//!
//! Each key is in at most one of three states (ready, processing, delayed).
//! A key re-added while it is being processed is marked for requeue and
//! re-admitted as soon as the worker calls [`EventQueue::done`].

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kolibri_core::{EventKind, ResourceKey, WorkItem};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub mod limiter;

pub use limiter::{BackoffConfig, ExponentialBackoff, MaxOf, RateLimiter, TokenBucket};

/// Externally visible state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Ready,
    Processing,
    Delayed,
}

#[derive(Debug, Clone, Copy)]
enum Requeue {
    Now(EventKind),
    After(EventKind, Instant),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Ready(EventKind),
    Processing { requeue: Option<Requeue> },
    Delayed { kind: EventKind, at: Instant },
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    at: Instant,
    seq: u64,
    key: ResourceKey,
}

struct State {
    slots: FxHashMap<ResourceKey, Slot>,
    ready: VecDeque<ResourceKey>,
    timers: BinaryHeap<Reverse<Timer>>,
    limiter: Box<dyn RateLimiter>,
    seq: u64,
    shutting_down: bool,
}

impl State {
    fn push_ready(&mut self, key: ResourceKey, kind: EventKind) {
        self.slots.insert(key.clone(), Slot::Ready(kind));
        self.ready.push_back(key);
    }

    fn push_delayed(&mut self, key: ResourceKey, kind: EventKind, at: Instant) {
        self.seq = self.seq.wrapping_add(1);
        self.slots.insert(key.clone(), Slot::Delayed { kind, at });
        self.timers.push(Reverse(Timer { at, seq: self.seq, key }));
    }

    /// Move delayed keys whose time has come to the ready sequence.
    /// Timers left behind by keys that moved on are discarded here.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0usize;
        while let Some(Reverse(timer)) = self.timers.peek() {
            if timer.at > now {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else { break };
            if let Some(Slot::Delayed { kind, at }) = self.slots.get(&timer.key).copied() {
                if at == timer.at {
                    self.push_ready(timer.key, kind);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> { self.timers.peek().map(|Reverse(t)| t.at) }

    fn take_ready(&mut self) -> Option<WorkItem> {
        while let Some(key) = self.ready.pop_front() {
            if let Some(Slot::Ready(kind)) = self.slots.get(&key).copied() {
                self.slots.insert(key.clone(), Slot::Processing { requeue: None });
                return Some(WorkItem { key, kind });
            }
        }
        None
    }
}

/// Rate-limited work queue shared by a handler's notification adapter and its workers.
pub struct EventQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                slots: FxHashMap::default(),
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                limiter,
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue with the default controller limiter (see [`BackoffConfig`]).
    pub fn with_default_limiter(name: impl Into<String>) -> Self { Self::new(name, BackoffConfig::default().build()) }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn report_depth(&self, st: &State) {
        gauge!("kolibri_queue_depth", st.ready.len() as f64, "queue" => self.name.clone());
    }

    /// Enqueue `item`. A key already ready keeps its position and takes the
    /// newer kind; a key being processed is re-admitted after `done`; a
    /// delayed key becomes ready now. Never touches the retry counter.
    pub fn add(&self, item: WorkItem) {
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = %self.name, key = %item.key, "queue: add ignored, shutting down");
            return;
        }
        counter!("kolibri_queue_adds_total", 1, "queue" => self.name.clone());
        let WorkItem { key, kind } = item;
        match st.slots.get_mut(&key) {
            Some(Slot::Ready(current)) => *current = kind,
            Some(Slot::Processing { requeue }) => *requeue = Some(Requeue::Now(kind)),
            Some(Slot::Delayed { .. }) | None => {
                st.push_ready(key, kind);
                self.notify.notify_one();
            }
        }
        self.report_depth(&st);
    }

    /// Admit `item` once `delay` has elapsed. Keys already ready stay ready;
    /// an earlier pending deadline is kept.
    pub fn add_after(&self, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let mut st = self.lock();
        self.schedule(&mut st, item, Instant::now() + delay);
    }

    /// Schedule a retry of `item` after the limiter's next delay for its key,
    /// then count the retry.
    pub fn add_rate_limited(&self, item: &WorkItem) {
        let mut st = self.lock();
        let delay = st.limiter.when(&item.key);
        counter!("kolibri_queue_retries_total", 1, "queue" => self.name.clone());
        debug!(queue = %self.name, key = %item.key, delay_ms = %delay.as_millis(), "queue: retry scheduled");
        self.schedule(&mut st, item.clone(), Instant::now() + delay);
    }

    fn schedule(&self, st: &mut State, item: WorkItem, at: Instant) {
        if st.shutting_down {
            return;
        }
        let WorkItem { key, kind } = item;
        match st.slots.get_mut(&key) {
            Some(Slot::Ready(_)) => {}
            Some(Slot::Processing { requeue }) => match requeue {
                Some(Requeue::Now(_)) => {}
                Some(Requeue::After(prev_kind, prev_at)) => {
                    *prev_kind = kind;
                    if at < *prev_at {
                        *prev_at = at;
                    }
                }
                None => *requeue = Some(Requeue::After(kind, at)),
            },
            Some(Slot::Delayed { at: prev_at, .. }) => {
                let at = at.min(*prev_at);
                st.push_delayed(key, kind, at);
                self.notify.notify_one();
            }
            None => {
                st.push_delayed(key, kind, at);
                self.notify.notify_one();
            }
        }
    }

    /// Wait for the next ready item. `None` once the queue is shut down and drained.
    /// The returned key is held as processing until [`EventQueue::done`].
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                if let Some(item) = self.take(&mut st) {
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`EventQueue::get`].
    pub fn try_get(&self) -> Option<WorkItem> {
        let mut st = self.lock();
        self.take(&mut st)
    }

    fn take(&self, st: &mut State) -> Option<WorkItem> {
        if !st.shutting_down {
            let promoted = st.promote_due(Instant::now());
            // one of them is ours; wake others for the rest
            for _ in 1..promoted {
                self.notify.notify_one();
            }
        }
        let item = st.take_ready();
        if item.is_some() {
            self.report_depth(st);
        }
        item
    }

    /// Release `key` after processing. A requeue recorded meanwhile is applied now.
    pub fn done(&self, key: &ResourceKey) {
        let mut st = self.lock();
        let requeue = match st.slots.get(key) {
            Some(Slot::Processing { requeue }) => *requeue,
            _ => return,
        };
        st.slots.remove(key);
        if st.shutting_down {
            return;
        }
        match requeue {
            Some(Requeue::Now(kind)) => {
                st.push_ready(key.clone(), kind);
                self.notify.notify_one();
            }
            Some(Requeue::After(kind, at)) => {
                st.push_delayed(key.clone(), kind, at);
                self.notify.notify_one();
            }
            None => {}
        }
        self.report_depth(&st);
    }

    /// Reset the retry counter for `key`.
    pub fn forget(&self, key: &ResourceKey) { self.lock().limiter.forget(key); }

    pub fn num_requeues(&self, key: &ResourceKey) -> u32 { self.lock().limiter.num_requeues(key) }

    /// Stop admitting work. Pending delayed retries are dropped; items already
    /// ready are still handed out, after which `get` returns `None`.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        st.timers.clear();
        st.slots.retain(|_, slot| !matches!(slot, Slot::Delayed { .. }));
        info!(queue = %self.name, ready = st.ready.len(), "queue: shutting down");
        drop(st);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().ready.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of keys in any state.
    pub fn tracked(&self) -> usize { self.lock().slots.len() }

    pub fn state_of(&self, key: &ResourceKey) -> Option<KeyState> {
        self.lock().slots.get(key).map(|slot| match slot {
            Slot::Ready(_) => KeyState::Ready,
            Slot::Processing { .. } => KeyState::Processing,
            Slot::Delayed { .. } => KeyState::Delayed,
        })
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("EventQueue")
            .field("name", &self.name)
            .field("ready", &st.ready.len())
            .field("tracked", &st.slots.len())
            .field("shutting_down", &st.shutting_down)
            .finish()
    }
}
