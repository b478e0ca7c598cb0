#![allow(clippy::mutex_atomic)] // needed for Condvar

use log::warn;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

/// Opaque application cookie attached to a batch and returned on its event.
pub type Tag = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A batch of call ops completed; `success` tells how.
    OpComplete,
    /// The queue is shut down and drained.
    Shutdown,
    /// The wait deadline passed without an event.
    QueueTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: Tag,
    pub kind: EventKind,
    pub success: bool,
}

impl Event {
    #[must_use]
    pub fn op_complete(tag: Tag, success: bool) -> Self {
        Self {
            tag,
            kind: EventKind::OpComplete,
            success,
        }
    }

    fn shutdown() -> Self {
        Self {
            tag: 0,
            kind: EventKind::Shutdown,
            success: true,
        }
    }

    fn timeout() -> Self {
        Self {
            tag: 0,
            kind: EventKind::QueueTimeout,
            success: false,
        }
    }
}

/// `Next` hands out events FIFO; `Pluck` selects by tag and only accepts
/// tags that were registered at batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    Next,
    Pluck,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    shutdown: bool,
    pluckable: HashSet<Tag>,
}

#[derive(Debug)]
struct Inner {
    kind: CompletionType,
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Thread-safe FIFO of completion events; any number of producers (framer
/// threads, timers, server workers) and consumers.
#[derive(Debug, Clone)]
pub struct CompletionQueue {
    inner: Arc<Inner>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_type(CompletionType::Next)
    }

    #[must_use]
    pub fn with_type(kind: CompletionType) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                state: Mutex::new(QueueState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn completion_type(&self) -> CompletionType {
        self.inner.kind
    }

    /// Enqueue an event. After shutdown this is a no-op; the event is
    /// dropped with a diagnostic.
    pub fn push(&self, event: Event) {
        let mut state = self.inner.state.lock().expect("completion queue lock");
        if state.shutdown {
            warn!("event {:?} dropped: completion queue is shut down", event);
            return;
        }
        state.events.push_back(event);
        self.inner.cond.notify_all();
    }

    /// Mark `tag` as pluckable. Called at batch submission for `Pluck`
    /// queues; a no-op for `Next` queues.
    pub(crate) fn register_tag(&self, tag: Tag) {
        if self.inner.kind != CompletionType::Pluck {
            return;
        }
        let mut state = self.inner.state.lock().expect("completion queue lock");
        state.pluckable.insert(tag);
    }

    /// Block until an event is available, the queue is shut down and empty,
    /// or `deadline` passes. A deadline already in the past returns
    /// `QueueTimeout` without blocking.
    pub fn next(&self, deadline: Instant) -> Event {
        if self.inner.kind != CompletionType::Next {
            warn!("next() called on a pluck-flavor completion queue");
            return Event::timeout();
        }
        let mut state = self.inner.state.lock().expect("completion queue lock");
        loop {
            if let Some(event) = state.events.pop_front() {
                return event;
            }
            if state.shutdown {
                return Event::shutdown();
            }
            let now = Instant::now();
            if now >= deadline {
                return Event::timeout();
            }
            let (next_state, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .expect("completion queue wait");
            state = next_state;
        }
    }

    /// Block until the event carrying `tag` is available. Tags that were
    /// never registered are rejected with an immediate `QueueTimeout`.
    pub fn pluck(&self, tag: Tag, deadline: Instant) -> Event {
        if self.inner.kind != CompletionType::Pluck {
            warn!("pluck() called on a next-flavor completion queue");
            return Event::timeout();
        }
        let mut state = self.inner.state.lock().expect("completion queue lock");
        if !state.pluckable.contains(&tag) {
            warn!("pluck({}) without a registered tag", tag);
            return Event::timeout();
        }
        loop {
            if let Some(index) = state.events.iter().position(|event| event.tag == tag) {
                state.pluckable.remove(&tag);
                // unwrap: index was just found
                return state.events.remove(index).unwrap();
            }
            if state.shutdown {
                return Event::shutdown();
            }
            let now = Instant::now();
            if now >= deadline {
                return Event::timeout();
            }
            let (next_state, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .expect("completion queue wait");
            state = next_state;
        }
    }

    /// Refuse new events and wake all waiters. Existing events remain
    /// drainable. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().expect("completion queue lock");
        state.shutdown = true;
        self.inner.cond.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().expect("completion queue lock").shutdown
    }

    /// Identity, not equality: two clones of one queue compare equal.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
