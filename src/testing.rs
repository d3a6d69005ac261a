//! An in-memory [`History`] implementation, shipped the way the teacher
//! ships its own [`local`](https://docs.rs/rocket/latest/rocket/local/)
//! test-client module: a regular, public module rather than a `cfg(test)`
//! item, so both this crate's own unit tests and a downstream crate's
//! integration tests can drive a [`Router`](crate::Router) without a real
//! browser. Spec `SPEC_FULL.md` §10.5.

use std::sync::{Arc, Mutex};

use crate::location::{History, HistoryAction, Location};

struct Listener {
    id: u64,
    callback: Box<dyn Fn(HistoryAction, Location) + Send + Sync>,
}

struct Inner {
    stack: Vec<Location>,
    index: usize,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

/// A `History` backed by an in-process stack, for tests. `push`/`replace`
/// mutate the stack directly (as a real navigation's caller would, via
/// `Router::navigate`); `go` walks the stack and notifies listeners with
/// `HistoryAction::Pop`, matching a real browser's popstate behavior.
pub struct MemoryHistory {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHistory {
    pub fn new(initial_pathname: &str) -> Arc<Self> {
        Arc::new(MemoryHistory {
            inner: Arc::new(Mutex::new(Inner {
                stack: vec![Location::new(initial_pathname)],
                index: 0,
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        })
    }

    /// The full entry stack, for assertions about history depth.
    pub fn entries(&self) -> Vec<Location> {
        self.inner.lock().unwrap().stack.clone()
    }
}

impl History for MemoryHistory {
    fn location(&self) -> Location {
        let guard = self.inner.lock().unwrap();
        guard.stack[guard.index].clone()
    }

    fn push(&self, location: &Location) {
        let mut guard = self.inner.lock().unwrap();
        let at = guard.index;
        guard.stack.truncate(at + 1);
        guard.stack.push(location.clone());
        guard.index += 1;
    }

    fn replace(&self, location: &Location) {
        let mut guard = self.inner.lock().unwrap();
        let at = guard.index;
        guard.stack[at] = location.clone();
    }

    fn go(&self, delta: i32) {
        let location = {
            let mut guard = self.inner.lock().unwrap();
            let new_index = (guard.index as i64 + delta as i64).clamp(0, guard.stack.len() as i64 - 1) as usize;
            guard.index = new_index;
            guard.stack[new_index].clone()
        };
        let guard = self.inner.lock().unwrap();
        for listener in &guard.listeners {
            (listener.callback)(HistoryAction::Pop, location.clone());
        }
    }

    fn listen(&self, callback: Box<dyn Fn(HistoryAction, Location) + Send + Sync>) -> Box<dyn FnOnce() + Send> {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_listener_id;
        guard.next_listener_id += 1;
        guard.listeners.push(Listener { id, callback });
        drop(guard);

        let inner = self.inner.clone();
        Box::new(move || {
            inner.lock().unwrap().listeners.retain(|l| l.id != id);
        })
    }

    fn create_href(&self, location: &Location) -> String {
        location.href()
    }
}
