//! Small synchronization primitives shared by the mux and the tunnels: a
//! one-shot error latch with a broadcast signal, and a nested-mutex
//! priority lock serializing writes on a shared byte stream.

use std::io;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Write-once error cell plus a broadcast signal.
///
/// The first `put` stores the error and fires the signal; later `put`s are
/// no-ops. `get` and the signal stay consistent: once the signal has fired,
/// `get` returns the stored error.
pub struct Latch {
    cell: Mutex<Option<(io::ErrorKind, String)>>,
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { cell: Mutex::new(None), tx }
    }

    /// Store `err` if the cell is empty and fire the signal. Returns whether
    /// this call was the one that latched.
    pub fn put(&self, err: io::Error) -> bool {
        let mut cell = self.cell.lock();
        if cell.is_some() {
            return false;
        }
        *cell = Some((err.kind(), err.to_string()));
        drop(cell);
        self.tx.send_replace(true);
        true
    }

    /// The latched error, if any. Each call returns a fresh `io::Error`
    /// carrying the original kind and message.
    pub fn get(&self) -> Option<io::Error> {
        self.cell
            .lock()
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    pub fn is_set(&self) -> bool {
        self.cell.lock().is_some()
    }

    /// Subscribe to the broadcast signal. The receiver observes `true` once
    /// the latch has been set.
    pub fn sig(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the latch fires. Returns immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.sig();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Nested-mutex priority lock guarding a value.
///
/// Level 0 is innermost and holds the value. A caller at priority `p`
/// acquires levels `p, p-1, .., 0` in that order, so a priority-0 holder
/// blocks everyone, while a priority-1 waiter queues behind every
/// priority-0 and priority-1 holder. With finitely many levels and fair
/// mutexes no level starves.
pub struct Priority<T> {
    rest: Vec<AsyncMutex<()>>,
    inner: AsyncMutex<T>,
}

pub struct PriorityGuard<'a, T> {
    _rest: Vec<MutexGuard<'a, ()>>,
    inner: MutexGuard<'a, T>,
}

impl<T> Priority<T> {
    /// A lock with `levels` priority levels (at least 1) around `value`.
    pub fn new(levels: usize, value: T) -> Self {
        let rest = (1..levels).map(|_| AsyncMutex::new(())).collect();
        Self { rest, inner: AsyncMutex::new(value) }
    }

    pub fn levels(&self) -> usize {
        self.rest.len() + 1
    }

    /// Acquire at priority `pri` (0 is highest). Panics if `pri` is out of
    /// range, which is a caller bug.
    pub async fn lock(&self, pri: usize) -> PriorityGuard<'_, T> {
        assert!(pri < self.levels(), "priority {pri} out of range");
        let mut rest = Vec::with_capacity(pri);
        for level in (1..=pri).rev() {
            rest.push(self.rest[level - 1].lock().await);
        }
        let inner = self.inner.lock().await;
        PriorityGuard { _rest: rest, inner }
    }
}

impl<T> Deref for PriorityGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for PriorityGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
