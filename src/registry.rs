use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display(fmt = "#{}", _0)]
pub struct ConnectionId(u64);

struct Entry {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ConnectionId, Entry>>,
}

/// The set of handlers currently serving a connection.
///
/// The listener registers a handler before spawning it and attaches the task
/// handle right after; the handler deregisters itself when its
/// [`Registration`] is dropped, whichever way it exits.
#[derive(Clone, Default)]
pub struct Registry(Arc<Inner>);

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&self) -> Registration {
        let id = ConnectionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        self.entries().insert(
            id,
            Entry {
                cancel: cancel.clone(),
                task: None,
            },
        );
        Registration {
            id,
            cancel,
            registry: self.clone(),
        }
    }

    /// Records the task serving `id`. A handler that already finished has no
    /// entry left and its handle is simply dropped.
    pub fn attach(&self, id: ConnectionId, task: JoinHandle<()>) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    /// Cancels every registered handler and hands back their task handles so
    /// the caller can wait for them. Entries stay until each handler drops
    /// its registration.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        self.entries()
            .values_mut()
            .filter_map(|entry| {
                entry.cancel.cancel();
                entry.task.take()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn remove(&self, id: ConnectionId) {
        self.entries().remove(&id);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.0.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A handler's membership in the [`Registry`]; removes it on drop.
pub struct Registration {
    id: ConnectionId,
    cancel: CancellationToken,
    registry: Registry,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
