// ── Watch registry ──
//
// Concurrent map of live subscriptions, keyed by display path with a
// secondary index on the server-assigned id. Lookups are lock-free;
// `watch`/`unwatch` callers serialize on `watch_lock` so one path never
// gets two subscriptions.

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::handle::WatchableHandle;

pub(crate) struct Registry {
    /// Primary storage: display path -> handle.
    by_path: DashMap<String, WatchableHandle>,

    /// Secondary index: server id -> display path.
    path_by_server_id: DashMap<String, String>,

    pub(crate) watch_lock: Mutex<()>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            by_path: DashMap::new(),
            path_by_server_id: DashMap::new(),
            watch_lock: Mutex::new(()),
        }
    }

    pub(crate) fn insert(&self, handle: WatchableHandle) {
        let path = handle.display_path().to_owned();
        let server_id = handle.server_id().to_owned();
        if let Some(stale) = self.by_path.insert(path.clone(), handle) {
            if stale.server_id() != server_id {
                self.path_by_server_id.remove(stale.server_id());
            }
        }
        self.path_by_server_id.insert(server_id, path);
    }

    pub(crate) fn get_by_path(&self, path: &str) -> Option<WatchableHandle> {
        self.by_path.get(path).map(|r| r.value().clone())
    }

    pub(crate) fn get_by_server_id(&self, server_id: &str) -> Option<WatchableHandle> {
        let path = self.path_by_server_id.get(server_id)?;
        self.by_path
            .get(path.value().as_str())
            .map(|r| r.value().clone())
    }

    /// Remove `handle` if it is the registered instance for its path.
    pub(crate) fn remove(&self, handle: &WatchableHandle) -> bool {
        let removed = self
            .by_path
            .remove_if(handle.display_path(), |_, current| current.ptr_eq(handle))
            .is_some();
        if removed {
            self.path_by_server_id.remove(handle.server_id());
        }
        removed
    }

    /// Remove and return every handle.
    pub(crate) fn drain(&self) -> Vec<WatchableHandle> {
        self.drain_where(|_| true)
    }

    /// Remove and return the handles matching `predicate`.
    pub(crate) fn drain_where<F>(&self, predicate: F) -> Vec<WatchableHandle>
    where
        F: Fn(&WatchableHandle) -> bool,
    {
        let paths: Vec<String> = self
            .by_path
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.key().clone())
            .collect();

        paths
            .into_iter()
            .filter_map(|path| self.by_path.remove(&path).map(|(_, h)| h))
            .inspect(|h| {
                self.path_by_server_id.remove(h.server_id());
            })
            .collect()
    }

    pub(crate) fn handles(&self) -> Vec<WatchableHandle> {
        self.by_path.iter().map(|r| r.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_path.len()
    }
}
