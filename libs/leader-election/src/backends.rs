//! Backend address set fed by a subtree watch.
//!
//! Each key under a watched prefix names one backend and its value is the
//! backend address. Consumers such as a proxy config generator subscribe to
//! the sorted host list instead of tracking individual actions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::action::{Action, ActionType};

#[derive(Debug, Clone)]
pub struct BackendSet {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    backends: Mutex<HashMap<String, String>>,
    hosts: watch::Sender<Vec<String>>,
}

impl Default for BackendSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.backends.lock().expect("backend set lock poisoned")
    }
}

impl BackendSet {
    pub fn new() -> Self {
        let (hosts, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                backends: Mutex::new(HashMap::new()),
                hosts,
            }),
        }
    }

    /// Returns true if the stored address changed.
    pub fn put(&self, key: &str, addr: &str) -> bool {
        let mut backends = self.inner.lock();
        if backends.get(key).is_some_and(|cur| cur == addr) {
            trace!(key, addr, "backend unchanged");
            return false;
        }
        backends.insert(key.to_owned(), addr.to_owned());
        debug!(key, addr, "backend added");
        self.publish(&backends);
        true
    }

    /// Returns true if `key` was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut backends = self.inner.lock();
        if backends.remove(key).is_none() {
            return false;
        }
        debug!(key, "backend removed");
        self.publish(&backends);
        true
    }

    /// Apply a watch action. Actions other than create, update and delete
    /// are ignored.
    pub fn apply(&self, action: &Action) -> bool {
        match action.kind {
            ActionType::Create | ActionType::Update => self.put(&action.key, &action.value),
            ActionType::Delete => self.remove(&action.key),
            ActionType::Other(ref kind) => {
                debug!(kind = %kind, key = %action.key, "ignoring unknown action");
                false
            }
        }
    }

    /// Sorted, de-duplicated backend addresses.
    pub fn hosts(&self) -> Vec<String> {
        self.inner.hosts.borrow().clone()
    }

    /// Receiver that observes every change of [`hosts`](BackendSet::hosts).
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.inner.hosts.subscribe()
    }

    /// Callback to pass to [`Client::add_recursive_watch_callback`].
    ///
    /// [`Client::add_recursive_watch_callback`]: crate::Client::add_recursive_watch_callback
    pub fn action_callback(&self) -> impl Fn(Action) + Send + Sync + 'static {
        let set = self.clone();
        move |action| {
            set.apply(&action);
        }
    }

    fn publish(&self, backends: &HashMap<String, String>) {
        let hosts: Vec<String> = backends
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.inner.hosts.send_if_modified(|current| {
            if *current == hosts {
                return false;
            }
            *current = hosts;
            true
        });
    }
}
