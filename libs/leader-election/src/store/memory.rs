//! In-process coordination store.
//!
//! Keeps keys in a `BTreeMap`, assigns one store index per mutation, expires
//! keys by TTL and retains a bounded event history that watchers read from.
//! A watcher positioned before the retained history gets `WatchExpired`, the
//! same way a real store reports a compacted position.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::store::{CoordinationStore, Node, Response, StoreOperation, StoreWatcher};

/// Number of events retained for watchers by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Carries the latest store index; bumped after every mutation.
    changed: watch::Sender<u64>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<Response>,
    history_limit: usize,
    failing_gets: u32,
    failing_watch_events: u32,
    get_calls: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expiration: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
}

impl Entry {
    fn to_node(&self, key: &str) -> Node {
        Node {
            key: key.to_owned(),
            value: self.value.clone(),
            dir: false,
            nodes: Vec::new(),
            created_index: self.created_index,
            modified_index: self.modified_index,
            expiration: self.expiration,
            ttl: self.ttl,
        }
    }

    /// Node describing this key after it was removed at `index`.
    fn removed_node(&self, key: &str, index: u64) -> Node {
        Node {
            key: key.to_owned(),
            created_index: self.created_index,
            modified_index: index,
            ..Default::default()
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }
}

enum WatchPoll {
    Found(Response),
    Failed(StoreError),
    Pending,
}

fn dir_prefix(key: &str) -> String {
    if key.ends_with('/') {
        key.to_owned()
    } else {
        format!("{key}/")
    }
}

fn in_scope(event_key: &str, key: &str, recursive: bool) -> bool {
    event_key == key || (recursive && event_key.starts_with(&dir_prefix(key)))
}

fn expiration_for(now: DateTime<Utc>, ttl: Option<Duration>) -> StoreResult<Option<DateTime<Utc>>> {
    let Some(ttl) = ttl else {
        return Ok(None);
    };
    if ttl.is_zero() {
        return Err(StoreError::InvalidRequest("ttl must be positive".into()));
    }
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| StoreError::InvalidRequest(format!("ttl out of range: {e}")))?;
    now.checked_add_signed(ttl)
        .map(Some)
        .ok_or_else(|| StoreError::InvalidRequest("ttl out of range".into()))
}

impl State {
    fn record(&mut self, resp: Response) {
        self.history.push_back(resp);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expiration.is_some_and(|exp| exp <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.index += 1;
                trace!(key, index = self.index, "key expired");
                let resp = Response {
                    operation: StoreOperation::Expire,
                    node: entry.removed_node(&key, self.index),
                    prev_node: Some(entry.to_node(&key)),
                    index: self.index,
                };
                self.record(resp);
            }
        }
    }

    fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.entries.values().filter_map(|e| e.expiration).min()
    }

    fn subtree(&self, key: &str) -> Node {
        let leaf = self.entries.get(key).map(|e| e.to_node(key));
        let children = self.children(&dir_prefix(key));
        match leaf {
            Some(leaf) if children.is_empty() => leaf,
            leaf => {
                let mut nodes: Vec<Node> = leaf.into_iter().collect();
                nodes.extend(children);
                Node::dir(key, nodes)
            }
        }
    }

    fn children(&self, prefix: &str) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut last_dir: Option<String> = None;
        let range = self
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded));
        for (key, entry) in range {
            let Some(rel) = key.strip_prefix(prefix) else {
                break;
            };
            if rel.is_empty() {
                continue;
            }
            match rel.split_once('/') {
                None => nodes.push(entry.to_node(key)),
                Some((segment, _)) => {
                    let child = format!("{prefix}{segment}");
                    if last_dir.as_deref() != Some(child.as_str()) {
                        let grandchildren = self.children(&dir_prefix(&child));
                        nodes.push(Node::dir(child.clone(), grandchildren));
                        last_dir = Some(child);
                    }
                }
            }
        }
        nodes
    }

    fn poll_event(&self, key: &str, recursive: bool, after_index: u64) -> WatchPoll {
        if let Some(oldest) = self.history.front() {
            if oldest.index > after_index.saturating_add(1) {
                return WatchPoll::Failed(StoreError::WatchExpired {
                    requested: after_index.saturating_add(1),
                    oldest: oldest.index,
                });
            }
        }
        self.history
            .iter()
            .find(|resp| resp.index > after_index && in_scope(&resp.node.key, key, recursive))
            .cloned()
            .map_or(WatchPoll::Pending, WatchPoll::Found)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(Arc::new(SystemClock), DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_options(clock, DEFAULT_HISTORY_LIMIT)
    }

    /// `history_limit` bounds the events kept for watchers (at least one).
    pub fn with_options(clock: Arc<dyn Clock>, history_limit: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: BTreeMap::new(),
                    index: 0,
                    history: VecDeque::new(),
                    history_limit: history_limit.max(1),
                    failing_gets: 0,
                    failing_watch_events: 0,
                    get_calls: 0,
                }),
                changed,
                clock,
            }),
        }
    }

    /// Runs `f` against the state after expiring stale keys, then wakes
    /// watchers if the store index moved.
    fn with_state<T>(&self, f: impl FnOnce(&mut State, DateTime<Utc>) -> T) -> T {
        let now = self.shared.clock.now();
        let (out, moved) = {
            let mut state = self.shared.lock();
            let before = state.index;
            state.purge_expired(now);
            let out = f(&mut state, now);
            (out, (state.index != before).then_some(state.index))
        };
        if let Some(index) = moved {
            self.shared.changed.send_replace(index);
        }
        out
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.with_state(|state, _| state.index)
    }

    /// Set `key` unconditionally, optionally with a TTL. Reported to watchers
    /// as `create` for a new key and `update` for an existing one.
    pub fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        self.with_state(|state, now| {
            let expiration = expiration_for(now, ttl)?;
            state.index += 1;
            let index = state.index;
            let prev = state.entries.get(key).cloned();
            let entry = Entry {
                value: value.to_owned(),
                created_index: prev.as_ref().map_or(index, |p| p.created_index),
                modified_index: index,
                expiration,
                ttl,
            };
            let resp = Response {
                operation: if prev.is_some() {
                    StoreOperation::Update
                } else {
                    StoreOperation::Create
                },
                node: entry.to_node(key),
                prev_node: prev.map(|p| p.to_node(key)),
                index,
            };
            state.entries.insert(key.to_owned(), entry);
            state.record(resp.clone());
            debug!(key, index, "put");
            Ok(resp)
        })
    }

    /// Remove `key`, failing with `NotFound` if it does not exist.
    pub fn delete(&self, key: &str) -> StoreResult<Response> {
        self.with_state(|state, _| {
            let Some(entry) = state.entries.remove(key) else {
                return Err(StoreError::NotFound {
                    key: key.to_owned(),
                    index: state.index,
                });
            };
            state.index += 1;
            let resp = Response {
                operation: StoreOperation::Delete,
                node: entry.removed_node(key, state.index),
                prev_node: Some(entry.to_node(key)),
                index: state.index,
            };
            state.record(resp.clone());
            debug!(key, index = state.index, "delete");
            Ok(resp)
        })
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_next_gets(&self, n: u32) {
        self.with_state(|state, _| state.failing_gets = n);
    }

    /// Make the next `n` watch polls (on any watcher) fail with a transient error.
    pub fn fail_next_watch_events(&self, n: u32) {
        self.with_state(|state, _| state.failing_watch_events = n);
    }

    /// Number of reads served so far, including failed ones.
    pub fn get_calls(&self) -> u64 {
        self.with_state(|state, _| state.get_calls)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    type Watcher = MemoryWatcher;

    async fn get(&self, key: &str, recursive: bool) -> StoreResult<Response> {
        self.with_state(|state, _| {
            state.get_calls += 1;
            if state.failing_gets > 0 {
                state.failing_gets -= 1;
                return Err(StoreError::Transient("injected read failure".into()));
            }
            let node = if recursive {
                Some(state.subtree(key))
            } else {
                state.entries.get(key).map(|e| e.to_node(key))
            };
            match node {
                Some(node) => Ok(Response {
                    operation: StoreOperation::Get,
                    node,
                    prev_node: None,
                    index: state.index,
                }),
                None => Err(StoreError::NotFound {
                    key: key.to_owned(),
                    index: state.index,
                }),
            }
        })
    }

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Response> {
        self.with_state(|state, now| {
            if state.entries.contains_key(key) {
                return Err(StoreError::AlreadyExists {
                    key: key.to_owned(),
                    index: state.index,
                });
            }
            let expiration = expiration_for(now, Some(ttl))?;
            state.index += 1;
            let entry = Entry {
                value: value.to_owned(),
                created_index: state.index,
                modified_index: state.index,
                expiration,
                ttl: Some(ttl),
            };
            let resp = Response {
                operation: StoreOperation::Create,
                node: entry.to_node(key),
                prev_node: None,
                index: state.index,
            };
            state.entries.insert(key.to_owned(), entry);
            state.record(resp.clone());
            Ok(resp)
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        prev_value: &str,
        prev_index: u64,
    ) -> StoreResult<Response> {
        self.with_state(|state, now| {
            let index = state.index;
            let Some(current) = state.entries.get(key) else {
                return Err(StoreError::NotFound {
                    key: key.to_owned(),
                    index,
                });
            };
            if current.value != prev_value || current.modified_index != prev_index {
                return Err(StoreError::PreconditionFailed {
                    key: key.to_owned(),
                    reason: format!(
                        "compare failed: [{prev_value} != {}] [{prev_index} != {}]",
                        current.value, current.modified_index
                    ),
                });
            }
            let expiration = expiration_for(now, Some(ttl))?;
            let prev_node = current.to_node(key);
            state.index += 1;
            let entry = Entry {
                value: value.to_owned(),
                created_index: prev_node.created_index,
                modified_index: state.index,
                expiration,
                ttl: Some(ttl),
            };
            let resp = Response {
                operation: StoreOperation::CompareAndSwap,
                node: entry.to_node(key),
                prev_node: Some(prev_node),
                index: state.index,
            };
            state.entries.insert(key.to_owned(), entry);
            state.record(resp.clone());
            Ok(resp)
        })
    }

    fn watch(&self, key: &str, after_index: u64, recursive: bool) -> MemoryWatcher {
        MemoryWatcher {
            shared: Arc::clone(&self.shared),
            key: key.to_owned(),
            recursive,
            after_index,
            changed: self.shared.changed.subscribe(),
        }
    }

    fn endpoints(&self) -> Vec<String> {
        vec!["memory".to_owned()]
    }
}

/// Watch handle returned by [`MemoryStore::watch`].
#[derive(Debug)]
pub struct MemoryWatcher {
    shared: Arc<Shared>,
    key: String,
    recursive: bool,
    after_index: u64,
    changed: watch::Receiver<u64>,
}

#[async_trait]
impl StoreWatcher for MemoryWatcher {
    async fn next(&mut self) -> StoreResult<Response> {
        loop {
            self.changed.borrow_and_update();
            let now = self.shared.clock.now();
            let (poll, wait, moved) = {
                let mut state = self.shared.lock();
                let before = state.index;
                state.purge_expired(now);
                let poll = if state.failing_watch_events > 0 {
                    state.failing_watch_events -= 1;
                    WatchPoll::Failed(StoreError::Transient("injected watch failure".into()))
                } else {
                    state.poll_event(&self.key, self.recursive, self.after_index)
                };
                let wait = state
                    .next_expiry()
                    .map(|exp| (exp - now).to_std().unwrap_or_default());
                (poll, wait, (state.index != before).then_some(state.index))
            };
            if let Some(index) = moved {
                self.shared.changed.send_replace(index);
            }
            match poll {
                WatchPoll::Found(resp) => {
                    self.after_index = resp.index;
                    return Ok(resp);
                }
                WatchPoll::Failed(err) => return Err(err),
                WatchPoll::Pending => {}
            }
            tokio::select! {
                res = self.changed.changed() => {
                    if res.is_err() {
                        return Err(StoreError::Cancelled);
                    }
                }
                _ = sleep_or_pending(wait) => {}
            }
        }
    }
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    fn store() -> MemoryStore {
        MemoryStore::with_clock(Arc::new(TokioClock::new()))
    }

    #[tokio::test]
    async fn test_get_missing_key_reports_index() {
        let store = store();
        store.put("/a", "1", None).unwrap();
        let err = store.get("/missing", false).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::NotFound {
                key: "/missing".into(),
                index: 1
            }
        );
    }

    #[tokio::test]
    async fn test_create_is_no_clobber() {
        let store = store();
        let resp = store
            .create("/leader", "node-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(resp.operation, StoreOperation::Create);
        assert_eq!(resp.node.value, "node-1");
        assert!(resp.node.expiration.is_some());

        let err = store
            .create("/leader", "node-2", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
        assert_eq!(store.get("/leader", false).await.unwrap().node.value, "node-1");
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_value_and_index() {
        let store = store();
        let created = store
            .create("/leader", "node-1", Duration::from_secs(10))
            .await
            .unwrap();
        let index = created.node.modified_index;

        let err = store
            .compare_and_swap("/leader", "node-1", Duration::from_secs(10), "node-2", index)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        let err = store
            .compare_and_swap("/leader", "node-1", Duration::from_secs(10), "node-1", index + 5)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        let swapped = store
            .compare_and_swap("/leader", "node-1", Duration::from_secs(10), "node-1", index)
            .await
            .unwrap();
        assert_eq!(swapped.operation, StoreOperation::CompareAndSwap);
        assert!(swapped.node.modified_index > index);
        assert_eq!(swapped.prev_node.unwrap().modified_index, index);

        let err = store
            .compare_and_swap("/absent", "x", Duration::from_secs(1), "x", 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let store = store();
        let err = store.create("/k", "v", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = store();
        store
            .create("/leader", "node-1", Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("/leader", false).await.is_ok());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("/leader", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_recursive_get_builds_tree() {
        let store = store();
        store.put("/a", "1", None).unwrap();
        store.put("/a/b", "2", None).unwrap();
        store.put("/a/c/d", "4", None).unwrap();
        store.put("/ab", "x", None).unwrap();

        let resp = store.get("/a", true).await.unwrap();
        let root = resp.node;
        assert!(root.dir);
        assert_eq!(root.key, "/a");
        let keys: Vec<_> = root.nodes.iter().map(|n| (n.key.as_str(), n.dir)).collect();
        assert_eq!(keys, vec![("/a", false), ("/a/b", false), ("/a/c", true)]);
        assert_eq!(root.nodes[2].nodes[0].key, "/a/c/d");

        let leaf = store.get("/ab", true).await.unwrap();
        assert!(!leaf.node.dir);
        assert_eq!(leaf.node.value, "x");

        let empty = store.get("/nothing", true).await.unwrap();
        assert!(empty.node.dir);
        assert!(empty.node.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_put_reports_create_then_update() {
        let store = store();
        let first = store.put("/k", "1", None).unwrap();
        assert_eq!(first.operation, StoreOperation::Create);
        assert!(first.prev_node.is_none());

        let second = store.put("/k", "2", None).unwrap();
        assert_eq!(second.operation, StoreOperation::Update);
        assert_eq!(second.prev_node.unwrap().value, "1");
        assert_eq!(second.node.created_index, first.node.created_index);
    }

    #[tokio::test]
    async fn test_watch_yields_changes_after_index() {
        let store = store();
        store.put("/k", "1", None).unwrap();
        let index = store.index();
        let mut watcher = store.watch("/k", index, false);

        store.put("/other", "x", None).unwrap();
        store.put("/k", "2", None).unwrap();
        let resp = watcher.next().await.unwrap();
        assert_eq!(resp.node.value, "2");
        assert_eq!(resp.index, index + 2);

        let waiter = tokio::spawn(async move { watcher.next().await });
        tokio::task::yield_now().await;
        store.delete("/k").unwrap();
        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.operation, StoreOperation::Delete);
        assert_eq!(resp.node.value, "");
    }

    #[tokio::test]
    async fn test_recursive_watch_scope() {
        let store = store();
        let mut watcher = store.watch("/svc", 0, true);
        store.put("/svcx", "no", None).unwrap();
        store.put("/svc/a", "yes", None).unwrap();
        let resp = watcher.next().await.unwrap();
        assert_eq!(resp.node.key, "/svc/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_observes_expiry_without_other_writes() {
        let store = store();
        store
            .create("/leader", "node-1", Duration::from_secs(5))
            .await
            .unwrap();
        let mut watcher = store.watch("/leader", store.index(), false);
        let resp = watcher.next().await.unwrap();
        assert_eq!(resp.operation, StoreOperation::Expire);
        assert_eq!(resp.prev_node.unwrap().value, "node-1");
    }

    #[tokio::test]
    async fn test_watch_expires_when_history_is_truncated() {
        let store = MemoryStore::with_options(Arc::new(TokioClock::new()), 3);
        let mut watcher = store.watch("/k", 0, false);
        for i in 0..5 {
            store.put("/other", &i.to_string(), None).unwrap();
        }
        let err = watcher.next().await.unwrap_err();
        assert!(err.is_watch_expired());
        assert_eq!(
            err,
            StoreError::WatchExpired {
                requested: 1,
                oldest: 3
            }
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = store();
        store.put("/k", "v", None).unwrap();
        store.fail_next_gets(2);
        assert!(store.get("/k", false).await.unwrap_err().is_retryable());
        assert!(store.get("/k", false).await.unwrap_err().is_retryable());
        assert!(store.get("/k", false).await.is_ok());
        assert_eq!(store.get_calls(), 3);

        store.fail_next_watch_events(1);
        let mut watcher = store.watch("/k", 0, false);
        assert!(watcher.next().await.unwrap_err().is_retryable());
        assert_eq!(watcher.next().await.unwrap().node.value, "v");
    }
}
