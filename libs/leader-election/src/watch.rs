//! Resumable watch loop.
//!
//! One loop keeps one destination channel in sync with a key or a subtree.
//! On every (re)connect it reads the current state, forwards it, and then
//! resumes the low-level watch strictly after the index of that read, so a
//! consumer never stays on a stale value after a reconnect.

use std::{marker::PhantomData, ops::ControlFlow, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{Action, response_to_actions};
use crate::backoff::CountedBackoff;
use crate::config::ElectionConfig;
use crate::error::{StoreError, StoreResult};
use crate::store::{CoordinationStore, Response, StoreWatcher};

/// How store responses are turned into items for the destination channel.
pub(crate) trait WatchMode: Send + 'static {
    type Item: Send + 'static;
    const RECURSIVE: bool;

    /// Items forwarded for the read done at (re)connect.
    fn snapshot(resp: &Response) -> Vec<Self::Item>;
    /// Items forwarded for one watch event.
    fn changes(resp: &Response) -> Vec<Self::Item>;
}

/// Forwards the raw value of a single key.
pub(crate) struct SingleKey;

impl WatchMode for SingleKey {
    type Item = String;
    const RECURSIVE: bool = false;

    fn snapshot(resp: &Response) -> Vec<String> {
        vec![resp.node.value.clone()]
    }

    fn changes(resp: &Response) -> Vec<String> {
        vec![resp.node.value.clone()]
    }
}

/// Forwards flattened actions for a subtree.
pub(crate) struct Subtree;

impl WatchMode for Subtree {
    type Item = Action;
    const RECURSIVE: bool = true;

    fn snapshot(resp: &Response) -> Vec<Action> {
        response_to_actions(resp)
    }

    fn changes(resp: &Response) -> Vec<Action> {
        response_to_actions(resp)
    }
}

pub(crate) struct WatchLoop<S: CoordinationStore, M: WatchMode> {
    store: Arc<S>,
    key: String,
    tx: mpsc::Sender<M::Item>,
    token: CancellationToken,
    backoff: CountedBackoff,
    max_failed_steps: u32,
    _mode: PhantomData<fn() -> M>,
}

impl<S: CoordinationStore, M: WatchMode> WatchLoop<S, M> {
    pub(crate) fn new(
        store: Arc<S>,
        key: String,
        tx: mpsc::Sender<M::Item>,
        token: CancellationToken,
        config: &ElectionConfig,
    ) -> Self {
        Self {
            store,
            key,
            tx,
            token,
            backoff: CountedBackoff::new(config.backoff),
            max_failed_steps: config.max_failed_steps,
            _mode: PhantomData,
        }
    }

    /// Runs until the token is cancelled or the receiver is dropped.
    pub(crate) async fn run(mut self) {
        info!(key = %self.key, peers = ?self.store.endpoints(), "setting up watch");
        'outer: loop {
            let delay = self.backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("watch loop closing");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut watcher = match self.establish().await {
                Ok(Some(watcher)) => watcher,
                Ok(None) => break,
                Err(err) => match self.on_establish_error(err) {
                    ControlFlow::Break(()) => break,
                    ControlFlow::Continue(()) => continue,
                },
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break 'outer,
                    next = watcher.next() => next,
                };
                match next {
                    Ok(resp) => {
                        self.backoff.reset();
                        if !self.forward(M::changes(&resp)).await {
                            break 'outer;
                        }
                    }
                    Err(err) if err.is_cancelled() => break 'outer,
                    Err(err) if err.is_watch_expired() => {
                        warn!(?err, "watch has expired, resetting watch index");
                        break;
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(?err, "failed to retrieve event from watcher");
                        break;
                    }
                    Err(err) => {
                        error!(?err, "watcher rejected by store, re-reading");
                        break;
                    }
                }
            }
        }
        debug!(key = %self.key, "watch loop exited");
    }

    /// Reads the current state, forwards it and opens a watch after the
    /// index of the read. `Ok(None)` means the loop should stop.
    async fn establish(&mut self) -> StoreResult<Option<S::Watcher>> {
        info!("recreating watch at the latest index");
        let read = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(StoreError::Cancelled),
            read = self.store.get(&self.key, M::RECURSIVE) => read,
        };
        let index = match read {
            Ok(resp) => {
                info!(index = resp.index, "got current value");
                if !self.forward(M::snapshot(&resp)).await {
                    return Ok(None);
                }
                resp.index
            }
            // Nothing to forward yet; the first event will be the creation.
            Err(StoreError::NotFound { index, .. }) => {
                debug!(index, "key does not exist yet");
                index
            }
            Err(err) => return Err(err),
        };
        Ok(Some(self.store.watch(&self.key, index, M::RECURSIVE)))
    }

    fn on_establish_error(&mut self, err: StoreError) -> ControlFlow<()> {
        if err.is_cancelled() {
            info!("context cancelled, watch loop closing");
            return ControlFlow::Break(());
        }
        if err.is_watch_expired() {
            warn!("watch has expired, resetting watch index");
            return ControlFlow::Continue(());
        }
        warn!(?err, "failed to create watch at latest index");
        self.backoff.increment_failure();
        if self.backoff.failure_count() > self.max_failed_steps {
            info!("reset watcher at latest index");
            self.backoff.reset();
        }
        ControlFlow::Continue(())
    }

    /// Sends items in order. Returns false if the loop should stop.
    async fn forward(&self, items: Vec<M::Item>) -> bool {
        for item in items {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("watcher is closing");
                    return false;
                }
                sent = self.tx.send(item) => {
                    if sent.is_err() {
                        debug!("watch receiver dropped");
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing::Instrument;
    use tracing_test::traced_test;

    use super::*;
    use crate::action::ActionType;
    use crate::clock::TokioClock;
    use crate::store::memory::MemoryStore;

    fn spawn<M: WatchMode>(
        store: &MemoryStore,
        key: &str,
        capacity: usize,
    ) -> (
        mpsc::Receiver<M::Item>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let task = WatchLoop::<MemoryStore, M>::new(
            Arc::new(store.clone()),
            key.to_owned(),
            tx,
            token.clone(),
            &ElectionConfig::default(),
        );
        let handle = tokio::spawn(task.run().in_current_span());
        (rx, token, handle)
    }

    fn store() -> MemoryStore {
        MemoryStore::with_clock(Arc::new(TokioClock::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_key_sends_current_value_then_changes() {
        let store = store();
        store.put("/leader", "a", None).unwrap();
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);

        assert_eq!(rx.recv().await.unwrap(), "a");
        store.put("/leader", "b", None).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "b");
        store.put("/leader", "c", None).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "c");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_waits_for_creation() {
        let store = store();
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        store.put("/leader", "a", None).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(store.get_calls(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_transient_failures_force_reset() {
        let store = store();
        store.put("/leader", "a", None).unwrap();
        store.fail_next_gets(11);
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(store.get_calls(), 12);
        assert!(logs_contain("reset watcher at latest index"));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_watch_error_rereads_current_value() {
        let store = store();
        store.put("/leader", "a", None).unwrap();
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        assert_eq!(rx.recv().await.unwrap(), "a");

        store.fail_next_watch_events(1);
        store.put("/leader", "b", None).unwrap();
        // The failed event is recovered by the re-read.
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert_eq!(store.get_calls(), 2);
        assert!(logs_contain("failed to retrieve event from watcher"));
        assert!(!logs_contain("watcher rejected by store"));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_truncated_history_reconnects() {
        let store = MemoryStore::with_options(Arc::new(TokioClock::new()), 2);
        store.put("/leader", "a", None).unwrap();
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        assert_eq!(rx.recv().await.unwrap(), "a");

        for i in 0..5 {
            store.put("/other", &i.to_string(), None).unwrap();
        }
        store.put("/leader", "b", None).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert!(logs_contain("watch has expired"));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_repeated_expiry_never_forces_reset() {
        let store = MemoryStore::with_options(Arc::new(TokioClock::new()), 1);
        store.put("/leader", "v0", None).unwrap();
        let (mut rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        assert_eq!(rx.recv().await.unwrap(), "v0");

        for round in 1..=15 {
            store.put("/other", "x", None).unwrap();
            store.put("/other", "y", None).unwrap();
            let value = format!("v{round}");
            store.put("/leader", &value, None).unwrap();
            assert_eq!(rx.recv().await.unwrap(), value);
        }
        assert_eq!(store.get_calls(), 16);
        assert!(logs_contain("watch has expired"));
        assert!(!logs_contain("reset watcher at latest index"));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subtree_flattens_and_suppresses_noop_updates() {
        let store = store();
        store.put("/a", "1", None).unwrap();
        store.put("/a/b", "2", None).unwrap();
        let (mut rx, token, handle) = spawn::<Subtree>(&store, "/a", 4);

        let mut initial = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        initial.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(
            initial,
            vec![
                Action::new(ActionType::Create, "/a", "1"),
                Action::new(ActionType::Create, "/a/b", "2"),
            ]
        );

        store.put("/a/b", "3", None).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Action::new(ActionType::Update, "/a/b", "3")
        );

        store.put("/a/b", "3", None).unwrap();
        store.delete("/a/b").unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Action::new(ActionType::Delete, "/a/b", "")
        );

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_send_unblocks_on_cancel() {
        let store = store();
        store.put("/leader", "a", None).unwrap();
        let (rx, token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        store.put("/leader", "b", None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        token.cancel();
        handle.await.unwrap();
        drop(rx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_stops_loop() {
        let store = store();
        store.put("/leader", "a", None).unwrap();
        let (rx, _token, handle) = spawn::<SingleKey>(&store, "/leader", 1);
        drop(rx);
        handle.await.unwrap();
    }
}
