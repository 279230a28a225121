//! Election client and its shutdown protocol.
//!
//! Every registration spawns tasks onto a shared [`TaskTracker`] and hands
//! them a child of the client's shutdown token. [`Client::close`] cancels the
//! token once and waits for the tracker to drain.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::action::Action;
use crate::clock::{Clock, SystemClock};
use crate::config::ElectionConfig;
use crate::error::{ElectionError, ElectionResult};
use crate::store::CoordinationStore;
use crate::voter::{Campaign, LeaseLoop, LeaseUpdate, Voter, VoterCommand};
use crate::watch::{SingleKey, Subtree, WatchLoop, WatchMode};

/// Lease updates buffered for slow subscribers before they start lagging.
const LEASE_UPDATE_CAPACITY: usize = 16;

/// Repeated step-downs collapse into one pause per lease loop.
const STEP_DOWN_CAPACITY: usize = 1;

struct VoterHandle {
    key: String,
    value: String,
    commands: mpsc::Sender<VoterCommand>,
}

/// Leader election and watch client over a [`CoordinationStore`].
///
/// A client runs at most one voter. The key and value of that voter are
/// fixed by the first [`add_voter`](Client::add_voter) or
/// [`remove_voter`](Client::remove_voter) call; later calls only toggle
/// participation, whatever key and value they pass. Any number of
/// [`lease_loop`](Client::lease_loop) tasks can run next to it.
pub struct Client<S: CoordinationStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: ElectionConfig,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tracker: TaskTracker,
    voter: OnceLock<VoterHandle>,
    lease_updates: broadcast::Sender<LeaseUpdate>,
    step_downs: broadcast::Sender<()>,
}

/// Builder for [`Client`]. A store is required.
pub struct ClientBuilder<S: CoordinationStore> {
    store: Option<Arc<S>>,
    clock: Option<Arc<dyn Clock>>,
    config: ElectionConfig,
}

impl<S: CoordinationStore> Default for ClientBuilder<S> {
    fn default() -> Self {
        Self {
            store: None,
            clock: None,
            config: ElectionConfig::default(),
        }
    }
}

impl<S: CoordinationStore> ClientBuilder<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Use a store handle that is shared with other owners.
    pub fn shared_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock used for lease expiry math. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: ElectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ElectionResult<Client<S>> {
        let store = self
            .store
            .ok_or_else(|| ElectionError::Config("a coordination store is required".into()))?;
        self.config.validate()?;
        let (lease_updates, _) = broadcast::channel(LEASE_UPDATE_CAPACITY);
        let (step_downs, _) = broadcast::channel(STEP_DOWN_CAPACITY);
        Ok(Client {
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            voter: OnceLock::new(),
            lease_updates,
            step_downs,
        })
    }
}

impl<S: CoordinationStore> Client<S> {
    pub fn builder() -> ClientBuilder<S> {
        ClientBuilder::new()
    }

    /// Client with the default config and system clock.
    pub fn new(store: S) -> ElectionResult<Self> {
        Self::builder().store(store).build()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ElectionResult<()> {
        if self.is_closed() {
            return Err(ElectionError::Closed);
        }
        Ok(())
    }

    fn spawn_watch<M: WatchMode>(
        &self,
        key: &str,
        tx: mpsc::Sender<M::Item>,
        token: CancellationToken,
    ) {
        let span = info_span!("watch", key = %key, recursive = M::RECURSIVE);
        let task = WatchLoop::<S, M>::new(
            Arc::clone(&self.store),
            key.to_owned(),
            tx,
            token,
            &self.config,
        );
        self.tracker.spawn(task.run().instrument(span));
    }

    /// Invoke `callback` with `(token, key, previous, new)` for every value
    /// `key` takes. The first call passes the value at registration as both
    /// previous and new. Calls are serialized in the order values arrive.
    pub fn add_watch_callback<F>(&self, key: impl Into<String>, callback: F) -> ElectionResult<()>
    where
        F: Fn(&CancellationToken, &str, &str, &str) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let key = key.into();
        let token = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::channel::<String>(self.config.channel_capacity);
        self.spawn_watch::<SingleKey>(&key, tx, token.clone());

        let span = info_span!("watch_dispatch", key = %key);
        self.tracker.spawn(
            async move {
                let mut prev: Option<String> = None;
                loop {
                    let value = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        value = rx.recv() => match value {
                            Some(value) => value,
                            None => break,
                        },
                    };
                    let old = prev.as_deref().unwrap_or(value.as_str());
                    callback(&token, &key, old, &value);
                    prev = Some(value);
                }
                debug!("dispatcher exited");
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Invoke `callback` once per [`Action`] under the `key` subtree,
    /// starting with a `create` for every key present at registration.
    pub fn add_recursive_watch_callback<F>(
        &self,
        key: impl Into<String>,
        callback: F,
    ) -> ElectionResult<()>
    where
        F: Fn(Action) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let key = key.into();
        let token = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::channel::<Action>(self.config.channel_capacity);
        self.spawn_watch::<Subtree>(&key, tx, token.clone());

        let span = info_span!("recursive_watch_dispatch", key = %key);
        self.tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        action = rx.recv() => match action {
                            Some(action) => callback(action),
                            None => break,
                        },
                    }
                }
                debug!("dispatcher exited");
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Forward every value `key` takes into `values` until the client is
    /// closed or the receiver is dropped.
    pub fn add_watch(&self, key: &str, values: mpsc::Sender<String>) -> ElectionResult<()> {
        self.ensure_open()?;
        self.spawn_watch::<SingleKey>(key, values, self.shutdown.child_token());
        Ok(())
    }

    /// Start campaigning for `key` with `value`, holding it for `term` at a
    /// time once acquired. Starts the voter on first use; later calls
    /// re-enable it.
    pub async fn add_voter(&self, key: &str, value: &str, term: Duration) -> ElectionResult<()> {
        self.command_voter(key, value, term, VoterCommand::Enable)
            .await
    }

    /// Stop campaigning. The voter stays ready to be re-enabled and a held
    /// lease expires after its term.
    pub async fn remove_voter(&self, key: &str, value: &str, term: Duration) -> ElectionResult<()> {
        self.command_voter(key, value, term, VoterCommand::Disable)
            .await
    }

    /// Hold `key` with `value` until `token` is cancelled or the client is
    /// closed. The first attempt runs at once and later ones every fifth of
    /// `term`, the same as an enabled voter. Renewals are published to
    /// [`subscribe_leases`](Client::subscribe_leases).
    pub fn lease_loop(
        &self,
        key: &str,
        value: &str,
        term: Duration,
        token: CancellationToken,
    ) -> ElectionResult<()> {
        self.ensure_open()?;
        self.check_term(term)?;
        let lease_loop = LeaseLoop {
            campaign: self.campaign(key, value, term),
            step_downs: self.step_downs.subscribe(),
            stop: token,
        };
        let span = info_span!("lease_loop", key, value, term = ?term);
        self.tracker.spawn(lease_loop.run().instrument(span));
        Ok(())
    }

    /// Suspend the voter for two terms so a peer can take over. Lease loops
    /// skip attempts until their next tick. Without a voter only the lease
    /// loops are affected.
    pub async fn step_down(&self) -> ElectionResult<()> {
        self.ensure_open()?;
        // No lease loops is fine.
        let _ = self.step_downs.send(());
        let Some(voter) = self.voter.get() else {
            debug!("no voter to step down");
            return Ok(());
        };
        self.send_command(voter, VoterCommand::StepDown).await
    }

    /// Receive a [`LeaseUpdate`] for every lease this client acquires or
    /// renews from now on.
    pub fn subscribe_leases(&self) -> broadcast::Receiver<LeaseUpdate> {
        self.lease_updates.subscribe()
    }

    async fn command_voter(
        &self,
        key: &str,
        value: &str,
        term: Duration,
        command: VoterCommand,
    ) -> ElectionResult<()> {
        self.ensure_open()?;
        self.check_term(term)?;
        let voter = self
            .voter
            .get_or_init(|| self.start_voter(key, value, term, command == VoterCommand::Enable));
        if voter.key != key || voter.value != value {
            warn!(
                key,
                value,
                voter_key = %voter.key,
                voter_value = %voter.value,
                "voter already running for another key or value, only toggling participation"
            );
        }
        self.send_command(voter, command).await
    }

    fn check_term(&self, term: Duration) -> ElectionResult<()> {
        if term < self.config.min_term {
            return Err(ElectionError::InvalidTerm(term));
        }
        Ok(())
    }

    fn campaign(&self, key: &str, value: &str, term: Duration) -> Campaign<S> {
        Campaign {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            key: key.to_owned(),
            value: value.to_owned(),
            term,
            leases: self.lease_updates.clone(),
            token: self.shutdown.child_token(),
        }
    }

    fn start_voter(&self, key: &str, value: &str, term: Duration, enabled: bool) -> VoterHandle {
        let (commands, rx) = mpsc::channel(1);
        let voter = Voter {
            campaign: self.campaign(key, value, term),
            commands: rx,
        };
        let span = info_span!("voter", key, value, term = ?term);
        self.tracker.spawn(voter.run(enabled).instrument(span));
        VoterHandle {
            key: key.to_owned(),
            value: value.to_owned(),
            commands,
        }
    }

    async fn send_command(&self, voter: &VoterHandle, command: VoterCommand) -> ElectionResult<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ElectionError::Closed),
            sent = voter.commands.send(command) => sent.map_err(|_| ElectionError::Closed),
        }
    }

    /// Stop every task this client spawned and wait for them to exit. Only the first call does anything.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(tasks = self.tracker.len(), "closing election client");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("election client closed");
    }
}

impl<S: CoordinationStore> Drop for Client<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use super::*;
    use crate::clock::TokioClock;
    use crate::voter::LeaseUpdateKind;
    use crate::store::memory::MemoryStore;

    const TERM: Duration = Duration::from_secs(10);

    fn client() -> (Client<MemoryStore>, MemoryStore) {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let store = MemoryStore::with_clock(Arc::clone(&clock));
        let client = Client::builder()
            .store(store.clone())
            .clock(clock)
            .build()
            .unwrap();
        (client, store)
    }

    #[test]
    fn test_build_requires_store() {
        let err = ClientBuilder::<MemoryStore>::new().build().err().unwrap();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[test]
    fn test_build_validates_config() {
        let config = ElectionConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        let err = Client::builder()
            .store(MemoryStore::new())
            .config(config)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_term_is_rejected() {
        let (client, _) = client();
        let err = client
            .add_voter("/leader", "a", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ElectionError::InvalidTerm(_)));
        assert!(client.voter.get().is_none());

        let token = CancellationToken::new();
        let err = client
            .lease_loop("/leader", "a", Duration::from_millis(500), token)
            .unwrap_err();
        assert!(matches!(err, ElectionError::InvalidTerm(_)));
        assert!(client.tracker.is_empty());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_after_close_fails() {
        let (client, _) = client();
        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.add_watch_callback("/k", |_, _, _, _| {}),
            Err(ElectionError::Closed)
        ));
        assert!(matches!(
            client.add_recursive_watch_callback("/k", |_| {}),
            Err(ElectionError::Closed)
        ));
        assert!(matches!(
            client.add_voter("/leader", "a", TERM).await,
            Err(ElectionError::Closed)
        ));
        assert!(matches!(
            client.lease_loop("/leader", "a", TERM, CancellationToken::new()),
            Err(ElectionError::Closed)
        ));
        let stepped = client.step_down().await;
        assert!(matches!(stepped, Err(ElectionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_callback_has_equal_values() {
        let (client, store) = client();
        store.put("/leader", "a", None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let sink = Arc::clone(&seen);
        client
            .add_watch_callback("/leader", move |_, key, prev, new| {
                sink.lock()
                    .unwrap()
                    .push((key.to_owned(), prev.to_owned(), new.to_owned()));
                let _ = done_tx.send(());
            })
            .unwrap();

        done_rx.recv().await.unwrap();
        store.put("/leader", "b", None).unwrap();
        done_rx.recv().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("/leader".to_owned(), "a".to_owned(), "a".to_owned()),
                ("/leader".to_owned(), "a".to_owned(), "b".to_owned()),
            ]
        );
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_voter_target_is_fixed_by_first_call() {
        let (client, store) = client();
        client.remove_voter("/leader", "a", TERM).await.unwrap();
        client.add_voter("/other", "b", TERM).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.get("/leader", false).await.unwrap().node.value, "a");
        assert!(store.get("/other", false).await.unwrap_err().is_not_found());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_down_without_voter_is_noop() {
        let (client, _) = client();
        client.step_down().await.unwrap();
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_loops_hold_each_key() {
        let (client, store) = client();
        let mut leases = client.subscribe_leases();
        let token = CancellationToken::new();
        client.lease_loop("/a", "a", TERM, token.clone()).unwrap();
        client.lease_loop("/b", "b", TERM, token.clone()).unwrap();

        let mut acquired = Vec::new();
        for _ in 0..2 {
            let update = leases.recv().await.unwrap();
            assert_eq!(update.kind, LeaseUpdateKind::Acquired);
            acquired.push(update.key);
        }
        acquired.sort();
        assert_eq!(acquired, ["/a", "/b"]);

        let update = leases.recv().await.unwrap();
        assert_eq!(update.kind, LeaseUpdateKind::Renewed);

        tokio::time::sleep(TERM * 3).await;
        assert_eq!(store.get("/a", false).await.unwrap().node.value, "a");
        assert_eq!(store.get("/b", false).await.unwrap().node.value, "b");
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_cancelled_lease_loop_lets_lease_expire() {
        let (client, store) = client();
        let mut leases = client.subscribe_leases();
        let token = CancellationToken::new();
        client
            .lease_loop("/leader", "a", TERM, token.clone())
            .unwrap();
        let update = leases.recv().await.unwrap();
        assert_eq!(update.kind, LeaseUpdateKind::Acquired);

        token.cancel();
        tokio::time::sleep(TERM + Duration::from_secs(1)).await;
        assert!(logs_contain("lease loop is closed"));
        assert!(leases.try_recv().is_err());
        assert!(store.get("/leader", false).await.unwrap_err().is_not_found());
        assert!(client.tracker.is_empty());
        assert!(!client.is_closed());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_step_down_reaches_lease_loops() {
        let (client, store) = client();
        let mut leases = client.subscribe_leases();
        client
            .lease_loop("/leader", "a", TERM, CancellationToken::new())
            .unwrap();
        let update = leases.recv().await.unwrap();
        assert_eq!(update.kind, LeaseUpdateKind::Acquired);

        client.step_down().await.unwrap();
        tokio::time::sleep(TERM * 2).await;
        assert!(logs_contain("step down"));
        assert!(logs_contain("resume election participation"));
        assert_eq!(store.get("/leader", false).await.unwrap().node.value, "a");
        client.close().await;
        assert!(logs_contain("client is closing"));
    }
}
