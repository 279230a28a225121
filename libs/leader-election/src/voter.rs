//! Lease acquisition and renewal.
//!
//! A voter ticks at a fifth of its term and runs [`elect`] on every tick while
//! enabled. It can be disabled and re-enabled without exiting, and a step-down
//! suspends it for two terms so that peers get a chance to take the lease.
//!
//! A lease loop runs the same ticker for an extra key. It has no commands and
//! stops when its own token is cancelled.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, mpsc},
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::{CoordinationStore, Response};

/// What a single election attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectOutcome {
    /// The key was absent and this participant created it.
    Acquired(Response),
    /// The lease was ours and close to expiry, so it was extended.
    Renewed(Response),
    /// Another participant holds the key.
    HeldByOther,
    /// The lease is ours and has more than half of its term left.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseUpdateKind {
    Acquired,
    Renewed,
}

/// Published after every successful acquisition or renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseUpdate {
    pub kind: LeaseUpdateKind,
    pub key: String,
    pub value: String,
    /// Store index of the write.
    pub index: u64,
    pub expiration: Option<DateTime<Utc>>,
}

/// Run one election attempt for `key`.
///
/// A missing key is created with a TTL of `term`. A key holding `value` is
/// extended by compare-and-swap once at most half of its term is left,
/// conditioned on the value and modified index just read. Any other read
/// error is returned as is; callers retry on their next tick.
pub async fn elect<S: CoordinationStore>(
    store: &S,
    clock: &dyn Clock,
    key: &str,
    value: &str,
    term: Duration,
) -> StoreResult<ElectOutcome> {
    let current = match store.get(key, false).await {
        Ok(resp) => resp,
        Err(StoreError::NotFound { .. }) => {
            let resp = store.create(key, value, term).await?;
            return Ok(ElectOutcome::Acquired(resp));
        }
        Err(err) => return Err(err),
    };
    if current.node.value != value {
        return Ok(ElectOutcome::HeldByOther);
    }
    let remaining = current
        .node
        .expiration
        .map(|exp| (exp - clock.now()).to_std().unwrap_or_default())
        .unwrap_or_default();
    if remaining > term / 2 {
        return Ok(ElectOutcome::Fresh);
    }
    let resp = store
        .compare_and_swap(key, value, term, value, current.node.modified_index)
        .await?;
    Ok(ElectOutcome::Renewed(resp))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoterCommand {
    Enable,
    Disable,
    StepDown,
}

/// Election state shared by the voter and lease loops: one key, one value,
/// one term.
pub(crate) struct Campaign<S> {
    pub(crate) store: Arc<S>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) term: Duration,
    pub(crate) leases: broadcast::Sender<LeaseUpdate>,
    pub(crate) token: CancellationToken,
}

impl<S: CoordinationStore> Campaign<S> {
    /// Ticks every fifth of the term, starting one period from now.
    fn ticker(&self) -> Interval {
        let period = (self.term / 5).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn attempt(&self) {
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            result = elect(
                self.store.as_ref(),
                self.clock.as_ref(),
                &self.key,
                &self.value,
                self.term,
            ) => result,
        };
        match result {
            Ok(ElectOutcome::Acquired(resp)) => {
                info!(index = resp.index, "acquired lease");
                self.publish(LeaseUpdateKind::Acquired, &resp);
            }
            Ok(ElectOutcome::Renewed(resp)) => {
                debug!(index = resp.index, "extended lease");
                self.publish(LeaseUpdateKind::Renewed, &resp);
            }
            Ok(ElectOutcome::HeldByOther | ElectOutcome::Fresh) => {}
            Err(err) if err.is_precondition_failed() => {
                debug!(?err, "lost election race");
            }
            Err(err) => warn!(?err, "failed to run election term"),
        }
    }

    fn publish(&self, kind: LeaseUpdateKind, resp: &Response) {
        // No subscribers is fine.
        let _ = self.leases.send(LeaseUpdate {
            kind,
            key: resp.node.key.clone(),
            value: resp.node.value.clone(),
            index: resp.index,
            expiration: resp.node.expiration,
        });
    }
}

pub(crate) struct Voter<S> {
    pub(crate) campaign: Campaign<S>,
    pub(crate) commands: mpsc::Receiver<VoterCommand>,
}

impl<S: CoordinationStore> Voter<S> {
    pub(crate) async fn run(mut self, enabled: bool) {
        let campaign = &self.campaign;
        let mut ticker = None;
        if enabled {
            campaign.attempt().await;
            ticker = Some(campaign.ticker());
        }
        loop {
            tokio::select! {
                biased;
                _ = campaign.token.cancelled() => {
                    info!("voter is closing");
                    return;
                }
                command = self.commands.recv() => match command {
                    Some(VoterCommand::Enable) => {
                        if ticker.is_none() {
                            info!("resume election participation");
                            ticker = Some(campaign.ticker());
                        }
                    }
                    Some(VoterCommand::Disable) => {
                        info!("pause election participation");
                        ticker = None;
                    }
                    Some(VoterCommand::StepDown) => {
                        info!("step down");
                        tokio::select! {
                            biased;
                            _ = campaign.token.cancelled() => return,
                            _ = tokio::time::sleep(campaign.term * 2) => {
                                info!("resume election participation");
                            }
                        }
                    }
                    None => {
                        debug!("voter command channel closed");
                        return;
                    }
                },
                _ = next_tick(&mut ticker) => campaign.attempt().await,
            }
        }
    }
}

/// Keeps one lease until its own token or the client is cancelled. Unlike
/// the voter it cannot be paused; a step-down skips attempts until the next
/// tick.
pub(crate) struct LeaseLoop<S> {
    pub(crate) campaign: Campaign<S>,
    pub(crate) step_downs: broadcast::Receiver<()>,
    pub(crate) stop: CancellationToken,
}

impl<S: CoordinationStore> LeaseLoop<S> {
    pub(crate) async fn run(mut self) {
        let mut ticker = self.campaign.ticker();
        self.attempt().await;
        loop {
            tokio::select! {
                biased;
                _ = self.campaign.token.cancelled() => {
                    info!("client is closing");
                    return;
                }
                _ = self.stop.cancelled() => {
                    info!("lease loop is closed");
                    return;
                }
                step_down = self.step_downs.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = step_down {
                        debug!("step down channel closed");
                        return;
                    }
                    info!("step down");
                    tokio::select! {
                        biased;
                        _ = self.campaign.token.cancelled() => return,
                        _ = self.stop.cancelled() => return,
                        _ = ticker.tick() => info!("resume election participation"),
                    }
                }
                _ = ticker.tick() => self.attempt().await,
            }
        }
    }

    async fn attempt(&self) {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {}
            _ = self.campaign.attempt() => {}
        }
    }
}

/// Completes on the next tick, or never while paused.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
