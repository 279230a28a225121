//! # leader-election
//!
//! Leader election and change notification over a coordination store with
//! per-key TTLs, compare-and-swap and indexed watches.
//!
//! This library provides:
//! - **Voter** that acquires a lease on a key and renews it while enabled,
//!   with pause/resume and a timed step-down.
//! - **Lease loops** that hold further keys until a caller's token is
//!   cancelled.
//! - **Watch loops** that keep a callback or channel in sync with a key or a
//!   subtree across history truncation and store failures.
//! - **Action model** flattening subtree changes into create/update/delete
//!   records.
//! - **In-memory store** implementing the store contract, for tests and
//!   single-process use.
//! - **Backend set** that turns subtree actions into a host list.
//!
//! ## Design Principles
//!
//! - Store access goes through the [`CoordinationStore`] trait only.
//! - Background loops absorb and log store errors; only registration and
//!   configuration errors reach the caller.
//! - One cancellation token per client; [`Client::close`] waits for every
//!   spawned task.

pub mod action;
pub mod backends;
pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod voter;
mod watch;

// Re-export key types for convenient access
pub use action::{Action, ActionType, response_to_actions};
pub use backends::BackendSet;
pub use backoff::CountedBackoff;
pub use client::{Client, ClientBuilder};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{BackoffConfig, ElectionConfig};
pub use error::{ElectionError, ElectionResult, StoreError, StoreResult};
pub use store::memory::{MemoryStore, MemoryWatcher};
pub use store::{CoordinationStore, Node, Response, StoreOperation, StoreWatcher};
pub use voter::{ElectOutcome, LeaseUpdate, LeaseUpdateKind, elect};
