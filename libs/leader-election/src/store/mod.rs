//! Coordination store contract.
//!
//! The election and watch loops only depend on the [`CoordinationStore`] and
//! [`StoreWatcher`] traits. Adapters decode the store's native operation
//! names into [`StoreOperation`] at this boundary.

use std::{convert::Infallible, fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;

pub mod memory;

/// Operation that produced a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
    /// An operation name this crate does not know about.
    Unknown(String),
}

impl StoreOperation {
    pub fn as_str(&self) -> &str {
        match self {
            StoreOperation::Get => "get",
            StoreOperation::Set => "set",
            StoreOperation::Create => "create",
            StoreOperation::Update => "update",
            StoreOperation::CompareAndSwap => "compareAndSwap",
            StoreOperation::Delete => "delete",
            StoreOperation::CompareAndDelete => "compareAndDelete",
            StoreOperation::Expire => "expire",
            StoreOperation::Unknown(name) => name,
        }
    }
}

impl FromStr for StoreOperation {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "get" => StoreOperation::Get,
            "set" => StoreOperation::Set,
            "create" => StoreOperation::Create,
            "update" => StoreOperation::Update,
            "compareAndSwap" => StoreOperation::CompareAndSwap,
            "delete" => StoreOperation::Delete,
            "compareAndDelete" => StoreOperation::CompareAndDelete,
            "expire" => StoreOperation::Expire,
            other => StoreOperation::Unknown(other.to_owned()),
        })
    }
}

impl From<&str> for StoreOperation {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(op) => op,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key or directory in the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    /// Empty for directories and for deleted/expired keys.
    pub value: String,
    pub dir: bool,
    /// Children of a directory, populated on recursive reads.
    pub nodes: Vec<Node>,
    pub created_index: u64,
    pub modified_index: u64,
    /// Set when the key carries a TTL.
    pub expiration: Option<DateTime<Utc>>,
    pub ttl: Option<Duration>,
}

impl Node {
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn dir(key: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            key: key.into(),
            dir: true,
            nodes,
            ..Default::default()
        }
    }
}

/// Result of a read, a write, or a watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub operation: StoreOperation,
    pub node: Node,
    /// State of the key before a mutation, if it existed.
    pub prev_node: Option<Node>,
    /// Store index at which this response was produced. For watch events it
    /// is the index of the mutation.
    pub index: u64,
}

/// Client-side contract of a coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    type Watcher: StoreWatcher;

    /// Read a key. Recursive reads return the subtree under `key` as a
    /// directory node. Fails with `NotFound` when absent.
    async fn get(&self, key: &str, recursive: bool) -> StoreResult<Response>;

    /// Create `key` with a TTL, failing with `AlreadyExists` if it exists.
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<Response>;

    /// Replace `key` with `value` and a fresh TTL if its current value and
    /// modified index match `prev_value` and `prev_index`.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        prev_value: &str,
        prev_index: u64,
    ) -> StoreResult<Response>;

    /// Open a watch yielding changes strictly after `after_index`.
    fn watch(&self, key: &str, after_index: u64, recursive: bool) -> Self::Watcher;

    /// Store endpoints, for logging.
    fn endpoints(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Handle on a long-poll watch.
#[async_trait]
pub trait StoreWatcher: Send + 'static {
    /// Block until the next change. `WatchExpired` means the position has
    /// been truncated and the watch must be recreated.
    async fn next(&mut self) -> StoreResult<Response>;
}
