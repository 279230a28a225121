//! Flattened change records produced by recursive watches.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::{Node, Response, StoreOperation};

/// Kind of change an [`Action`] represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    /// Store operation without a create/update/delete meaning, passed through
    /// under its raw name.
    Other(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
            ActionType::Other(name) => name,
        }
    }
}

impl From<&StoreOperation> for ActionType {
    fn from(op: &StoreOperation) -> Self {
        match op {
            StoreOperation::Get | StoreOperation::Set | StoreOperation::Create => {
                ActionType::Create
            }
            StoreOperation::CompareAndSwap | StoreOperation::Update => ActionType::Update,
            StoreOperation::CompareAndDelete | StoreOperation::Expire | StoreOperation::Delete => {
                ActionType::Delete
            }
            StoreOperation::Unknown(name) => ActionType::Other(name.clone()),
        }
    }
}

impl From<String> for ActionType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "create" => ActionType::Create,
            "update" => ActionType::Update,
            "delete" => ActionType::Delete,
            _ => ActionType::Other(s),
        }
    }
}

impl From<ActionType> for String {
    fn from(t: ActionType) -> Self {
        match t {
            ActionType::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change of a key in a watched subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "action")]
    pub kind: ActionType,
    /// Full key of the changed node, e.g. `/foo/bar`.
    pub key: String,
    /// Current value. Empty for deletes.
    pub value: String,
}

impl Action {
    pub fn new(kind: ActionType, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Convert a store response into one action per leaf, depth first.
///
/// An update of a key to the value it already held produces nothing.
pub fn response_to_actions(resp: &Response) -> Vec<Action> {
    let kind = ActionType::from(&resp.operation);
    if !resp.node.dir && kind == ActionType::Update {
        if let Some(prev) = &resp.prev_node {
            if prev.key == resp.node.key && prev.value == resp.node.value {
                return Vec::new();
            }
        }
    }
    let mut actions = Vec::new();
    collect_leaves(&kind, &resp.node, &mut actions);
    actions
}

fn collect_leaves(kind: &ActionType, node: &Node, out: &mut Vec<Action>) {
    if !node.dir {
        out.push(Action::new(kind.clone(), &node.key, &node.value));
        return;
    }
    for child in &node.nodes {
        collect_leaves(kind, child, out);
    }
}
