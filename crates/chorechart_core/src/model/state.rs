//! The single shared document.

use crate::model::child::{Child, ChildId};
use crate::model::task::TaskSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whole shared document: task sets, children and reset bookkeeping.
///
/// # Invariants (after normalization)
/// - Every `Child::task_set_id` is a key of `task_sets`.
/// - Every completed id is a task of the child's resolved set.
/// - `last_reset` never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub task_sets: BTreeMap<String, TaskSet>,
    pub children: BTreeMap<ChildId, Child>,
    pub last_reset: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn child(&self, id: ChildId) -> Option<&Child> {
        self.children.get(&id)
    }

    /// Resolves the task set assigned to `child`.
    pub fn task_set_for(&self, child: &Child) -> Option<&TaskSet> {
        self.task_sets.get(&child.task_set_id)
    }

    /// Returns whether every child has an empty completed set.
    pub fn all_completions_cleared(&self) -> bool {
        self.children
            .values()
            .all(|child| child.completed_tasks.is_empty())
    }

    /// Serializes to the JSON wire shape.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}
