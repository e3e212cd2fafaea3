//! Child records and the fixed child enumeration.

use crate::model::task::{TaskId, TaskSetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The fixed set of children the household tracks.
///
/// Serialized as the lowercase id used for document keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildId {
    Alex,
    Cecci,
    Vicka,
}

impl ChildId {
    /// All known children in id order.
    pub const ALL: [ChildId; 3] = [ChildId::Alex, ChildId::Cecci, ChildId::Vicka];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alex => "alex",
            Self::Cecci => "cecci",
            Self::Vicka => "vicka",
        }
    }

    /// Parses a document key; unknown ids yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alex" => Some(Self::Alex),
            "cecci" => Some(Self::Cecci),
            "vicka" => Some(Self::Vicka),
            _ => None,
        }
    }
}

impl Display for ChildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChildId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value.trim()).ok_or_else(|| format!("unknown child id `{value}`"))
    }
}

/// Per-child view configuration plus today's completion marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    pub id: ChildId,
    pub name: String,
    pub task_set_id: TaskSetId,
    /// Task ids marked done since the last reset. Sorted on the wire.
    pub completed_tasks: BTreeSet<TaskId>,
    pub background_color: String,
}

impl Child {
    pub fn new(
        id: ChildId,
        name: impl Into<String>,
        task_set_id: impl Into<String>,
        background_color: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            task_set_id: task_set_id.into(),
            completed_tasks: BTreeSet::new(),
            background_color: background_color.into(),
        }
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.contains(task_id)
    }
}
