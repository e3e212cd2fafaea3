//! Task and task-set records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable task key, unique inside one task set.
pub type TaskId = String;

/// Stable task-set key, unique inside the document.
pub type TaskSetId = String;

/// One chore shown as an emoji button.
///
/// Tasks are edited through configuration only; end users never mutate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Display label.
    pub name: String,
    pub emoji: String,
    /// Display sequence inside the owning set.
    pub order: i64,
}

impl Task {
    pub fn new(id: impl Into<String>, emoji: impl Into<String>, order: i64) -> Self {
        let emoji = emoji.into();
        Self {
            id: id.into(),
            name: emoji.clone(),
            emoji,
            order,
        }
    }
}

/// Named group of tasks assigned to one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSet {
    pub id: TaskSetId,
    pub name: String,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl TaskSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: tasks
                .into_iter()
                .map(|task| (task.id.clone(), task))
                .collect(),
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Returns tasks in display order: `order` ascending, ties broken by id.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut tasks = self.tasks.values().collect::<Vec<_>>();
        tasks.sort_by(|left, right| {
            left.order
                .cmp(&right.order)
                .then_with(|| left.id.cmp(&right.id))
        });
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskSet};

    #[test]
    fn ordered_tasks_breaks_ties_by_id() {
        let set = TaskSet::new(
            "set",
            "Set",
            vec![
                Task::new("walk_dog", "🐶", 2),
                Task::new("make_bed", "🛏️", 1),
                Task::new("feed_cat", "🐱", 2),
            ],
        );

        let ids = set
            .ordered_tasks()
            .into_iter()
            .map(|task| task.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["make_bed", "feed_cat", "walk_dog"]);
    }
}
