//! Read-only projections for the rendering layer and child rotation.

use crate::db::DbResult;
use crate::model::child::ChildId;
use crate::model::state::AppState;
use crate::model::task::Task;
use crate::repo::device_prefs::DevicePrefs;
use std::collections::BTreeSet;

/// Everything needed to draw one child's screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildView {
    pub child_id: ChildId,
    pub name: String,
    pub background_color: String,
    pub task_set_name: String,
    /// Sorted by `(order, id)`.
    pub tasks: Vec<Task>,
    pub completed: BTreeSet<String>,
    pub completed_count: usize,
    pub total_count: usize,
    /// True only for a non-empty task list with every task done.
    pub all_done: bool,
}

impl ChildView {
    /// Builds the view for `child_id`; `None` when the child or its task
    /// set is missing.
    pub fn build(state: &AppState, child_id: ChildId) -> Option<Self> {
        let child = state.child(child_id)?;
        let task_set = state.task_set_for(child)?;
        let tasks = task_set
            .ordered_tasks()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        let completed = child
            .completed_tasks
            .iter()
            .filter(|task_id| task_set.contains(task_id))
            .cloned()
            .collect::<BTreeSet<_>>();
        let total_count = tasks.len();
        let completed_count = completed.len();

        Some(Self {
            child_id,
            name: child.name.clone(),
            background_color: child.background_color.clone(),
            task_set_name: task_set.name.clone(),
            tasks,
            completed,
            completed_count,
            total_count,
            all_done: total_count > 0 && completed_count == total_count,
        })
    }
}

/// Cyclic navigation over children, persisted per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRotation {
    order: Vec<ChildId>,
    index: usize,
}

impl ChildRotation {
    /// Starts at `saved` when it is one of `state`'s children, otherwise
    /// at the first child.
    pub fn new(state: &AppState, saved: Option<ChildId>) -> Self {
        let order = state.children.keys().copied().collect::<Vec<_>>();
        let index = saved
            .and_then(|id| order.iter().position(|candidate| *candidate == id))
            .unwrap_or(0);
        Self { order, index }
    }

    /// Starts from the child persisted in `prefs`.
    pub fn restore(state: &AppState, prefs: &DevicePrefs) -> DbResult<Self> {
        Ok(Self::new(state, prefs.current_child()?))
    }

    /// Current child; `None` when the document has no children.
    pub fn current(&self) -> Option<ChildId> {
        self.order.get(self.index).copied()
    }

    /// Moves to the next child, wrapping around, and persists it.
    pub fn next(&mut self, prefs: &DevicePrefs) -> DbResult<Option<ChildId>> {
        if !self.order.is_empty() {
            self.index = (self.index + 1) % self.order.len();
        }
        self.persist(prefs)
    }

    /// Moves to the previous child, wrapping around, and persists it.
    pub fn previous(&mut self, prefs: &DevicePrefs) -> DbResult<Option<ChildId>> {
        if !self.order.is_empty() {
            self.index = (self.index + self.order.len() - 1) % self.order.len();
        }
        self.persist(prefs)
    }

    fn persist(&self, prefs: &DevicePrefs) -> DbResult<Option<ChildId>> {
        let current = self.current();
        if let Some(child) = current {
            prefs.set_current_child(child)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChildRotation, ChildView};
    use crate::model::child::ChildId;
    use crate::model::defaults::default_app_state;
    use crate::repo::device_prefs::DevicePrefs;

    #[test]
    fn view_counts_and_all_done() {
        let mut state = default_app_state();
        let view = ChildView::build(&state, ChildId::Alex).expect("alex has a view");
        assert_eq!(view.total_count, 7);
        assert_eq!(view.completed_count, 0);
        assert!(!view.all_done);
        assert_eq!(view.tasks[0].id, "make_bed");

        let all = view.tasks.iter().map(|task| task.id.clone()).collect();
        state
            .children
            .get_mut(&ChildId::Alex)
            .expect("alex exists")
            .completed_tasks = all;
        let view = ChildView::build(&state, ChildId::Alex).expect("alex has a view");
        assert!(view.all_done);
    }

    #[test]
    fn rotation_wraps_and_persists() {
        let state = default_app_state();
        let prefs = DevicePrefs::open_in_memory().expect("prefs should open");
        let mut rotation = ChildRotation::restore(&state, &prefs).expect("restore");
        assert_eq!(rotation.current(), Some(ChildId::Alex));

        assert_eq!(rotation.previous(&prefs).expect("move"), Some(ChildId::Vicka));
        assert_eq!(prefs.current_child().expect("read"), Some(ChildId::Vicka));
        assert_eq!(rotation.next(&prefs).expect("move"), Some(ChildId::Alex));
        assert_eq!(rotation.next(&prefs).expect("move"), Some(ChildId::Cecci));

        let restored = ChildRotation::restore(&state, &prefs).expect("restore");
        assert_eq!(restored.current(), Some(ChildId::Cecci));
    }
}
