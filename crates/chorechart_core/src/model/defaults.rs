//! Built-in seed document.
//!
//! Used when the store holds no document yet, and as the floor that
//! normalization merges under every document read.

use crate::model::child::{Child, ChildId};
use crate::model::state::AppState;
use crate::model::task::{Task, TaskSet};
use std::collections::BTreeMap;

/// Task set used when a child's assignment is missing or dangling.
pub const DEFAULT_FALLBACK_TASK_SET_ID: &str = "alex_tasks";

/// Returns the built-in default document.
pub fn default_app_state() -> AppState {
    let task_sets = [alex_tasks(), cecci_tasks(), vicka_tasks()]
        .into_iter()
        .map(|set| (set.id.clone(), set))
        .collect::<BTreeMap<_, _>>();

    let children = [
        Child::new(
            ChildId::Alex,
            "Alex",
            "alex_tasks",
            "linear-gradient(to bottom right, #FFA500, #0066FF)",
        ),
        Child::new(
            ChildId::Cecci,
            "Cecci",
            "cecci_tasks",
            "linear-gradient(to bottom right, #fbd3e9, #bb377d)",
        ),
        Child::new(
            ChildId::Vicka,
            "Vicka",
            "vicka_tasks",
            "linear-gradient(to bottom right, #ff4e50, #f9d423)",
        ),
    ]
    .into_iter()
    .map(|child| (child.id, child))
    .collect::<BTreeMap<_, _>>();

    AppState {
        task_sets,
        children,
        last_reset: None,
    }
}

fn school_day_tasks() -> Vec<Task> {
    vec![
        Task::new("make_bed", "🛏️", 1),
        Task::new("brush_teeth_morning", "🪥☀️", 2),
        Task::new("do_homework", "📚✏️", 3),
        Task::new("take_dog_out", "🐶", 4),
        Task::new("read_book", "📖", 5),
        Task::new("clean_room", "🧹", 6),
        Task::new("brush_teeth_evening", "🪥🌙", 7),
    ]
}

fn alex_tasks() -> TaskSet {
    TaskSet::new("alex_tasks", "Alex's Tasks", school_day_tasks())
}

fn vicka_tasks() -> TaskSet {
    TaskSet::new("vicka_tasks", "Vicka's Tasks", school_day_tasks())
}

fn cecci_tasks() -> TaskSet {
    TaskSet::new(
        "cecci_tasks",
        "Cecci's Tasks",
        vec![
            Task::new("make_bed", "🛏️", 1),
            Task::new("brush_teeth_morning", "🪥☀️", 2),
            Task::new("clean_room", "🧹", 3),
            Task::new("draw_picture", "🎨✏️", 4),
            Task::new("play", "🧸🪁", 5),
            Task::new("practice_letters", "🔠✏️", 6),
            Task::new("go_out", "🏃🌳", 7),
            Task::new("brush_teeth_evening", "🪥🌙", 8),
        ],
    )
}
