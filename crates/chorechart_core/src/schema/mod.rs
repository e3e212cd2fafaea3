//! Document schema policy: defaults, fallback assignment and repair.
//!
//! # Responsibility
//! - Coerce any raw document read from a store into a valid `AppState`.
//! - Own the built-in defaults that every document is merged over.
//!
//! # Invariants
//! - Normalization is pure and idempotent.
//! - Keys present in a document always win over built-in defaults.
//! - Stale completion ids and unknown child ids are dropped silently.

mod normalize;

use crate::model::child::{Child, ChildId};
use crate::model::defaults::{default_app_state, DEFAULT_FALLBACK_TASK_SET_ID};
use crate::model::state::AppState;
use normalize::{parse_document, ParsedChild, ParsedDocument};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Schema configuration that cannot produce valid documents.
///
/// Raised only at construction time; a valid `Schema` never fails to
/// normalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Fallback task-set id is not one of the default task sets.
    UnknownFallbackTaskSet(String),
    /// A default child points at a task set the defaults do not define.
    DanglingDefaultChild {
        child: ChildId,
        task_set_id: String,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFallbackTaskSet(id) => {
                write!(f, "fallback task set `{id}` is not a default task set")
            }
            Self::DanglingDefaultChild { child, task_set_id } => write!(
                f,
                "default child `{child}` references unknown task set `{task_set_id}`"
            ),
        }
    }
}

impl Error for ValidationError {}

/// Defaults plus fallback policy used to normalize documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    defaults: AppState,
    fallback_task_set_id: String,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            defaults: default_app_state(),
            fallback_task_set_id: DEFAULT_FALLBACK_TASK_SET_ID.to_string(),
        }
    }
}

impl Schema {
    /// Creates a schema from custom defaults.
    ///
    /// # Errors
    /// - `UnknownFallbackTaskSet` when `fallback_task_set_id` is not a key of
    ///   `defaults.task_sets`.
    /// - `DanglingDefaultChild` when a default child is unresolvable.
    pub fn new(
        defaults: AppState,
        fallback_task_set_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let fallback_task_set_id = fallback_task_set_id.into();
        if !defaults.task_sets.contains_key(&fallback_task_set_id) {
            return Err(ValidationError::UnknownFallbackTaskSet(
                fallback_task_set_id,
            ));
        }
        if let Some(child) = defaults
            .children
            .values()
            .find(|child| !defaults.task_sets.contains_key(&child.task_set_id))
        {
            return Err(ValidationError::DanglingDefaultChild {
                child: child.id,
                task_set_id: child.task_set_id.clone(),
            });
        }

        Ok(Self {
            defaults,
            fallback_task_set_id,
        })
    }

    /// Built-in defaults with a different fallback task set.
    pub fn with_fallback(fallback_task_set_id: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(default_app_state(), fallback_task_set_id)
    }

    pub fn defaults(&self) -> &AppState {
        &self.defaults
    }

    pub fn fallback_task_set_id(&self) -> &str {
        &self.fallback_task_set_id
    }

    /// Returns the document written when a store holds nothing yet.
    pub fn seed_state(&self) -> AppState {
        self.normalize_state(&self.defaults)
    }

    /// Coerces an arbitrary raw JSON value into a valid document.
    ///
    /// Non-object input normalizes like `{}`: defaults only.
    pub fn normalize(&self, raw: &Value) -> AppState {
        self.assemble(parse_document(raw))
    }

    /// Repairs an already-typed document (dangling assignments, stale
    /// completions, missing defaults).
    pub fn normalize_state(&self, state: &AppState) -> AppState {
        self.assemble(ParsedDocument::from_state(state))
    }

    /// Finds the first child whose assignment does not resolve.
    ///
    /// Whole-document replacement treats such a document as a caller bug
    /// instead of silently reassigning the child.
    pub fn find_dangling_assignment<'a>(&self, state: &'a AppState) -> Option<(ChildId, &'a str)> {
        state
            .children
            .values()
            .find(|child| !state.task_sets.contains_key(&child.task_set_id))
            .map(|child| (child.id, child.task_set_id.as_str()))
    }

    fn assemble(&self, parsed: ParsedDocument) -> AppState {
        let ParsedDocument {
            mut task_sets,
            mut children,
            last_reset,
        } = parsed;

        for (id, set) in &self.defaults.task_sets {
            task_sets.entry(id.clone()).or_insert_with(|| set.clone());
        }

        let mut normalized_children = BTreeMap::new();
        for id in ChildId::ALL {
            let default_child = self.defaults.children.get(&id);
            let parsed_child = match children.remove(&id) {
                Some(parsed_child) => parsed_child,
                None => match default_child {
                    Some(default_child) => ParsedChild::from_child(default_child),
                    None => continue,
                },
            };

            let task_set_id = parsed_child
                .task_set_id
                .filter(|task_set_id| task_sets.contains_key(task_set_id))
                .unwrap_or_else(|| self.fallback_task_set_id.clone());
            let completed_tasks = match task_sets.get(&task_set_id) {
                Some(set) => parsed_child
                    .completed_tasks
                    .into_iter()
                    .filter(|task_id| set.contains(task_id))
                    .collect(),
                None => BTreeSet::new(),
            };

            let name = parsed_child
                .name
                .or_else(|| default_child.map(|child| child.name.clone()))
                .unwrap_or_else(|| id.as_str().to_string());
            let background_color = parsed_child
                .background_color
                .or_else(|| default_child.map(|child| child.background_color.clone()))
                .unwrap_or_default();

            normalized_children.insert(
                id,
                Child {
                    id,
                    name,
                    task_set_id,
                    completed_tasks,
                    background_color,
                },
            );
        }

        AppState {
            task_sets,
            children: normalized_children,
            last_reset,
        }
    }
}
