//! Lenient parsing of raw documents.
//!
//! Reads every field defensively: wrong types degrade to "absent" so the
//! caller can apply defaults. Nothing here fails.

use crate::model::child::{Child, ChildId};
use crate::model::state::AppState;
use crate::model::task::{Task, TaskSet};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub(super) struct ParsedDocument {
    pub task_sets: BTreeMap<String, TaskSet>,
    pub children: BTreeMap<ChildId, ParsedChild>,
    pub last_reset: Option<DateTime<Utc>>,
}

pub(super) struct ParsedChild {
    pub name: Option<String>,
    pub task_set_id: Option<String>,
    pub completed_tasks: BTreeSet<String>,
    pub background_color: Option<String>,
}

impl ParsedDocument {
    pub fn from_state(state: &AppState) -> Self {
        let task_sets = state
            .task_sets
            .iter()
            .map(|(key, set)| {
                let mut set = set.clone();
                set.id = key.clone();
                for (task_key, task) in set.tasks.iter_mut() {
                    task.id = task_key.clone();
                }
                (key.clone(), set)
            })
            .collect();

        Self {
            task_sets,
            children: state
                .children
                .iter()
                .map(|(id, child)| (*id, ParsedChild::from_child(child)))
                .collect(),
            last_reset: state.last_reset,
        }
    }
}

impl ParsedChild {
    pub fn from_child(child: &Child) -> Self {
        Self {
            name: Some(child.name.clone()),
            task_set_id: Some(child.task_set_id.clone()),
            completed_tasks: child.completed_tasks.clone(),
            background_color: Some(child.background_color.clone()),
        }
    }
}

pub(super) fn parse_document(raw: &Value) -> ParsedDocument {
    let empty = Map::new();
    let object = raw.as_object().unwrap_or(&empty);

    ParsedDocument {
        task_sets: parse_task_sets(object.get("taskSets")),
        children: parse_children(object.get("children")),
        last_reset: object.get("lastReset").and_then(parse_timestamp),
    }
}

fn parse_task_sets(value: Option<&Value>) -> BTreeMap<String, TaskSet> {
    let Some(entries) = value.and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(key, value)| {
            let object = value.as_object()?;
            let tasks = object
                .get("tasks")
                .and_then(Value::as_object)
                .map(|tasks| {
                    tasks
                        .iter()
                        .filter_map(|(task_key, task)| parse_task(task_key, task))
                        .map(|task| (task.id.clone(), task))
                        .collect()
                })
                .unwrap_or_default();

            Some((
                key.clone(),
                TaskSet {
                    id: key.clone(),
                    name: string_field(object, "name").unwrap_or_else(|| key.clone()),
                    tasks,
                },
            ))
        })
        .collect()
}

fn parse_task(key: &str, value: &Value) -> Option<Task> {
    let object = value.as_object()?;
    let emoji = string_field(object, "emoji").unwrap_or_default();
    let name = string_field(object, "name")
        .or_else(|| (!emoji.is_empty()).then(|| emoji.clone()))
        .unwrap_or_else(|| key.to_string());
    let order = object
        .get("order")
        .and_then(|order| order.as_i64().or_else(|| order.as_f64().map(|f| f as i64)))
        .unwrap_or(0);

    Some(Task {
        id: key.to_string(),
        name,
        emoji,
        order,
    })
}

fn parse_children(value: Option<&Value>) -> BTreeMap<ChildId, ParsedChild> {
    let Some(entries) = value.and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(key, value)| {
            let id = ChildId::parse(key)?;
            let object = value.as_object()?;
            Some((
                id,
                ParsedChild {
                    name: string_field(object, "name"),
                    task_set_id: string_field(object, "taskSetId")
                        .filter(|task_set_id| !task_set_id.trim().is_empty()),
                    completed_tasks: parse_completed(object.get("completedTasks")),
                    background_color: string_field(object, "backgroundColor"),
                },
            ))
        })
        .collect()
}

/// Accepts a list, an index-keyed object (sparse list as stored by the
/// hosted database) or a `{task_id: true}` map.
fn parse_completed(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::Object(entries)) => entries
            .iter()
            .filter_map(|(key, value)| match value {
                Value::String(task_id) => Some(task_id.clone()),
                Value::Bool(true) => Some(key.clone()),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}
