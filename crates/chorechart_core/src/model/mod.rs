//! Shared-document domain model.
//!
//! # Responsibility
//! - Define the canonical shape of the single shared chore document.
//! - Keep wire naming (`camelCase`) in one place via serde attributes.
//!
//! # Invariants
//! - Every entity is referenced by id inside one document; nothing owns
//!   anything else.
//! - `Child::completed_tasks` is a set; duplicates are unrepresentable.

pub mod child;
pub mod defaults;
pub mod state;
pub mod task;
