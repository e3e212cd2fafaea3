//! Client-side use-case services.
//!
//! # Responsibility
//! - Bridge a store adapter to the presentation layer (`sync_service`).
//! - Clear completion sets once per day (`reset_scheduler`).
//!
//! # Invariants
//! - Services never read-modify-write with separate get/set calls.
//! - Services stay backend-agnostic: they only see `StoreAdapter`.

pub mod clock;
pub mod reset_scheduler;
pub mod sync_service;
