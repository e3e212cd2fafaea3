//! Device-local persistence.
//!
//! # Responsibility
//! - Keep per-device preferences out of the shared document.
//! - Isolate SQLite query details from services.
//!
//! # Invariants
//! - Nothing stored here is shared between devices.
//! - Unparseable stored values read as absent instead of failing.

pub mod device_prefs;
