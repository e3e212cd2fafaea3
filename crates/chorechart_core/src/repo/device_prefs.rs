//! Device preference store backed by a local SQLite file.

use crate::db::{open_db, open_db_in_memory, DbResult};
use crate::model::child::ChildId;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Key holding the child last shown on this device.
pub const CURRENT_CHILD_KEY: &str = "current-child";
/// Key holding the pre-document reset marker older clients still read.
pub const LEGACY_LAST_RESET_KEY: &str = "last-reset";

/// Typed access to the `device_prefs` table.
pub struct DevicePrefs {
    conn: Mutex<Connection>,
}

impl DevicePrefs {
    /// Opens (or creates) the preference file at `path`.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn current_child(&self) -> DbResult<Option<ChildId>> {
        let Some(raw) = self.read(CURRENT_CHILD_KEY)? else {
            return Ok(None);
        };
        let parsed = ChildId::parse(raw.trim());
        if parsed.is_none() {
            warn!("event=prefs_read module=prefs status=ignored key={CURRENT_CHILD_KEY}");
        }
        Ok(parsed)
    }

    pub fn set_current_child(&self, child: ChildId) -> DbResult<()> {
        self.write(CURRENT_CHILD_KEY, child.as_str())
    }

    pub fn legacy_last_reset(&self) -> DbResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.read(LEGACY_LAST_RESET_KEY)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(_) => {
                warn!("event=prefs_read module=prefs status=ignored key={LEGACY_LAST_RESET_KEY}");
                Ok(None)
            }
        }
    }

    pub fn set_legacy_last_reset(&self, at: DateTime<Utc>) -> DbResult<()> {
        self.write(
            LEGACY_LAST_RESET_KEY,
            &at.to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    /// Removes one key; missing keys are fine.
    pub fn remove(&self, key: &str) -> DbResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM device_prefs WHERE key = ?1;", params![key])?;
        Ok(())
    }

    fn read(&self, key: &str) -> DbResult<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM device_prefs WHERE key = ?1;",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: &str) -> DbResult<()> {
        self.conn.lock().execute(
            "INSERT INTO device_prefs (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
            params![key, value, Utc::now().timestamp_millis()],
        )?;
        debug!("event=prefs_write module=prefs status=ok key={key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DevicePrefs, CURRENT_CHILD_KEY, LEGACY_LAST_RESET_KEY};
    use crate::model::child::ChildId;
    use chrono::{TimeZone, Utc};

    #[test]
    fn current_child_round_trips_and_ignores_garbage() {
        let prefs = DevicePrefs::open_in_memory().expect("prefs should open");
        assert_eq!(prefs.current_child().expect("read"), None);

        prefs.set_current_child(ChildId::Vicka).expect("write");
        assert_eq!(prefs.current_child().expect("read"), Some(ChildId::Vicka));

        prefs.write(CURRENT_CHILD_KEY, "grandma").expect("write");
        assert_eq!(prefs.current_child().expect("read"), None);
    }

    #[test]
    fn legacy_marker_parses_rfc3339_only() {
        let prefs = DevicePrefs::open_in_memory().expect("prefs should open");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).single().expect("valid date");
        prefs.set_legacy_last_reset(at).expect("write");
        assert_eq!(prefs.legacy_last_reset().expect("read"), Some(at));

        prefs.write(LEGACY_LAST_RESET_KEY, "Fri Mar 01 2024").expect("write");
        assert_eq!(prefs.legacy_last_reset().expect("read"), None);

        prefs.remove(LEGACY_LAST_RESET_KEY).expect("remove");
        assert_eq!(prefs.legacy_last_reset().expect("read"), None);
    }
}
