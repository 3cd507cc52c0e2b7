use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{error, info, warn};

use privd_protocol::{FLAG_ALLOWED, FLAG_DENIED, MASK_PERMISSION};

use crate::error::PrivdError;

/// One persisted per-uid permission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEntry {
    pub uid: u32,
    pub packages: Vec<String>,
    pub flags: u32,
}

impl PermissionEntry {
    pub fn is_allowed(&self) -> bool {
        self.flags & FLAG_ALLOWED != 0
    }

    pub fn is_denied(&self) -> bool {
        self.flags & FLAG_DENIED != 0
    }
}

/// Durable mapping from principal uid to an allow/deny decision and an
/// associated package list. Absence of an entry means "undetermined".
pub trait PermissionStore: Send + Sync {
    /// Look up the stored entry for a uid. Never fails for a missing
    /// record; a malformed record reads as absent.
    fn find(&self, uid: u32) -> Option<PermissionEntry>;

    /// Masked flag merge: for each bit set in `mask`, copy that bit from
    /// `values` into the stored flags; other bits stay untouched. When the
    /// ALLOWED bit is being set true and a package list is supplied, the
    /// stored list is replaced wholesale. Durable before returning.
    fn update(
        &self,
        uid: u32,
        packages: Option<&[String]>,
        mask: u32,
        values: u32,
    ) -> Result<(), PrivdError>;

    /// Delete the entry for a uid. Idempotent.
    fn remove(&self, uid: u32) -> Result<(), PrivdError>;
}

/// SQLite-backed permission store that persists across broker restarts.
///
/// The connection sits behind a `std::sync::Mutex`, so every masked
/// read-modify-write of the flag bits is a single critical section and
/// concurrent updates cannot lose a bit. `synchronous=FULL` keeps writes
/// on disk before `update` returns.
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
    manager_uid: u32,
}

impl SqliteConfigStore {
    /// Open the store under `data_dir`, or in memory when `data_dir` is
    /// `None` (tests, ephemeral runs).
    pub fn open(data_dir: Option<&Path>, manager_uid: u32) -> Self {
        let conn = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).ok();
                let db_path = dir.join("privd.db");
                Connection::open(&db_path).unwrap_or_else(|e| {
                    error!(?e, path = %db_path.display(), "failed to open db, falling back to in-memory");
                    Connection::open_in_memory().expect("in-memory sqlite")
                })
            }
            None => Connection::open_in_memory().expect("in-memory sqlite"),
        };

        // WAL for concurrent readers; FULL sync so a grant recorded before
        // a crash is still there after restart.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS permissions (
                uid         INTEGER PRIMARY KEY NOT NULL,
                packages    TEXT NOT NULL DEFAULT '[]',
                flags       INTEGER NOT NULL DEFAULT 0,
                updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .expect("failed to create permissions table");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM permissions", [], |row| row.get(0))
            .unwrap_or(0);
        if count > 0 {
            info!(count, "loaded permission store from disk");
        }

        Self {
            conn: Mutex::new(conn),
            manager_uid,
        }
    }

    fn decode(uid: u32, packages_json: &str, flags_raw: i64) -> Option<PermissionEntry> {
        let Ok(flags) = u32::try_from(flags_raw) else {
            warn!(uid, flags_raw, "stored flags out of range, treating record as undetermined");
            return None;
        };
        if flags & !MASK_PERMISSION != 0 || flags & MASK_PERMISSION == MASK_PERMISSION {
            warn!(uid, flags, "stored flags malformed, treating record as undetermined");
            return None;
        }
        let packages: Vec<String> = match serde_json::from_str(packages_json) {
            Ok(packages) => packages,
            Err(e) => {
                warn!(uid, %e, "stored package list malformed, treating record as undetermined");
                return None;
            }
        };
        Some(PermissionEntry {
            uid,
            packages,
            flags,
        })
    }
}

impl PermissionStore for SqliteConfigStore {
    fn find(&self, uid: u32) -> Option<PermissionEntry> {
        if uid == self.manager_uid {
            // The owning application is always trusted and never needs
            // persisted state.
            return Some(PermissionEntry {
                uid,
                packages: Vec::new(),
                flags: FLAG_ALLOWED,
            });
        }

        let conn = self.conn.lock().ok()?;
        let row = conn
            .query_row(
                "SELECT packages, flags FROM permissions WHERE uid = ?1",
                [uid],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .ok()?;
        drop(conn);

        Self::decode(uid, &row.0, row.1)
    }

    fn update(
        &self,
        uid: u32,
        packages: Option<&[String]>,
        mask: u32,
        values: u32,
    ) -> Result<(), PrivdError> {
        let mask = mask & MASK_PERMISSION;

        let conn = self
            .conn
            .lock()
            .map_err(|e| PrivdError::Storage(format!("lock poisoned: {e}")))?;

        // Read-of-old-flags and write-of-new-flags stay inside this one
        // critical section; see the struct docs.
        let old_flags: u32 = conn
            .query_row(
                "SELECT flags FROM permissions WHERE uid = ?1",
                [uid],
                |row| row.get::<_, i64>(0),
            )
            .ok()
            .and_then(|raw| u32::try_from(raw).ok())
            .unwrap_or(0);

        let mut new_flags = (old_flags & !mask) | (values & mask);
        // ALLOWED and DENIED are mutually exclusive; the bit being set in
        // this call wins over a previously stored one.
        if new_flags & MASK_PERMISSION == MASK_PERMISSION {
            if mask & FLAG_ALLOWED != 0 && values & FLAG_ALLOWED != 0 {
                new_flags &= !FLAG_DENIED;
            } else {
                new_flags &= !FLAG_ALLOWED;
            }
        }

        let setting_allowed = mask & FLAG_ALLOWED != 0 && values & FLAG_ALLOWED != 0;
        let result = match packages {
            Some(packages) if setting_allowed => {
                let packages_json = serde_json::to_string(packages)
                    .map_err(|e| PrivdError::Storage(e.to_string()))?;
                conn.execute(
                    "INSERT INTO permissions (uid, packages, flags) VALUES (?1, ?2, ?3)
                     ON CONFLICT(uid) DO UPDATE SET
                        packages = excluded.packages,
                        flags = excluded.flags,
                        updated_at = datetime('now')",
                    rusqlite::params![uid, packages_json, new_flags],
                )
            }
            _ => conn.execute(
                "INSERT INTO permissions (uid, flags) VALUES (?1, ?2)
                 ON CONFLICT(uid) DO UPDATE SET
                    flags = excluded.flags,
                    updated_at = datetime('now')",
                rusqlite::params![uid, new_flags],
            ),
        };

        result.map_err(|e| PrivdError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, uid: u32) -> Result<(), PrivdError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PrivdError::Storage(format!("lock poisoned: {e}")))?;
        conn.execute("DELETE FROM permissions WHERE uid = ?1", [uid])
            .map_err(|e| PrivdError::Storage(e.to_string()))?;
        Ok(())
    }
}
