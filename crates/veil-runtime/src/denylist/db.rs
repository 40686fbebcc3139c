//! Persistence of denylist rows and daemon settings.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use veil_common::error::{Result, VeilError};
use veil_common::types::DenylistEntry;

/// Name of the persisted enforcement setting.
pub const DENYLIST_SETTING: &str = "denylist";

/// Storage contract for the denylist table and the settings table.
pub trait DenylistDb: Send + Sync {
    /// Returns every persisted row.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the query fails.
    fn entries(&self) -> Result<Vec<DenylistEntry>>;

    /// Persists one row. Inserting an existing row is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the statement fails.
    fn insert(&self, entry: &DenylistEntry) -> Result<()>;

    /// Deletes the row for `(package, process)`, or every row of `package`
    /// when `process` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the statement fails.
    fn delete(&self, package: &str, process: Option<&str>) -> Result<()>;

    /// Reads an integer setting.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the query fails.
    fn setting(&self, key: &str) -> Result<Option<i64>>;

    /// Writes an integer setting.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the statement fails.
    fn set_setting(&self, key: &str, value: i64) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS denylist (
    package_name TEXT NOT NULL,
    process      TEXT NOT NULL,
    PRIMARY KEY (package_name, process)
);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// SQLite-backed [`DenylistDb`].
#[derive(Debug)]
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the file cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VeilError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path).map_err(sql_error)?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_error)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sql_error(e: rusqlite::Error) -> VeilError {
    VeilError::Persistence {
        message: e.to_string(),
    }
}

impl DenylistDb for SqliteDb {
    fn entries(&self) -> Result<Vec<DenylistEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT package_name, process FROM denylist")
            .map_err(sql_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DenylistEntry {
                    package: row.get(0)?,
                    process: row.get(1)?,
                })
            })
            .map_err(sql_error)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_error)
    }

    fn insert(&self, entry: &DenylistEntry) -> Result<()> {
        let _ = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO denylist (package_name, process) VALUES (?1, ?2)",
                params![entry.package, entry.process],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn delete(&self, package: &str, process: Option<&str>) -> Result<()> {
        let conn = self.conn();
        let _ = match process {
            Some(process) => conn.execute(
                "DELETE FROM denylist WHERE package_name = ?1 AND process = ?2",
                params![package, process],
            ),
            None => conn.execute(
                "DELETE FROM denylist WHERE package_name = ?1",
                params![package],
            ),
        }
        .map_err(sql_error)?;
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)
    }

    fn set_setting(&self, key: &str, value: i64) -> Result<()> {
        let _ = self
            .conn()
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(sql_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(package: &str, process: &str) -> DenylistEntry {
        DenylistEntry::new(package, process).expect("valid entry")
    }

    #[test]
    fn insert_is_idempotent() {
        let db = SqliteDb::open_in_memory().expect("db");
        db.insert(&entry("com.example.app", "")).expect("insert");
        db.insert(&entry("com.example.app", "")).expect("insert again");
        assert_eq!(db.entries().expect("entries").len(), 1);
    }

    #[test]
    fn delete_whole_package_or_single_process() {
        let db = SqliteDb::open_in_memory().expect("db");
        db.insert(&entry("com.example.app", "")).expect("insert");
        db.insert(&entry("com.example.app", "com.example.app:push"))
            .expect("insert");
        db.insert(&entry("org.other.app", "")).expect("insert");

        db.delete("com.example.app", Some("com.example.app:push"))
            .expect("delete one");
        assert_eq!(db.entries().expect("entries").len(), 2);

        db.delete("com.example.app", None).expect("delete package");
        let rest = db.entries().expect("entries");
        assert_eq!(rest, vec![entry("org.other.app", "")]);
    }

    #[test]
    fn settings_round_through_the_table() {
        let db = SqliteDb::open_in_memory().expect("db");
        assert_eq!(db.setting(DENYLIST_SETTING).expect("read"), None);
        db.set_setting(DENYLIST_SETTING, 1).expect("write");
        db.set_setting(DENYLIST_SETTING, 0).expect("overwrite");
        assert_eq!(db.setting(DENYLIST_SETTING).expect("read"), Some(0));
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/veil.db");
        {
            let db = SqliteDb::open(&path).expect("open");
            db.insert(&entry("com.example.app", "")).expect("insert");
        }
        let db = SqliteDb::open(&path).expect("reopen");
        assert_eq!(db.entries().expect("entries").len(), 1);
    }
}
