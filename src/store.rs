use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::error::Result;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Durable, idempotent record of migration progress.
///
/// Every method may be called concurrently from different workers.
pub trait TrackingStore: Send + Sync {
    /// All fingerprints already recorded for this account.
    fn migrated_fingerprints(&self, account_id: &str) -> Result<HashSet<String>>;

    fn is_migrated(&self, account_id: &str, fingerprint: &str) -> Result<bool>;

    fn migrated_count(&self, account_id: &str) -> Result<u64>;

    /// Insert-if-absent: recording the same fingerprint twice is a no-op.
    fn record_migration(
        &self,
        account_id: &str,
        fingerprint: &str,
        size_bytes: u32,
        payload: &str,
    ) -> Result<()>;

    fn is_done(&self, account_id: &str) -> Result<bool>;

    /// Insert-if-absent: marking an already-done account is a no-op.
    fn mark_done(&self, account_id: &str) -> Result<()>;

    fn append_log(&self, system: &str, account_id: &str, message: &str) -> Result<()>;
}

pub struct SqliteTrackingStore {
    pool: DbPool,
}

impl SqliteTrackingStore {
    pub fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(30))?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )
        });

        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .build(manager)?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrated_messages (
                account_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                payload TEXT NOT NULL,
                migrated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY(account_id, fingerprint)
            );

            CREATE TABLE IF NOT EXISTS done_accounts (
                account_id TEXT PRIMARY KEY NOT NULL,
                marked_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS migration_log (
                id INTEGER PRIMARY KEY,
                system TEXT NOT NULL,
                account_id TEXT NOT NULL,
                message TEXT NOT NULL,
                logged_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_migration_log_account
                ON migration_log(account_id);",
        )?;
        Ok(())
    }

    /// Log lines recorded for an account, oldest first.
    pub fn log_messages(&self, account_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT message FROM migration_log WHERE account_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![account_id], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

impl TrackingStore for SqliteTrackingStore {
    fn migrated_fingerprints(&self, account_id: &str) -> Result<HashSet<String>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT fingerprint FROM migrated_messages WHERE account_id = ?1")?;
        let rows = stmt.query_map(params![account_id], |row| row.get::<_, String>(0))?;

        let mut fingerprints = HashSet::new();
        for row in rows {
            fingerprints.insert(row?);
        }
        Ok(fingerprints)
    }

    fn is_migrated(&self, account_id: &str, fingerprint: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM migrated_messages WHERE account_id = ?1 AND fingerprint = ?2",
                params![account_id, fingerprint],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn migrated_count(&self, account_id: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM migrated_messages WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn record_migration(
        &self,
        account_id: &str,
        fingerprint: &str,
        size_bytes: u32,
        payload: &str,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO migrated_messages (account_id, fingerprint, size_bytes, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, fingerprint, size_bytes, payload],
        )?;
        Ok(())
    }

    fn is_done(&self, account_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM done_accounts WHERE account_id = ?1",
                params![account_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_done(&self, account_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO done_accounts (account_id, marked_at) VALUES (?1, ?2)",
            params![account_id, chrono::Local::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn append_log(&self, system: &str, account_id: &str, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO migration_log (system, account_id, message) VALUES (?1, ?2, ?3)",
            params![system, account_id, message],
        )?;
        Ok(())
    }
}
