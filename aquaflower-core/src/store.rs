//! Config entry persistence via SQLite + WAL.
//!
//! One row per integration entry. `data` and `options` are stored as JSON
//! text and interpreted by the owning integration. Entries are restored at
//! startup before the HTTP server accepts connections.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted integration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub data: Value,
    pub options: Value,
    pub created_at: String,
}

impl ConfigEntry {
    pub fn new(domain: &str, title: &str, data: Value) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().simple().to_string(),
            domain: domain.to_string(),
            title: title.to_string(),
            data,
            options: Value::Object(Default::default()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Open (or create) the SQLite database with WAL mode.
fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS config_entries (
            entry_id   TEXT PRIMARY KEY,
            domain     TEXT NOT NULL,
            title      TEXT NOT NULL,
            data       TEXT NOT NULL DEFAULT '{}',
            options    TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entries_domain
            ON config_entries(domain);",
    )?;

    Ok(conn)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ConfigEntry, String, String)> {
    Ok((
        ConfigEntry {
            entry_id: row.get(0)?,
            domain: row.get(1)?,
            title: row.get(2)?,
            data: Value::Null,
            options: Value::Null,
            created_at: row.get(5)?,
        },
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
    ))
}

fn decode_json(entry: &mut ConfigEntry, data: &str, options: &str) {
    entry.data = serde_json::from_str(data).unwrap_or_else(|e| {
        tracing::warn!(entry_id = %entry.entry_id, "Corrupt entry data: {}", e);
        Value::Object(Default::default())
    });
    entry.options = serde_json::from_str(options).unwrap_or_else(|e| {
        tracing::warn!(entry_id = %entry.entry_id, "Corrupt entry options: {}", e);
        Value::Object(Default::default())
    });
}

/// Create the database and schema if missing.
pub fn init(db_path: &Path) -> anyhow::Result<()> {
    open_db(db_path)?;
    Ok(())
}

/// Insert or replace an entry.
pub fn save_entry(db_path: &Path, entry: &ConfigEntry) -> anyhow::Result<()> {
    let conn = open_db(db_path)?;
    conn.execute(
        "INSERT INTO config_entries (entry_id, domain, title, data, options, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(entry_id) DO UPDATE SET
            domain = excluded.domain,
            title = excluded.title,
            data = excluded.data,
            options = excluded.options",
        params![
            entry.entry_id,
            entry.domain,
            entry.title,
            serde_json::to_string(&entry.data)?,
            serde_json::to_string(&entry.options)?,
            entry.created_at,
        ],
    )?;
    Ok(())
}

/// Load every entry, oldest first.
pub fn load_entries(db_path: &Path) -> anyhow::Result<Vec<ConfigEntry>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT entry_id, domain, title, data, options, created_at
         FROM config_entries ORDER BY created_at, entry_id",
    )?;
    let entries = stmt
        .query_map([], row_to_entry)?
        .filter_map(|r| r.ok())
        .map(|(mut entry, data, options)| {
            decode_json(&mut entry, &data, &options);
            entry
        })
        .collect();
    Ok(entries)
}

pub fn get_entry(db_path: &Path, entry_id: &str) -> anyhow::Result<Option<ConfigEntry>> {
    let conn = open_db(db_path)?;
    let row = conn
        .query_row(
            "SELECT entry_id, domain, title, data, options, created_at
             FROM config_entries WHERE entry_id = ?1",
            params![entry_id],
            row_to_entry,
        )
        .optional()?;

    Ok(row.map(|(mut entry, data, options)| {
        decode_json(&mut entry, &data, &options);
        entry
    }))
}

/// Replace an entry's options. Returns false when the entry does not exist.
pub fn update_options(db_path: &Path, entry_id: &str, options: &Value) -> anyhow::Result<bool> {
    let conn = open_db(db_path)?;
    let updated = conn.execute(
        "UPDATE config_entries SET options = ?2 WHERE entry_id = ?1",
        params![entry_id, serde_json::to_string(options)?],
    )?;
    Ok(updated > 0)
}

pub fn delete_entry(db_path: &Path, entry_id: &str) -> anyhow::Result<bool> {
    let conn = open_db(db_path)?;
    let deleted = conn.execute(
        "DELETE FROM config_entries WHERE entry_id = ?1",
        params![entry_id],
    )?;
    Ok(deleted > 0)
}

/// Run a store call on the blocking pool, off the async workers.
pub async fn blocking<T, F>(db_path: &Path, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Path) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db: PathBuf = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || f(&db)).await?
}
