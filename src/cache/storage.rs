//! Persistence backends: SQLite and a no-op fallback.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::{CacheKey, EntityType};
use super::traits::Persistence;

/// Persistence that doesn't store anything.
/// Used when persistence is disabled - the cache is memory-only.
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
  fn read(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn write(&self, _key: &CacheKey, _bytes: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &CacheKey) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<CacheKey>> {
    Ok(Vec::new())
  }

  fn read_setting(&self, _name: &str) -> Result<Option<String>> {
    Ok(None)
  }

  fn write_setting(&self, _name: &str, _value: Option<&str>) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based persistence.
pub struct SqlitePersistence {
  conn: Mutex<Connection>,
}

impl SqlitePersistence {
  /// Open the database at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory database, mostly useful in tests.
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    digest TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS settings (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn digest(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

impl Persistence for SqlitePersistence {
  fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, digest FROM entity_cache WHERE entity_type = ? AND entity_id = ?",
        params![key.entity_type.as_str(), key.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match row {
      Some((data, stored)) => {
        let actual = digest(&data);
        if actual != stored {
          return Err(eyre!(
            "Corrupt row for {}: expected digest {}, got {}",
            key,
            stored,
            actual
          ));
        }
        Ok(Some(data))
      }
      None => Ok(None),
    }
  }

  fn write(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_id, data, digest, written_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![key.entity_type.as_str(), key.id, bytes, digest(bytes)],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &CacheKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ? AND entity_id = ?",
        params![key.entity_type.as_str(), key.id],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<CacheKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT entity_type, entity_id FROM entity_cache ORDER BY entity_type, entity_id")
      .map_err(|e| eyre!("Failed to prepare key scan: {}", e))?;

    let keys = stmt
      .query_map([], |row| {
        let kind: String = row.get(0)?;
        let id: String = row.get(1)?;
        Ok((kind, id))
      })
      .map_err(|e| eyre!("Failed to scan keys: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|(kind, id)| {
        kind
          .parse::<EntityType>()
          .ok()
          .map(|entity_type| CacheKey::new(entity_type, id))
      })
      .collect();

    Ok(keys)
  }

  fn read_setting(&self, name: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM settings WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", name, e))
  }

  fn write_setting(&self, name: &str, value: Option<&str>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO settings (name, value, written_at) VALUES (?, ?, datetime('now'))",
        params![name, value],
      ),
      None => conn.execute("DELETE FROM settings WHERE name = ?", params![name]),
    }
    .map_err(|e| eyre!("Failed to write setting {}: {}", name, e))?;

    Ok(())
  }
}
