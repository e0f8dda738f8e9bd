//! SQLite database layer for Sidechat.
//!
//! Provides the flat key-value store the sidebar persists into:
//! - `apiKey` and `model` (settings)
//! - `conversationHistory` (the whole conversation, rewritten on every change)
//!
//! Values are stored as JSON text.

mod migrations;

use std::path::PathBuf;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Environment variable overriding the database location.
pub const DB_PATH_ENV: &str = "SIDECHAT_DB";

/// Errors raised by the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Invalid stored value for '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Database connection wrapper.
///
/// Provides a high-level API for interacting with the SQLite database.
/// Automatically handles connection setup, migrations, and file permissions.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open the database at the default location.
    ///
    /// Default path: `~/.local/share/sidechat/sidechat.db`, or `$SIDECHAT_DB`.
    pub fn open() -> anyhow::Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open the database at a specific path.
    ///
    /// Creates parent directories if they don't exist.
    /// Sets file permissions to 0600 on Unix (the API key lives here).
    pub fn open_at(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to set database file permissions");
            }
        }

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Open a throwaway in-memory database.
    ///
    /// Used as a fallback when the on-disk database can't be opened; nothing
    /// survives the process.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn, path: None })
    }

    /// Get the default database path.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        if let Some(custom) = std::env::var_os(DB_PATH_ENV) {
            return Ok(PathBuf::from(custom));
        }

        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

        Ok(data_dir.join("sidechat").join("sidechat.db"))
    }

    /// Run database migrations.
    ///
    /// Safe to call multiple times - migrations are tracked and only run once.
    pub fn migrate(&self) -> Result<(), StoreError> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    // =========================================================================
    // Raw values
    // =========================================================================

    /// Store a raw JSON string under `key` (upsert).
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO storage (key, value, updated_at) VALUES (?, ?, unixepoch())
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            [key, value],
        )?;
        Ok(())
    }

    /// Get the raw JSON string stored under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM storage WHERE key = ?")?;
        let result = stmt.query_row([key], |row| row.get(0));
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Typed values
    // =========================================================================

    /// Serialize `value` as JSON and store it under `key`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, &json)
    }

    /// Load and deserialize the value under `key`.
    ///
    /// Returns `Ok(None)` if the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
