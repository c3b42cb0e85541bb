//! Identity store: SQLite metadata plus per-identity sample directories.
//!
//! Identity and sample rows live in SQLite; sample pixels live as PNG files
//! under `<samples_dir>/<storage_key>/`. Every mutation runs in one
//! transaction and bumps the store revision, which the trainer records so
//! callers can tell when a trained artifact has gone stale.

use crate::types::{Identity, IdentityRecord, SampleRef, StorageKey};
use image::GrayImage;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS identities (
        id          TEXT PRIMARY KEY NOT NULL,
        name        TEXT NOT NULL,
        storage_key TEXT NOT NULL UNIQUE,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS samples (
        identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
        seq         INTEGER NOT NULL,
        file_name   TEXT NOT NULL,
        captured_at TEXT NOT NULL,
        PRIMARY KEY (identity_id, seq)
    );

    CREATE TABLE IF NOT EXISTS store_meta (
        key   TEXT PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL
    );

    INSERT OR IGNORE INTO store_meta (key, value) VALUES ('revision', 0);
";

const TRASH_PREFIX: &str = ".trash-";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity already exists: {0}")]
    Conflict(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("sample image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Reject empty or whitespace-only identifiers and names before any mutation.
pub fn validate_identity(id: &str, name: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::InvalidInput("identity id must not be empty".into()));
    }
    validate_name(name)
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput("display name must not be empty".into()));
    }
    Ok(())
}

/// A consistent view of every identity and sample at one store revision.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub identities: Vec<Identity>,
}

impl StoreSnapshot {
    pub fn sample_count(&self) -> usize {
        self.identities.iter().map(|i| i.samples.len()).sum()
    }
}

/// Durable source of truth for who is enrolled.
///
/// Mutating methods take `&mut self`; a process holds one store handle and
/// funnels every write through it.
pub struct IdentityStore {
    conn: Connection,
    samples_dir: PathBuf,
}

impl IdentityStore {
    /// Open (or create) the store at `db_path`, keeping samples under `samples_dir`.
    pub fn open(db_path: &Path, samples_dir: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(samples_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;

        let store = Self {
            conn,
            samples_dir: samples_dir.to_path_buf(),
        };
        store.recover_trash()?;

        tracing::info!(
            db = %db_path.display(),
            samples = %samples_dir.display(),
            revision = store.revision()?,
            "identity store opened"
        );

        Ok(store)
    }

    /// Identities in enrollment order.
    pub fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM identities ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentityRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Identities with their physical storage handle, in enrollment order.
    pub fn list_with_storage_key(&self) -> Result<Vec<(IdentityRecord, StorageKey)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, storage_key FROM identities ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    IdentityRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    },
                    StorageKey::from(row.get::<_, String>(2)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name FROM identities WHERE id = ?1",
                [id],
                |row| {
                    Ok(IdentityRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Current store revision. Increases on every committed mutation.
    pub fn revision(&self) -> Result<u64, StoreError> {
        let value: i64 = self.conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'revision'",
            [],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }

    /// Allocate a new identity.
    pub fn create_identity(&mut self, id: &str, name: &str) -> Result<IdentityRecord, StoreError> {
        validate_identity(id, name)?;

        let key = StorageKey::generate();
        let dir = self.samples_dir.join(key.as_str());

        let tx = self.conn.transaction()?;
        let exists: Option<String> = tx
            .query_row("SELECT id FROM identities WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(id.to_string()));
        }

        tx.execute(
            "INSERT INTO identities (id, name, storage_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, key.as_str(), chrono::Local::now().to_rfc3339()],
        )?;
        bump_revision(&tx)?;

        fs::create_dir_all(&dir)?;
        if let Err(e) = tx.commit() {
            let _ = fs::remove_dir(&dir);
            return Err(e.into());
        }

        tracing::info!(id, name, storage_key = %key, "identity created");
        Ok(IdentityRecord::new(id, name))
    }

    /// Return the identity for `(id, name)`, creating it if absent.
    ///
    /// An existing id enrolled under a different name is a conflict: ids are
    /// unique and renames go through an edit session.
    pub fn ensure_identity(&mut self, id: &str, name: &str) -> Result<IdentityRecord, StoreError> {
        validate_identity(id, name)?;
        match self.get(id)? {
            Some(existing) if existing.name == name => Ok(existing),
            Some(existing) => Err(StoreError::Conflict(format!(
                "{id} is enrolled as {:?}, not {name:?}",
                existing.name
            ))),
            None => self.create_identity(id, name),
        }
    }

    /// Irreversibly remove an identity and all of its samples.
    ///
    /// The sample directory is moved aside inside the transaction and only
    /// removed after the commit, so a failure at any step leaves the identity
    /// fully listed with its samples in place.
    pub fn delete_identity(&mut self, id: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let key: String = tx
            .query_row(
                "SELECT storage_key FROM identities WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        tx.execute("DELETE FROM samples WHERE identity_id = ?1", [id])?;
        tx.execute("DELETE FROM identities WHERE id = ?1", [id])?;
        bump_revision(&tx)?;

        let dir = self.samples_dir.join(&key);
        let trash = self.samples_dir.join(format!("{TRASH_PREFIX}{key}"));
        let moved = dir.exists();
        if moved {
            fs::rename(&dir, &trash)?;
        }

        if let Err(e) = tx.commit() {
            if moved {
                if let Err(restore) = fs::rename(&trash, &dir) {
                    tracing::error!(id, error = %restore, "failed to restore sample directory");
                }
            }
            return Err(e.into());
        }

        if moved {
            if let Err(e) = fs::remove_dir_all(&trash) {
                tracing::warn!(id, error = %e, path = %trash.display(), "sample directory left in trash");
            }
        }

        tracing::info!(id, "identity deleted");
        Ok(())
    }

    /// Change an identity's display name. Samples are untouched.
    pub fn rename_identity(&mut self, id: &str, new_name: &str) -> Result<(), StoreError> {
        validate_name(new_name)?;

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE identities SET name = ?2 WHERE id = ?1",
            params![id, new_name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        bump_revision(&tx)?;
        tx.commit()?;

        tracing::info!(id, new_name, "identity renamed");
        Ok(())
    }

    /// Append one face sample to an existing identity.
    pub fn add_sample(&mut self, id: &str, face: &GrayImage) -> Result<SampleRef, StoreError> {
        let tx = self.conn.transaction()?;
        let key: String = tx
            .query_row(
                "SELECT storage_key FROM identities WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM samples WHERE identity_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let seq = next as u32;
        let file_name = sample_file_name(seq);

        let dir = self.samples_dir.join(&key);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&file_name);
        face.save(&path)?;

        let recorded = (|| -> Result<(), StoreError> {
            tx.execute(
                "INSERT INTO samples (identity_id, seq, file_name, captured_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, seq, file_name, chrono::Local::now().to_rfc3339()],
            )?;
            bump_revision(&tx)?;
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = recorded {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        tracing::debug!(id, seq, "sample stored");
        Ok(SampleRef { seq, path })
    }

    /// Samples of one identity in capture order.
    pub fn samples(&self, id: &str) -> Result<Vec<SampleRef>, StoreError> {
        let key: String = self
            .conn
            .query_row(
                "SELECT storage_key FROM identities WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        sample_refs(&self.conn, &self.samples_dir.join(key), id)
    }

    /// Read every identity with its samples inside one read transaction, so
    /// the result never mixes state from before and after a concurrent write.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let revision: i64 = tx.query_row(
            "SELECT value FROM store_meta WHERE key = 'revision'",
            [],
            |row| row.get(0),
        )?;

        let rows = {
            let mut stmt = tx.prepare("SELECT id, name, storage_key FROM identities ORDER BY rowid")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut identities = Vec::with_capacity(rows.len());
        for (id, name, key) in rows {
            let samples = sample_refs(&tx, &self.samples_dir.join(key), &id)?;
            identities.push(Identity { id, name, samples });
        }
        tx.finish()?;

        Ok(StoreSnapshot {
            revision: revision as u64,
            identities,
        })
    }

    /// Settle sample directories left in trash by an interrupted delete.
    ///
    /// Trash whose key is still referenced by an identity belongs to a delete
    /// that never committed and is moved back; anything else is removed.
    fn recover_trash(&self) -> Result<(), StoreError> {
        let Ok(entries) = fs::read_dir(&self.samples_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(|n| n.strip_prefix(TRASH_PREFIX)) else {
                continue;
            };
            let trash = entry.path();

            let owner: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM identities WHERE storage_key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?;

            match owner {
                Some(id) => {
                    let dir = self.samples_dir.join(key);
                    if dir.exists() {
                        tracing::warn!(id, path = %trash.display(), "sample directory exists, leaving trash in place");
                        continue;
                    }
                    fs::rename(&trash, &dir)?;
                    tracing::warn!(id, path = %dir.display(), "restored samples of an uncommitted delete");
                }
                None => match fs::remove_dir_all(&trash) {
                    Ok(()) => tracing::info!(path = %trash.display(), "purged deleted samples"),
                    Err(e) => tracing::warn!(path = %trash.display(), error = %e, "trash purge failed"),
                },
            }
        }
        Ok(())
    }
}

fn sample_file_name(seq: u32) -> String {
    format!("{seq:05}.png")
}

fn sample_refs(conn: &Connection, dir: &Path, id: &str) -> Result<Vec<SampleRef>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT seq, file_name FROM samples WHERE identity_id = ?1 ORDER BY seq")?;
    let samples = stmt
        .query_map([id], |row| {
            let seq: u32 = row.get(0)?;
            let file_name: String = row.get(1)?;
            Ok(SampleRef {
                seq,
                path: dir.join(file_name),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}

fn bump_revision(tx: &Transaction<'_>) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'revision'",
        [],
    )?;
    Ok(())
}
