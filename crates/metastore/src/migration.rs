//! Ordered, recorded schema migrations for the metadata store.
//!
//! Every migration carries a globally unique identifier. A migration's effect
//! and the record of its completion are committed in the same transaction, so
//! the store is always at the last fully applied migration.

use std::collections::HashSet;

use rusqlite::{Transaction, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    error::StoreError,
    store::{MetaStore, unix_now},
};

const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS migrations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
";

pub trait Migration: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Applies the migration's effect inside `tx`. The migrator commits.
    fn up(&self, tx: &Transaction<'_>) -> rusqlite::Result<()>;
}

/// A migration whose effect is a static SQL batch.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub id: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration for SqlMigration {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn up(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch(self.sql)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub applied_at: i64,
}

#[derive(Debug, Error)]
pub enum SchemaMigrationError {
    #[error("migration id '{0}' is declared more than once")]
    DuplicateId(String),
    #[error("migration '{id}' ({name}) failed: {source}")]
    Failed {
        id: String,
        name: String,
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SchemaMigrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| m.id()))
            .finish()
    }
}

impl SchemaMigrator {
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> Result<Self, SchemaMigrationError> {
        let mut ids = HashSet::new();
        for migration in &migrations {
            if !ids.insert(migration.id()) {
                return Err(SchemaMigrationError::DuplicateId(migration.id().to_owned()));
            }
        }
        Ok(Self { migrations })
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Applies, in order, every migration not yet recorded in `store`.
    ///
    /// Stops at the first failure. Returns the ids applied by this call.
    pub fn up(&self, store: &MetaStore) -> Result<Vec<String>, SchemaMigrationError> {
        store.with_connection(|conn| -> Result<(), StoreError> {
            conn.execute_batch(MIGRATIONS_TABLE)?;
            Ok(())
        })?;

        let already_applied: HashSet<String> = Self::applied(store)?
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut applied_now = Vec::new();
        for migration in &self.migrations {
            if already_applied.contains(migration.id()) {
                debug!(id = migration.id(), "Migration already applied");
                continue;
            }

            info!(id = migration.id(), name = migration.name(), "Applying migration");
            let applied_at = unix_now()?;
            store.with_connection(|conn| {
                let failed = |source| SchemaMigrationError::Failed {
                    id: migration.id().to_owned(),
                    name: migration.name().to_owned(),
                    source,
                };
                let tx = conn.transaction().map_err(failed)?;
                migration.up(&tx).map_err(failed)?;
                tx.execute(
                    "INSERT INTO migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
                    params![migration.id(), migration.name(), applied_at],
                )
                .map_err(failed)?;
                tx.commit().map_err(failed)
            })?;
            applied_now.push(migration.id().to_owned());
        }

        info!(
            applied = applied_now.len(),
            total = self.migrations.len(),
            "Metadata store schema is up to date"
        );
        Ok(applied_now)
    }

    /// Migration records present in `store`, in application order.
    pub fn applied(store: &MetaStore) -> Result<Vec<MigrationRecord>, StoreError> {
        store.with_connection(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'migrations')",
                [],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(Vec::new());
            }

            let mut statement =
                conn.prepare("SELECT id, name, applied_at FROM migrations ORDER BY rowid")?;
            let rows = statement.query_map([], |row| {
                Ok(MigrationRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }
}
