use std::sync::OnceLock;

use tsdb_upgrade_metastore::{SchemaMigrationError, SchemaMigrator, catalog};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Process-wide state built once at startup and passed to the pipeline.
#[derive(Debug)]
pub struct Runtime {
    migrator: SchemaMigrator,
}

impl Runtime {
    /// Builds a runtime over the built-in migration catalog.
    pub fn new() -> Result<Self, SchemaMigrationError> {
        Ok(Self {
            migrator: SchemaMigrator::new(catalog::all())?,
        })
    }

    /// The shared runtime. Every call after the first returns the same instance.
    pub fn global() -> Result<&'static Self, SchemaMigrationError> {
        if let Some(runtime) = RUNTIME.get() {
            return Ok(runtime);
        }
        let runtime = Self::new()?;
        Ok(RUNTIME.get_or_init(|| runtime))
    }

    pub fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }
}
