use std::{fmt, io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;
use tsdb_upgrade_legacy::{ConfigError, LegacyMetaError};
use tsdb_upgrade_metastore::{
    EngineError, OnboardingError, SchemaMigrationError, StoreError,
};

/// Phase of the upgrade an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validation,
    Config,
    Bootstrap,
    Onboarding,
    Databases,
    Users,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Bootstrap => "bootstrap",
            Self::Onboarding => "onboarding",
            Self::Databases => "databases",
            Self::Users => "users",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A precondition of the run does not hold. Nothing has been written yet.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("legacy DB dir '{}' does not exist", .0.display())]
    SourceMissing(PathBuf),
    #[error("legacy DB dir '{}' is not a directory", .0.display())]
    SourceNotDirectory(PathBuf),
    #[error("legacy meta file '{}' does not exist", .0.display())]
    MetaFileMissing(PathBuf),
    #[error("legacy config file '{}' does not exist", .0.display())]
    ConfigFileMissing(PathBuf),
    #[error("file present at target path for upgraded config file '{}'", .0.display())]
    TranslatedConfigPresent(PathBuf),
    #[error("file present at target path for upgraded metadata store '{}'", .0.display())]
    MetaStorePresent(PathBuf),
    #[error("upgraded engine path '{}' is not a directory", .0.display())]
    EngineNotDirectory(PathBuf),
    #[error("upgraded engine directory '{}' must be empty", .0.display())]
    EngineNotEmpty(PathBuf),
    #[error("cannot inspect '{}': {source}", path.display())]
    Inspect { path: PathBuf, source: io::Error },
    #[error("file present at target path for CLI configs '{}'", .0.display())]
    CliConfigPresent(PathBuf),
    #[error("file present at target path for exported continuous queries '{}'", .0.display())]
    ContinuousQueryExportPresent(PathBuf),
    #[error("invalid retention '{value}': {reason}")]
    InvalidRetention { value: String, reason: String },
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("error opening legacy meta: {0}")]
    LegacyMeta(#[from] LegacyMetaError),
    #[error("error opening metadata store: {0}")]
    Store(#[from] StoreError),
    #[error("error opening storage engine: {0}")]
    Engine(#[from] EngineError),
}

/// Failure writing one of the flat target artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("cannot write '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot encode CLI config: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum DatabaseMigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("error exporting continuous queries: {0}")]
    ContinuousQueryExport(#[from] ArtifactError),
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("error translating legacy config: {0}")]
    ConfigTranslation(#[from] ConfigError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("error applying metadata store migrations: {0}")]
    SchemaMigration(#[from] SchemaMigrationError),
    #[error("instance has already been set up; the target metadata store must be fresh")]
    AlreadyOnboarded,
    #[error("instance setup failed: {0}")]
    Onboarding(OnboardingError),
    #[error("error saving CLI config: {0}")]
    CliConfig(ArtifactError),
    #[error("error upgrading databases: {0}")]
    DatabaseMigration(#[from] DatabaseMigrationError),
    #[error("error upgrading users: {0}")]
    UserMigration(StoreError),
}

impl From<OnboardingError> for UpgradeError {
    fn from(error: OnboardingError) -> Self {
        match error {
            OnboardingError::AlreadyOnboarded => Self::AlreadyOnboarded,
            other => Self::Onboarding(other),
        }
    }
}

impl UpgradeError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Precondition(_) => Phase::Validation,
            Self::ConfigTranslation(_) => Phase::Config,
            Self::Bootstrap(_) | Self::SchemaMigration(_) => Phase::Bootstrap,
            Self::AlreadyOnboarded | Self::Onboarding(_) | Self::CliConfig(_) => {
                Phase::Onboarding
            }
            Self::DatabaseMigration(_) => Phase::Databases,
            Self::UserMigration(_) => Phase::Users,
        }
    }

    /// Only a database-migration failure undoes target artifacts.
    pub fn requires_rollback(&self) -> bool {
        matches!(self, Self::DatabaseMigration(_))
    }
}

/// Failure to close a handle acquired by the bootstrapper. Never masks the
/// error that ended the run.
#[derive(Debug, Error)]
pub enum ResourceReleaseError {
    #[error("failed to close storage engine: {0}")]
    Engine(EngineError),
    #[error("failed to close metadata store: {0}")]
    Store(StoreError),
}

/// A target artifact rollback could not delete. It is left for the operator.
#[derive(Debug, Error)]
#[error("could not remove '{}': {source}", path.display())]
pub struct RollbackError {
    pub path: PathBuf,
    pub source: io::Error,
}
