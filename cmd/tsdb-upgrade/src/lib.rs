//! Upgrades a legacy time-series database deployment into a fresh target
//! deployment: validated paths, a translated config, a migrated metadata
//! store, and every database and user carried over.

pub mod cli;
pub mod error;
pub mod initializers;
pub mod pipeline;
pub mod request;
pub mod rollback;
pub mod runtime;
pub mod validate;

pub use error::{Phase, PreconditionError, ResourceReleaseError, RollbackError, UpgradeError};
pub use pipeline::{
    CompletedUpgrade, DatabaseBucketMap, FailedUpgrade, UpgradeOutcome, UpgradePipeline,
    UpgradeState,
};
pub use request::{UpgradeOptions, UpgradeRequest};
pub use rollback::{RollbackManager, RollbackReport};
pub use runtime::Runtime;
