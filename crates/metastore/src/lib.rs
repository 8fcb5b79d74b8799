//! Target side of the upgrade.
//!
//! A single-file metadata store, the ordered schema migrations applied to it,
//! and the tenant, authorization, onboarding and storage-engine handles that
//! operate on top of it.

pub mod auth;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod id;
pub mod migration;
pub mod onboarding;
pub mod password;
pub mod store;
pub mod tenant;

pub use auth::{
    Action, Authorization, AuthorizationService, LegacyAuthorizationService, NewAuthorization,
    Permission, Resource, ResourceKind, SqlAuthorizationService,
};
pub use engine::{DEFAULT_RETENTION_POLICY, Engine, EngineError, ShardSource, StorageEngine};
pub use error::StoreError;
pub use id::Id;
pub use migration::{Migration, MigrationRecord, SchemaMigrationError, SchemaMigrator, SqlMigration};
pub use onboarding::{
    OnboardingError, OnboardingRequest, OnboardingResult, OnboardingService,
    SqlOnboardingService,
};
pub use store::MetaStore;
pub use tenant::{
    Bucket, DbrpMapping, NewBucket, Organization, SqlTenantService, TenantService, User,
};
