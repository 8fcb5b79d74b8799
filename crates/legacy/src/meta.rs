use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed name of the metadata snapshot inside the legacy `meta/` directory.
pub const META_FILENAME: &str = "meta.db";

/// Legacy self-monitoring database. Never migrated.
pub const INTERNAL_DATABASE: &str = "_internal";

#[derive(Debug, Error)]
pub enum LegacyMetaError {
    #[error("cannot read legacy meta file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot decode legacy meta file '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("legacy meta lists database '{0}' more than once")]
    DuplicateDatabase(String),
}

/// Read access to the legacy metadata: databases with their retention
/// policies and continuous queries, and users with their privileges.
pub trait LegacyMetaReader {
    fn databases(&self) -> &[DatabaseInfo];

    fn users(&self) -> &[UserInfo];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Zero keeps data forever.
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub shard_group_duration_secs: u64,
}

impl RetentionPolicy {
    /// `None` means infinite retention.
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    #[serde(default)]
    pub default_retention_policy: String,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicy>,
    #[serde(default)]
    pub continuous_queries: Vec<ContinuousQuery>,
}

impl DatabaseInfo {
    /// The named default policy, or the first one when none is named.
    pub fn default_policy(&self) -> Option<&RetentionPolicy> {
        self.retention_policies
            .iter()
            .find(|rp| rp.name == self.default_retention_policy)
            .or_else(|| self.retention_policies.first())
    }

    pub fn is_internal(&self) -> bool {
        self.name == INTERNAL_DATABASE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Read,
    Write,
    All,
    #[serde(rename = "none")]
    NoPrivileges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// Password hash as stored by the legacy server, carried over verbatim.
    pub hash: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub privileges: BTreeMap<String, Privilege>,
}

/// Legacy metadata loaded from the `meta.db` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMeta {
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

impl LegacyMeta {
    pub fn open(meta_dir: &Path) -> Result<Self, LegacyMetaError> {
        let path = meta_dir.join(META_FILENAME);
        let bytes = std::fs::read(&path).map_err(|source| LegacyMetaError::Read {
            path: path.clone(),
            source,
        })?;
        let meta: Self = serde_json::from_slice(&bytes)
            .map_err(|source| LegacyMetaError::Decode { path, source })?;
        meta.check_unique_databases()?;
        Ok(meta)
    }

    fn check_unique_databases(&self) -> Result<(), LegacyMetaError> {
        let mut seen = HashSet::new();
        for db in &self.databases {
            if !seen.insert(db.name.as_str()) {
                return Err(LegacyMetaError::DuplicateDatabase(db.name.clone()));
            }
        }
        Ok(())
    }
}

impl LegacyMetaReader for LegacyMeta {
    fn databases(&self) -> &[DatabaseInfo] {
        &self.databases
    }

    fn users(&self) -> &[UserInfo] {
        &self.users
    }
}
