use std::{sync::Arc, time::Duration};

use rusqlite::{Connection, Row, params};
use serde::Serialize;

use crate::{
    error::StoreError,
    id::Id,
    store::{MetaStore, unix_now},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Organization {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub id: Id,
    pub org_id: Id,
    pub name: String,
    pub description: String,
    /// `None` keeps data forever.
    pub retention: Option<Duration>,
    pub retention_policy_name: String,
}

#[derive(Debug, Clone)]
pub struct NewBucket {
    pub org_id: Id,
    pub name: String,
    pub description: String,
    pub retention: Option<Duration>,
    pub retention_policy_name: String,
}

/// Routes legacy `database`/`retention_policy` queries to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbrpMapping {
    pub database: String,
    pub retention_policy: String,
    pub default: bool,
    pub org_id: Id,
    pub bucket_id: Id,
}

/// Organizations, users, buckets and their legacy routing.
pub trait TenantService: Send + Sync {
    fn create_organization(&self, name: &str) -> Result<Organization, StoreError>;

    fn create_user(&self, name: &str, password_hash: &str) -> Result<User, StoreError>;

    fn create_bucket(&self, bucket: NewBucket) -> Result<Bucket, StoreError>;

    fn create_dbrp_mapping(&self, mapping: &DbrpMapping) -> Result<(), StoreError>;

    fn list_organizations(&self) -> Result<Vec<Organization>, StoreError>;

    fn list_users(&self) -> Result<Vec<User>, StoreError>;

    fn list_buckets(&self, org_id: Id) -> Result<Vec<Bucket>, StoreError>;

    fn list_dbrp_mappings(&self, org_id: Id) -> Result<Vec<DbrpMapping>, StoreError>;
}

#[derive(Debug)]
pub struct SqlTenantService {
    store: Arc<MetaStore>,
}

impl SqlTenantService {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }
}

/// `None` is stored as 0. Durations are kept in whole seconds, so anything
/// shorter than a second would silently turn into "forever" and is rejected.
pub(crate) fn retention_to_secs(retention: Option<Duration>) -> Result<i64, StoreError> {
    let Some(retention) = retention else {
        return Ok(0);
    };
    let secs = retention.as_secs();
    if secs == 0 {
        return Err(StoreError::InvalidValue(format!(
            "duration of {retention:?} is shorter than one second"
        )));
    }
    i64::try_from(secs).map_err(|_| StoreError::InvalidValue(format!("duration of {secs}s")))
}

fn retention_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    Ok(Bucket {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        retention: retention_from_secs(row.get(4)?),
        retention_policy_name: row.get(5)?,
    })
}

fn require_name(kind: &str, name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidValue(format!("{kind} name must not be empty")));
    }
    Ok(())
}

/// Inserts an organization through `conn`, which may be an open transaction.
pub(crate) fn insert_organization(
    conn: &Connection,
    name: &str,
) -> Result<Organization, StoreError> {
    require_name("organization", name)?;
    let org = Organization {
        id: Id::generate(),
        name: name.to_owned(),
    };
    conn.execute(
        "INSERT INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![org.id, org.name, unix_now()?],
    )
    .map_err(|error| StoreError::from_insert(error, || format!("organization '{name}'")))?;
    Ok(org)
}

pub(crate) fn insert_user(
    conn: &Connection,
    name: &str,
    password_hash: &str,
) -> Result<User, StoreError> {
    require_name("user", name)?;
    let user = User {
        id: Id::generate(),
        name: name.to_owned(),
    };
    conn.execute(
        "INSERT INTO users (id, name, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user.id, user.name, password_hash, unix_now()?],
    )
    .map_err(|error| StoreError::from_insert(error, || format!("user '{name}'")))?;
    Ok(user)
}

pub(crate) fn insert_bucket(conn: &Connection, new: NewBucket) -> Result<Bucket, StoreError> {
    require_name("bucket", &new.name)?;
    let retention_secs = retention_to_secs(new.retention)?;
    let bucket = Bucket {
        id: Id::generate(),
        org_id: new.org_id,
        name: new.name,
        description: new.description,
        retention: new.retention,
        retention_policy_name: new.retention_policy_name,
    };
    conn.execute(
        "
        INSERT INTO buckets (id, org_id, name, description, retention_secs, retention_policy_name, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            bucket.id,
            bucket.org_id,
            bucket.name,
            bucket.description,
            retention_secs,
            bucket.retention_policy_name,
            unix_now()?,
        ],
    )
    .map_err(|error| StoreError::from_insert(error, || format!("bucket '{}'", bucket.name)))?;
    Ok(bucket)
}

impl TenantService for SqlTenantService {
    fn create_organization(&self, name: &str) -> Result<Organization, StoreError> {
        self.store
            .with_connection(|conn| insert_organization(conn, name))
    }

    fn create_user(&self, name: &str, password_hash: &str) -> Result<User, StoreError> {
        self.store
            .with_connection(|conn| insert_user(conn, name, password_hash))
    }

    fn create_bucket(&self, new: NewBucket) -> Result<Bucket, StoreError> {
        self.store.with_connection(|conn| insert_bucket(conn, new))
    }

    fn create_dbrp_mapping(&self, mapping: &DbrpMapping) -> Result<(), StoreError> {
        self.store.with_connection(|conn| {
            conn.execute(
                "
                INSERT INTO dbrp_mappings (id, org_id, bucket_id, database, retention_policy, is_default)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    Id::generate(),
                    mapping.org_id,
                    mapping.bucket_id,
                    mapping.database,
                    mapping.retention_policy,
                    mapping.default,
                ],
            )
            .map_err(|error| {
                StoreError::from_insert(error, || {
                    format!(
                        "mapping for '{}/{}'",
                        mapping.database, mapping.retention_policy
                    )
                })
            })?;
            Ok(())
        })
    }

    fn list_organizations(&self) -> Result<Vec<Organization>, StoreError> {
        self.store.with_connection(|conn| {
            let mut statement =
                conn.prepare("SELECT id, name FROM organizations ORDER BY created_at, rowid")?;
            let rows = statement.query_map([], |row| {
                Ok(Organization {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.store.with_connection(|conn| {
            let mut statement =
                conn.prepare("SELECT id, name FROM users ORDER BY created_at, rowid")?;
            let rows = statement.query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn list_buckets(&self, org_id: Id) -> Result<Vec<Bucket>, StoreError> {
        self.store.with_connection(|conn| {
            let mut statement = conn.prepare(
                "
                SELECT id, org_id, name, description, retention_secs, retention_policy_name
                FROM buckets
                WHERE org_id = ?1
                ORDER BY rowid
                ",
            )?;
            let rows = statement.query_map([org_id], bucket_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn list_dbrp_mappings(&self, org_id: Id) -> Result<Vec<DbrpMapping>, StoreError> {
        self.store.with_connection(|conn| {
            let mut statement = conn.prepare(
                "
                SELECT database, retention_policy, is_default, org_id, bucket_id
                FROM dbrp_mappings
                WHERE org_id = ?1
                ORDER BY rowid
                ",
            )?;
            let rows = statement.query_map([org_id], |row| {
                Ok(DbrpMapping {
                    database: row.get(0)?,
                    retention_policy: row.get(1)?,
                    default: row.get(2)?,
                    org_id: row.get(3)?,
                    bucket_id: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}
