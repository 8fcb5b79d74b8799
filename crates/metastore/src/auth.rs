use std::sync::Arc;

use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    id::Id,
    store::{MetaStore, unix_now},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Authorizations,
    Buckets,
    Dbrp,
    Orgs,
    Users,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Authorizations,
        ResourceKind::Buckets,
        ResourceKind::Dbrp,
        ResourceKind::Orgs,
        ResourceKind::Users,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    /// Specific resource; `None` covers every resource of `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    /// Owning organization; `None` covers every organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub action: Action,
    pub resource: Resource,
}

impl Permission {
    pub fn bucket(action: Action, bucket_id: Id, org_id: Id) -> Self {
        Self {
            action,
            resource: Resource {
                kind: ResourceKind::Buckets,
                id: Some(bucket_id),
                org_id: Some(org_id),
            },
        }
    }

    /// Read and write on every resource of every organization.
    pub fn operator() -> Vec<Self> {
        ResourceKind::ALL
            .into_iter()
            .flat_map(|kind| {
                [Action::Read, Action::Write].map(|action| Self {
                    action,
                    resource: Resource {
                        kind,
                        id: None,
                        org_id: None,
                    },
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NewAuthorization {
    pub org_id: Id,
    pub user_id: Id,
    pub token: String,
    pub description: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub id: Id,
    pub org_id: Id,
    pub user_id: Id,
    pub token: String,
    pub description: String,
    pub permissions: Vec<Permission>,
}

/// Target-native API tokens.
pub trait AuthorizationService: Send + Sync {
    fn create_authorization(&self, new: NewAuthorization) -> Result<Authorization, StoreError>;

    fn list_authorizations(&self) -> Result<Vec<Authorization>, StoreError>;
}

/// Authorizations that accept legacy username/password credentials. The
/// token is the legacy username.
pub trait LegacyAuthorizationService: Send + Sync {
    fn create_legacy_authorization(
        &self,
        new: NewAuthorization,
    ) -> Result<Authorization, StoreError>;

    fn set_password_hash(&self, id: Id, password_hash: &str) -> Result<(), StoreError>;

    fn list_legacy_authorizations(&self) -> Result<Vec<Authorization>, StoreError>;
}

#[derive(Debug)]
pub struct SqlAuthorizationService {
    store: Arc<MetaStore>,
}

#[derive(Clone, Copy)]
pub(crate) enum Table {
    Native,
    Legacy,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Self::Native => "authorizations",
            Self::Legacy => "legacy_authorizations",
        }
    }
}

impl SqlAuthorizationService {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    fn list(&self, table: Table) -> Result<Vec<Authorization>, StoreError> {
        let sql = format!(
            "SELECT id, org_id, user_id, token, description, permissions FROM {} ORDER BY rowid",
            table.name()
        );
        self.store.with_connection(|conn| {
            let mut statement = conn.prepare(&sql)?;
            let rows = statement.query_map([], raw_authorization)?;
            let mut authorizations = Vec::new();
            for row in rows {
                let (mut authorization, permissions) = row?;
                authorization.permissions = serde_json::from_str(&permissions)?;
                authorizations.push(authorization);
            }
            Ok(authorizations)
        })
    }
}

/// Inserts into `table` through `conn`, which may be an open transaction.
pub(crate) fn insert_authorization(
    conn: &Connection,
    table: Table,
    new: NewAuthorization,
) -> Result<Authorization, StoreError> {
    if new.token.is_empty() {
        return Err(StoreError::InvalidValue(
            "authorization token must not be empty".to_owned(),
        ));
    }
    let permissions = serde_json::to_string(&new.permissions)?;
    let authorization = Authorization {
        id: Id::generate(),
        org_id: new.org_id,
        user_id: new.user_id,
        token: new.token,
        description: new.description,
        permissions: new.permissions,
    };
    let sql = format!(
        "INSERT INTO {} (id, org_id, user_id, token, description, permissions, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        table.name()
    );
    conn.execute(
        &sql,
        params![
            authorization.id,
            authorization.org_id,
            authorization.user_id,
            authorization.token,
            authorization.description,
            permissions,
            unix_now()?,
        ],
    )
    .map_err(|error| {
        StoreError::from_insert(error, || {
            format!("authorization '{}'", authorization.description)
        })
    })?;
    Ok(authorization)
}

fn raw_authorization(row: &Row<'_>) -> rusqlite::Result<(Authorization, String)> {
    Ok((
        Authorization {
            id: row.get(0)?,
            org_id: row.get(1)?,
            user_id: row.get(2)?,
            token: row.get(3)?,
            description: row.get(4)?,
            permissions: Vec::new(),
        },
        row.get(5)?,
    ))
}

impl AuthorizationService for SqlAuthorizationService {
    fn create_authorization(&self, new: NewAuthorization) -> Result<Authorization, StoreError> {
        self.store
            .with_connection(|conn| insert_authorization(conn, Table::Native, new))
    }

    fn list_authorizations(&self) -> Result<Vec<Authorization>, StoreError> {
        self.list(Table::Native)
    }
}

impl LegacyAuthorizationService for SqlAuthorizationService {
    fn create_legacy_authorization(
        &self,
        new: NewAuthorization,
    ) -> Result<Authorization, StoreError> {
        self.store
            .with_connection(|conn| insert_authorization(conn, Table::Legacy, new))
    }

    fn set_password_hash(&self, id: Id, password_hash: &str) -> Result<(), StoreError> {
        let updated = self.store.with_connection(|conn| {
            Ok::<_, StoreError>(conn.execute(
                "UPDATE legacy_authorizations SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )?)
        })?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("legacy authorization {id}")));
        }
        Ok(())
    }

    fn list_legacy_authorizations(&self) -> Result<Vec<Authorization>, StoreError> {
        self.list(Table::Legacy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog,
        migration::SchemaMigrator,
        tenant::{SqlTenantService, TenantService},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MetaStore>,
        org_id: Id,
        user_id: Id,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MetaStore::open(dir.path().join("tsdb.sqlite")).expect("store"));
        SchemaMigrator::new(catalog::all())
            .expect("catalog")
            .up(&store)
            .expect("migrations");
        let tenant = SqlTenantService::new(store.clone());
        let org_id = tenant.create_organization("acme").expect("org").id;
        let user_id = tenant.create_user("admin", "hash").expect("user").id;
        Fixture {
            _dir: dir,
            store,
            org_id,
            user_id,
        }
    }

    fn new_authorization(fixture: &Fixture, token: &str) -> NewAuthorization {
        NewAuthorization {
            org_id: fixture.org_id,
            user_id: fixture.user_id,
            token: token.to_owned(),
            description: format!("{token}'s Token"),
            permissions: vec![Permission::bucket(Action::Read, Id::generate(), fixture.org_id)],
        }
    }

    #[test]
    fn native_and_legacy_authorizations_live_in_separate_tables() {
        let fixture = fixture();
        let service = SqlAuthorizationService::new(fixture.store.clone());

        service
            .create_authorization(new_authorization(&fixture, "native-token"))
            .expect("native");
        let legacy = service
            .create_legacy_authorization(new_authorization(&fixture, "alice"))
            .expect("legacy");
        service
            .set_password_hash(legacy.id, "$2a$10$legacyhash")
            .expect("password hash");

        let native = service.list_authorizations().expect("list native");
        let legacy_list = service.list_legacy_authorizations().expect("list legacy");
        assert_eq!(native.len(), 1);
        assert_eq!(legacy_list, vec![legacy]);
        assert_eq!(native[0].permissions.len(), 1);
    }

    #[test]
    fn tokens_are_unique_and_non_empty() {
        let fixture = fixture();
        let service = SqlAuthorizationService::new(fixture.store.clone());
        service
            .create_authorization(new_authorization(&fixture, "t"))
            .expect("first");

        assert!(matches!(
            service.create_authorization(new_authorization(&fixture, "t")),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            service.create_authorization(new_authorization(&fixture, "")),
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn setting_hash_of_unknown_authorization_fails() {
        let fixture = fixture();
        let service = SqlAuthorizationService::new(fixture.store.clone());
        assert!(matches!(
            service.set_password_hash(Id::generate(), "hash"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn operator_permissions_cover_every_kind_for_both_actions() {
        let permissions = Permission::operator();
        assert_eq!(permissions.len(), ResourceKind::ALL.len() * 2);
        assert!(permissions.iter().all(|p| p.resource.org_id.is_none()));
    }
}
