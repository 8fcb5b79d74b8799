//! Built-in migrations of the metadata store, in application order.
//!
//! Identifiers are permanent: once released, a migration is never renamed,
//! reordered or removed. New schema changes are appended.

use crate::migration::{Migration, SqlMigration};

const ORGANIZATIONS: SqlMigration = SqlMigration {
    id: "0001_organizations",
    name: "create organizations",
    sql: "
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
",
};

const USERS: SqlMigration = SqlMigration {
    id: "0002_users",
    name: "create users",
    sql: "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
",
};

const BUCKETS: SqlMigration = SqlMigration {
    id: "0003_buckets",
    name: "create buckets",
    sql: "
CREATE TABLE IF NOT EXISTS buckets (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations (id),
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    retention_secs INTEGER NOT NULL DEFAULT 0,
    retention_policy_name TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    UNIQUE (org_id, name)
);
",
};

const AUTHORIZATIONS: SqlMigration = SqlMigration {
    id: "0004_authorizations",
    name: "create authorizations",
    sql: "
CREATE TABLE IF NOT EXISTS authorizations (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations (id),
    user_id TEXT NOT NULL REFERENCES users (id),
    token TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    permissions TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL
);
",
};

const LEGACY_AUTHORIZATIONS: SqlMigration = SqlMigration {
    id: "0005_legacy_authorizations",
    name: "create legacy authorizations",
    sql: "
CREATE TABLE IF NOT EXISTS legacy_authorizations (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations (id),
    user_id TEXT NOT NULL REFERENCES users (id),
    token TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    permissions TEXT NOT NULL,
    password_hash TEXT,
    created_at INTEGER NOT NULL
);
",
};

const DBRP_MAPPINGS: SqlMigration = SqlMigration {
    id: "0006_dbrp_mappings",
    name: "create database and retention policy mappings",
    sql: "
CREATE TABLE IF NOT EXISTS dbrp_mappings (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations (id),
    bucket_id TEXT NOT NULL REFERENCES buckets (id),
    database TEXT NOT NULL,
    retention_policy TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    UNIQUE (org_id, database, retention_policy)
);
",
};

const ONBOARDING: SqlMigration = SqlMigration {
    id: "0007_onboarding",
    name: "create onboarding state",
    sql: "
CREATE TABLE IF NOT EXISTS onboarding (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    onboarded_at INTEGER NOT NULL
);
",
};

const ENGINE_DATABASES: SqlMigration = SqlMigration {
    id: "0008_engine_databases",
    name: "create storage engine databases",
    sql: "
CREATE TABLE IF NOT EXISTS engine_databases (
    bucket_id TEXT PRIMARY KEY REFERENCES buckets (id),
    retention_policy TEXT NOT NULL,
    retention_secs INTEGER NOT NULL DEFAULT 0,
    shard_group_secs INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
",
};

pub fn all() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(ORGANIZATIONS),
        Box::new(USERS),
        Box::new(BUCKETS),
        Box::new(AUTHORIZATIONS),
        Box::new(LEGACY_AUTHORIZATIONS),
        Box::new(DBRP_MAPPINGS),
        Box::new(ONBOARDING),
        Box::new(ENGINE_DATABASES),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{migration::SchemaMigrator, store::MetaStore};

    #[test]
    fn catalog_applies_cleanly_to_a_fresh_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::open(dir.path().join("tsdb.sqlite")).expect("store opens");
        let migrator = SchemaMigrator::new(all()).expect("catalog ids are unique");

        let applied = migrator.up(&store).expect("catalog applies");
        assert_eq!(applied.len(), migrator.len());
        assert!(migrator.up(&store).expect("second run").is_empty());
    }
}
