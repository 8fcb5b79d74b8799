use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use tsdb_upgrade::{
    Phase, PreconditionError, ResourceReleaseError, Runtime, UpgradeError, UpgradeOptions,
    UpgradePipeline, UpgradeState,
    initializers::{Services, bootstrap},
};
use tsdb_upgrade_legacy::META_FILENAME;
use tsdb_upgrade_metastore::{
    AuthorizationService, Bucket, DbrpMapping, EngineError, Id, LegacyAuthorizationService,
    MetaStore, NewBucket, Organization, ShardSource, SqlAuthorizationService, SqlTenantService,
    StorageEngine, StoreError, TenantService, User,
};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new(meta: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let meta_dir = root.join("v1").join("meta");
        fs::create_dir_all(&meta_dir).expect("meta dir");
        fs::write(meta_dir.join(META_FILENAME), meta.to_string()).expect("meta file");
        Self { _dir: dir, root }
    }

    fn source_dir(&self) -> PathBuf {
        self.root.join("v1")
    }

    fn write_shard(&self, database: &str, policy: &str) {
        let shard = self.source_dir().join("data").join(database).join(policy).join("1");
        fs::create_dir_all(&shard).expect("shard dir");
        fs::write(shard.join("000000001-000000001.tsm"), b"tsm").expect("tsm");
        let wal = self.source_dir().join("wal").join(database).join(policy).join("1");
        fs::create_dir_all(&wal).expect("wal dir");
        fs::write(wal.join("_00001.wal"), b"wal").expect("wal");
    }

    fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.root.join("tsdb.conf");
        fs::write(&path, contents).expect("config");
        path
    }

    fn options(&self) -> UpgradeOptions {
        UpgradeOptions {
            source_dir: self.source_dir(),
            config_file: None,
            bolt_path: self.root.join("v2").join("tsdb.sqlite"),
            configs_path: self.root.join("v2").join("configs"),
            engine_path: self.root.join("v2").join("engine"),
            cq_export_path: self.root.join("continuous_queries.txt"),
            username: "admin".to_owned(),
            password: "password123".to_owned(),
            org: "acme".to_owned(),
            bucket: "primary".to_owned(),
            retention: None,
            token: Some("operator-token".to_owned()),
        }
    }

    fn bolt_path(&self) -> PathBuf {
        self.root.join("v2").join("tsdb.sqlite")
    }
}

fn telegraf_meta(users: serde_json::Value) -> serde_json::Value {
    json!({
        "databases": [
            {
                "name": "_internal",
                "default_retention_policy": "monitor",
                "retention_policies": [{"name": "monitor", "duration_secs": 604800}]
            },
            {
                "name": "telegraf",
                "default_retention_policy": "autogen",
                "retention_policies": [
                    {"name": "autogen"},
                    {"name": "one_week", "duration_secs": 604800, "shard_group_duration_secs": 86400}
                ],
                "continuous_queries": [
                    {"name": "cq_mean", "query": "CREATE CONTINUOUS QUERY cq_mean ON telegraf BEGIN SELECT mean(v) INTO m FROM cpu GROUP BY time(1h) END"}
                ]
            },
            {
                "name": "metrics",
                "default_retention_policy": "two_days",
                "retention_policies": [
                    {"name": "two_days", "duration_secs": 172800},
                    {"name": "forever"}
                ]
            }
        ],
        "users": users
    })
}

fn reopen(path: &Path) -> (Arc<MetaStore>, SqlTenantService, SqlAuthorizationService) {
    let store = Arc::new(MetaStore::open(path).expect("reopen store"));
    (
        store.clone(),
        SqlTenantService::new(store.clone()),
        SqlAuthorizationService::new(store),
    )
}

/// Lets `allowed` bucket creations through, then fails every later one.
struct FailAfter {
    inner: Arc<dyn TenantService>,
    allowed: usize,
    calls: AtomicUsize,
}

impl TenantService for FailAfter {
    fn create_organization(&self, name: &str) -> Result<Organization, StoreError> {
        self.inner.create_organization(name)
    }

    fn create_user(&self, name: &str, password_hash: &str) -> Result<User, StoreError> {
        self.inner.create_user(name, password_hash)
    }

    fn create_bucket(&self, bucket: NewBucket) -> Result<Bucket, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::InvalidValue("injected bucket failure".to_owned()));
        }
        self.inner.create_bucket(bucket)
    }

    fn create_dbrp_mapping(&self, mapping: &DbrpMapping) -> Result<(), StoreError> {
        self.inner.create_dbrp_mapping(mapping)
    }

    fn list_organizations(&self) -> Result<Vec<Organization>, StoreError> {
        self.inner.list_organizations()
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.inner.list_users()
    }

    fn list_buckets(&self, org_id: Id) -> Result<Vec<Bucket>, StoreError> {
        self.inner.list_buckets(org_id)
    }

    fn list_dbrp_mappings(&self, org_id: Id) -> Result<Vec<DbrpMapping>, StoreError> {
        self.inner.list_dbrp_mappings(org_id)
    }
}

/// Makes the third bucket creation fail, which ends the run in the databases phase.
fn fail_third_bucket(services: &mut Services) {
    services.tenant = Arc::new(FailAfter {
        inner: services.tenant.clone(),
        allowed: 2,
        calls: AtomicUsize::new(0),
    });
}

/// Closes the real engine, then reports that flushing it failed.
struct FailingClose {
    inner: Arc<dyn StorageEngine>,
}

#[async_trait::async_trait]
impl StorageEngine for FailingClose {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn create_bucket_storage(
        &self,
        bucket: &Bucket,
        shard_group_duration: Option<Duration>,
    ) -> Result<(), EngineError> {
        self.inner.create_bucket_storage(bucket, shard_group_duration)
    }

    async fn import_shards(&self, source: ShardSource, bucket_id: Id) -> Result<u64, EngineError> {
        self.inner.import_shards(source, bucket_id).await
    }

    fn close(&self) -> Result<(), EngineError> {
        self.inner.close()?;
        Err(EngineError::Io {
            path: self.inner.path().join("wal"),
            source: io::Error::other("sync failed"),
        })
    }
}

#[tokio::test]
async fn fresh_upgrade_without_config_sets_up_a_single_tenant() {
    let fixture = Fixture::new(json!({"databases": [{"name": "only"}], "users": []}));
    let runtime = Runtime::new().expect("runtime");

    let mut pipeline = UpgradePipeline::new(fixture.options(), &runtime);
    let completed = pipeline.run().await.into_result().expect("upgrade succeeds");
    assert_eq!(pipeline.state(), UpgradeState::Done);

    assert_eq!(completed.bucket_count, 1);
    assert_eq!(completed.user_count, 0);
    assert!(completed.warnings.is_empty());
    assert_eq!(completed.token, "operator-token");
    assert_eq!(
        completed.buckets.first(),
        Some(("only", [completed.primary_bucket_id].as_slice()))
    );

    let (_store, tenant, auth) = reopen(&fixture.bolt_path());
    assert_eq!(tenant.list_organizations().expect("orgs").len(), 1);
    assert_eq!(tenant.list_users().expect("users").len(), 1);
    let buckets = tenant.list_buckets(completed.org_id).expect("buckets");
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].name, "primary");
    assert_eq!(auth.list_authorizations().expect("tokens").len(), 1);
    assert!(auth.list_legacy_authorizations().expect("legacy").is_empty());

    let cli_config: toml::Table = fs::read_to_string(fixture.root.join("v2/configs"))
        .expect("cli config")
        .parse()
        .expect("toml");
    assert_eq!(
        cli_config["default"]["url"].as_str(),
        Some("http://localhost:8086")
    );
    assert_eq!(cli_config["default"]["token"].as_str(), Some("operator-token"));
}

#[tokio::test]
async fn databases_and_users_are_carried_over() {
    let fixture = Fixture::new(telegraf_meta(json!([
        {"name": "root", "hash": "$2a$root", "admin": true},
        {"name": "idle", "hash": "$2a$idle", "privileges": {}},
        {"name": "writer", "hash": "$2a$writer", "privileges": {"telegraf": "write", "metrics": "read"}},
        {"name": "reader", "hash": "$2a$reader", "privileges": {"metrics": "read"}}
    ])));
    fixture.write_shard("telegraf", "autogen");
    fixture.write_shard("telegraf", "one_week");
    let config = fixture.write_config(
        "[meta]\n\n[http]\nbind-address = \"db.internal:9999\"\nauth-enabled = true\n",
    );
    let runtime = Runtime::new().expect("runtime");

    let mut options = fixture.options();
    options.config_file = Some(config);
    let mut pipeline = UpgradePipeline::new(options, &runtime);
    let completed = pipeline.run().await.into_result().expect("upgrade succeeds");

    // telegraf/autogen onto the primary bucket, then one bucket per other pair
    assert_eq!(completed.bucket_count, 4);
    assert_eq!(
        completed.buckets.databases().collect::<Vec<_>>(),
        vec!["telegraf", "metrics"]
    );
    assert_eq!(
        completed.buckets.get("telegraf").expect("telegraf")[0],
        completed.primary_bucket_id
    );
    assert_eq!(completed.user_count, 2);
    assert!(completed.warnings.is_empty());

    let (_store, tenant, auth) = reopen(&fixture.bolt_path());
    let mut names: Vec<String> = tenant
        .list_buckets(completed.org_id)
        .expect("buckets")
        .into_iter()
        .map(|bucket| bucket.name)
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["metrics/forever", "metrics/two_days", "primary", "telegraf/one_week"]
    );
    let mappings = tenant.list_dbrp_mappings(completed.org_id).expect("dbrp");
    assert_eq!(mappings.len(), 4);
    assert_eq!(mappings.iter().filter(|mapping| mapping.default).count(), 2);

    let legacy = auth.list_legacy_authorizations().expect("legacy");
    let mut tokens: Vec<&str> = legacy.iter().map(|a| a.token.as_str()).collect();
    tokens.sort();
    assert_eq!(tokens, vec!["reader", "writer"]);

    let engine = fixture.root.join("v2/engine");
    let copied = fs::read_dir(engine.join("data"))
        .expect("engine data")
        .filter_map(Result::ok)
        .count();
    assert_eq!(copied, 4);

    let cq = fs::read_to_string(fixture.root.join("continuous_queries.txt")).expect("cq export");
    assert!(cq.starts_with("# DATABASE: telegraf\n# CQ: cq_mean\n"));

    let cli_config: toml::Table = fs::read_to_string(fixture.root.join("v2/configs"))
        .expect("cli config")
        .parse()
        .expect("toml");
    assert_eq!(
        cli_config["default"]["url"].as_str(),
        Some("http://db.internal:9999")
    );
    assert!(fixture.root.join("config.toml").is_file());
}

#[tokio::test]
async fn users_upgraded_with_auth_disabled_produce_a_warning() {
    let fixture = Fixture::new(telegraf_meta(json!([
        {"name": "a", "hash": "h", "privileges": {"telegraf": "all"}},
        {"name": "b", "hash": "h", "privileges": {"telegraf": "read"}},
        {"name": "c", "hash": "h", "privileges": {"metrics": "write"}}
    ])));
    let runtime = Runtime::new().expect("runtime");

    let mut pipeline = UpgradePipeline::new(fixture.options(), &runtime);
    let completed = pipeline.run().await.into_result().expect("upgrade succeeds");

    assert_eq!(completed.user_count, 3);
    assert_eq!(completed.warnings.len(), 1);
    assert!(completed.warnings[0].contains("3 user(s)"));
}

#[tokio::test]
async fn database_failure_rolls_back_and_a_retry_succeeds() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let config = fixture.write_config("[http]\nbind-address = \":8086\"\n");
    let runtime = Runtime::new().expect("runtime");
    let mut options = fixture.options();
    options.config_file = Some(config.clone());

    let mut pipeline = UpgradePipeline::new(options.clone(), &runtime);
    let failed = pipeline
        .run_with(|request, runtime| {
            let mut services = bootstrap(request, runtime)?;
            fail_third_bucket(&mut services);
            Ok(services)
        })
        .await
        .into_result()
        .expect_err("third bucket fails");

    assert_eq!(pipeline.state(), UpgradeState::Failed);
    assert_eq!(failed.phase, Phase::Databases);
    assert!(failed.rolled_back);
    assert!(failed.release_errors.is_empty());
    assert!(failed.rollback_errors.is_empty());
    assert!(failed.to_string().ends_with("(target artifacts were rolled back)"));
    assert!(!fixture.bolt_path().exists());
    assert!(!fixture.root.join("v2/engine").exists());
    assert!(!fixture.root.join("v2/configs").exists());
    assert!(!fixture.root.join("continuous_queries.txt").exists());
    assert!(!fixture.root.join("config.toml").exists());
    assert!(config.is_file());
    assert!(fixture.source_dir().join("meta").join(META_FILENAME).is_file());

    let mut retry = UpgradePipeline::new(options, &runtime);
    let completed = retry.run().await.into_result().expect("retry succeeds");
    assert_eq!(completed.bucket_count, 4);
}

#[tokio::test]
async fn engine_close_failure_is_reported_alongside_the_database_failure() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let runtime = Runtime::new().expect("runtime");

    let mut pipeline = UpgradePipeline::new(fixture.options(), &runtime);
    let failed = pipeline
        .run_with(|request, runtime| {
            let mut services = bootstrap(request, runtime)?;
            fail_third_bucket(&mut services);
            services.engine = Arc::new(FailingClose {
                inner: services.engine.clone(),
            });
            Ok(services)
        })
        .await
        .into_result()
        .expect_err("third bucket fails");

    assert_eq!(failed.phase, Phase::Databases);
    assert!(matches!(failed.error, UpgradeError::DatabaseMigration(_)));
    assert!(failed.rolled_back);
    assert_eq!(failed.release_errors.len(), 1);
    assert!(matches!(
        &failed.release_errors[0],
        ResourceReleaseError::Engine(EngineError::Io { .. })
    ));
    assert!(!fixture.bolt_path().exists());
    assert!(!fixture.root.join("v2/engine").exists());
}

#[tokio::test]
async fn rollback_reports_artifacts_it_could_not_remove() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let config = fixture.write_config("[http]\nbind-address = \":8086\"\n");
    let runtime = Runtime::new().expect("runtime");
    let mut options = fixture.options();
    options.config_file = Some(config);
    let translated = fixture.root.join("config.toml");

    let mut pipeline = UpgradePipeline::new(options, &runtime);
    let failed = pipeline
        .run_with(|request, runtime| {
            // A populated directory in place of the translated config cannot be unlinked.
            fs::remove_file(&translated).expect("translated config");
            fs::create_dir_all(translated.join("keep")).expect("blocking dir");
            let mut services = bootstrap(request, runtime)?;
            fail_third_bucket(&mut services);
            Ok(services)
        })
        .await
        .into_result()
        .expect_err("third bucket fails");

    assert!(failed.rolled_back);
    assert_eq!(failed.rollback_errors.len(), 1);
    assert_eq!(failed.rollback_errors[0].path, translated);
    assert!(failed.to_string().contains("rollback incomplete"));
    assert!(translated.is_dir());
    assert!(!fixture.bolt_path().exists());
    assert!(!fixture.root.join("v2/engine").exists());
    assert!(!fixture.root.join("continuous_queries.txt").exists());
}

#[tokio::test]
async fn already_onboarded_store_is_kept() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let runtime = Runtime::new().expect("runtime");
    let mut pipeline = UpgradePipeline::new(fixture.options(), &runtime);

    let failed = pipeline
        .run_with(|request, runtime| {
            let services = bootstrap(request, runtime)?;
            services
                .onboarding
                .onboard(&request.admin.onboarding_request())
                .expect("first setup");
            Ok(services)
        })
        .await
        .into_result()
        .expect_err("second setup is refused");

    assert!(matches!(failed.error, UpgradeError::AlreadyOnboarded));
    assert_eq!(failed.phase, Phase::Onboarding);
    assert!(!failed.rolled_back);
    assert!(fixture.bolt_path().is_file());
    assert!(fixture.root.join("v2/engine").is_dir());
    assert!(!fixture.root.join("continuous_queries.txt").exists());
}

#[tokio::test]
async fn non_empty_engine_directory_is_rejected_before_anything_is_written() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let engine = fixture.root.join("v2/engine");
    fs::create_dir_all(&engine).expect("engine dir");
    fs::write(engine.join("leftover"), b"x").expect("leftover");
    let config = fixture.write_config("");
    let runtime = Runtime::new().expect("runtime");
    let mut options = fixture.options();
    options.config_file = Some(config);

    let mut pipeline = UpgradePipeline::new(options, &runtime);
    let failed = pipeline.run().await.into_result().expect_err("engine not empty");

    assert!(matches!(
        failed.error,
        UpgradeError::Precondition(PreconditionError::EngineNotEmpty(_))
    ));
    assert_eq!(failed.phase, Phase::Validation);
    assert!(pipeline.request().is_none());
    assert!(!fixture.bolt_path().exists());
    assert!(!fixture.root.join("config.toml").exists());
    assert!(!fixture.root.join("v2/configs").exists());
}

#[tokio::test]
async fn short_password_fails_validation() {
    let fixture = Fixture::new(telegraf_meta(json!([])));
    let runtime = Runtime::new().expect("runtime");
    let mut options = fixture.options();
    options.password = "short".to_owned();

    let failed = UpgradePipeline::new(options, &runtime)
        .run()
        .await
        .into_result()
        .expect_err("password too short");
    assert_eq!(failed.phase, Phase::Validation);
    assert!(!fixture.bolt_path().exists());
}

#[tokio::test]
async fn https_config_is_reflected_in_the_cli_url() {
    let fixture = Fixture::new(json!({"databases": [], "users": []}));
    let config = fixture.write_config("[http]\nbind-address = \":8443\"\nhttps-enabled = true\n");
    let runtime = Runtime::new().expect("runtime");
    let mut options = fixture.options();
    options.config_file = Some(config);

    let completed = UpgradePipeline::new(options, &runtime)
        .run()
        .await
        .into_result()
        .expect("upgrade succeeds");
    assert!(completed.buckets.is_empty());

    let cli_config: toml::Table = fs::read_to_string(fixture.root.join("v2/configs"))
        .expect("cli config")
        .parse()
        .expect("toml");
    assert_eq!(
        cli_config["default"]["url"].as_str(),
        Some("https://localhost:8443")
    );
    // no databases, so nothing to export
    assert!(!fixture.root.join("continuous_queries.txt").exists());
}
