//! The upgrade state machine.
//!
//! `Init -> Validated -> Bootstrapped -> Onboarded -> DatabasesMigrated ->
//! UsersMigrated -> Done`, with `Failed` reachable from every non-terminal
//! state. Phases run strictly in sequence. Only a failure while migrating
//! databases rolls target artifacts back.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tsdb_upgrade_legacy::{DatabaseInfo, Privilege, RetentionPolicy, UserInfo};
use tsdb_upgrade_metastore::{
    Action, DEFAULT_RETENTION_POLICY, DbrpMapping, Id, NewAuthorization, NewBucket,
    OnboardingResult, Permission, ShardSource,
};

use crate::{
    error::{
        ArtifactError, DatabaseMigrationError, Phase, ResourceReleaseError, RollbackError,
        UpgradeError,
    },
    initializers::{Services, bootstrap},
    request::{UpgradeOptions, UpgradeRequest},
    rollback::{RollbackManager, RollbackReport},
    runtime::Runtime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Init,
    Validated,
    Bootstrapped,
    Onboarded,
    DatabasesMigrated,
    UsersMigrated,
    Done,
    Failed,
}

/// Legacy database name to the target buckets created for it, in legacy
/// enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseBucketMap(IndexMap<String, Vec<Id>>);

impl DatabaseBucketMap {
    fn insert(&mut self, database: &str, bucket_id: Id) {
        self.0.entry(database.to_owned()).or_default().push(bucket_id);
    }

    pub fn get(&self, database: &str) -> Option<&[Id]> {
        self.0.get(database).map(Vec::as_slice)
    }

    pub fn first(&self) -> Option<(&str, &[Id])> {
        self.0
            .first()
            .map(|(database, ids)| (database.as_str(), ids.as_slice()))
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn bucket_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
pub struct CompletedUpgrade {
    pub org_id: Id,
    pub primary_bucket_id: Id,
    pub token: String,
    pub buckets: DatabaseBucketMap,
    pub bucket_count: usize,
    pub user_count: usize,
    pub warnings: Vec<String>,
    pub release_errors: Vec<ResourceReleaseError>,
}

#[derive(Debug)]
pub struct FailedUpgrade {
    pub phase: Phase,
    pub error: UpgradeError,
    pub rolled_back: bool,
    pub release_errors: Vec<ResourceReleaseError>,
    /// Target artifacts the rollback left behind.
    pub rollback_errors: Vec<RollbackError>,
}

impl fmt::Display for FailedUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upgrade failed during {}: {}", self.phase, self.error)?;
        match self.rollback_errors.len() {
            _ if !self.rolled_back => Ok(()),
            0 => f.write_str(" (target artifacts were rolled back)"),
            left => write!(
                f,
                " (rollback incomplete: {left} target artifact(s) must be removed by hand)"
            ),
        }
    }
}

impl std::error::Error for FailedUpgrade {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug)]
pub enum UpgradeOutcome {
    Completed(CompletedUpgrade),
    Failed(FailedUpgrade),
}

impl UpgradeOutcome {
    pub fn into_result(self) -> Result<CompletedUpgrade, FailedUpgrade> {
        match self {
            Self::Completed(completed) => Ok(completed),
            Self::Failed(failed) => Err(failed),
        }
    }
}

struct PhaseResults {
    onboarded: OnboardingResult,
    buckets: DatabaseBucketMap,
    user_count: usize,
}

/// Sequences one upgrade run.
pub struct UpgradePipeline<'a> {
    options: UpgradeOptions,
    runtime: &'a Runtime,
    request: Option<UpgradeRequest>,
    state: UpgradeState,
}

impl<'a> UpgradePipeline<'a> {
    pub fn new(options: UpgradeOptions, runtime: &'a Runtime) -> Self {
        Self {
            options,
            runtime,
            request: None,
            state: UpgradeState::Init,
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// The validated request, once the run got past validation.
    pub fn request(&self) -> Option<&UpgradeRequest> {
        self.request.as_ref()
    }

    pub async fn run(&mut self) -> UpgradeOutcome {
        self.run_with(bootstrap).await
    }

    /// Runs with a custom bootstrapper in place of [`bootstrap`].
    pub async fn run_with<B>(&mut self, bootstrapper: B) -> UpgradeOutcome
    where
        B: FnOnce(&UpgradeRequest, &Runtime) -> Result<Services, UpgradeError>,
    {
        let request = match UpgradeRequest::prepare(&self.options) {
            Ok(request) => request,
            Err(err) => return self.fail(err, None, Vec::new()),
        };
        self.transition(UpgradeState::Validated);

        let mut services = match bootstrapper(&request, self.runtime) {
            Ok(services) => services,
            Err(err) => {
                self.request = Some(request);
                return self.fail(err, None, Vec::new());
            }
        };
        self.transition(UpgradeState::Bootstrapped);

        let result = self.run_phases(&request, &services).await;
        let release_errors = services.release();
        drop(services);

        let outcome = match result {
            Ok(results) => {
                let mut warnings = Vec::new();
                if results.user_count > 0 && !request.source.auth_enabled {
                    let warning = format!(
                        "{} user(s) were upgraded while legacy authentication was disabled; \
                         clients relying on open access will now fail to authenticate",
                        results.user_count
                    );
                    warn!("{warning}");
                    warnings.push(warning);
                }
                self.transition(UpgradeState::Done);
                info!(
                    buckets = results.buckets.bucket_count(),
                    users = results.user_count,
                    "Upgrade complete"
                );
                UpgradeOutcome::Completed(CompletedUpgrade {
                    org_id: results.onboarded.org.id,
                    primary_bucket_id: results.onboarded.bucket.id,
                    token: results.onboarded.auth.token,
                    bucket_count: results.buckets.bucket_count(),
                    buckets: results.buckets,
                    user_count: results.user_count,
                    warnings,
                    release_errors,
                })
            }
            Err(err) => {
                let rollback = err
                    .requires_rollback()
                    .then(|| RollbackManager::new(&request).run());
                self.fail(err, rollback, release_errors)
            }
        };
        self.request = Some(request);
        outcome
    }

    async fn run_phases(
        &mut self,
        request: &UpgradeRequest,
        services: &Services,
    ) -> Result<PhaseResults, UpgradeError> {
        let onboarded = onboard(request, services)?;
        self.transition(UpgradeState::Onboarded);

        let buckets = migrate_databases(request, services, &onboarded).await?;
        self.transition(UpgradeState::DatabasesMigrated);

        let user_count =
            migrate_users(services, &onboarded, &buckets).map_err(UpgradeError::UserMigration)?;
        self.transition(UpgradeState::UsersMigrated);

        Ok(PhaseResults {
            onboarded,
            buckets,
            user_count,
        })
    }

    fn transition(&mut self, state: UpgradeState) {
        debug!(from = ?self.state, to = ?state, "Upgrade state change");
        self.state = state;
    }

    fn fail(
        &mut self,
        err: UpgradeError,
        rollback: Option<RollbackReport>,
        release_errors: Vec<ResourceReleaseError>,
    ) -> UpgradeOutcome {
        let phase = err.phase();
        let rolled_back = rollback.is_some();
        error!(%phase, error = %err, rolled_back, "Upgrade failed");
        self.transition(UpgradeState::Failed);
        UpgradeOutcome::Failed(FailedUpgrade {
            phase,
            error: err,
            rolled_back,
            release_errors,
            rollback_errors: rollback.map(|report| report.failures).unwrap_or_default(),
        })
    }
}

fn onboard(request: &UpgradeRequest, services: &Services) -> Result<OnboardingResult, UpgradeError> {
    if !services.onboarding.is_onboarding()? {
        return Err(UpgradeError::AlreadyOnboarded);
    }
    let onboarded = services
        .onboarding
        .onboard(&request.admin.onboarding_request())?;

    write_cli_config(
        &request.target.configs_path,
        &CliConfig {
            url: request.source.base_url.clone(),
            token: onboarded.auth.token.clone(),
            org: onboarded.org.name.clone(),
            active: true,
        },
    )
    .map_err(UpgradeError::CliConfig)?;
    info!(path = %request.target.configs_path.display(), "Saved CLI config");

    Ok(onboarded)
}

#[derive(Debug, Serialize)]
struct CliConfig {
    url: String,
    token: String,
    org: String,
    active: bool,
}

fn write_cli_config(path: &Path, config: &CliConfig) -> Result<(), ArtifactError> {
    let configs = BTreeMap::from([("default", config)]);
    let encoded = toml::to_string(&configs)?;
    let write_error = |source| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut file| file.write_all(encoded.as_bytes()))
        .map_err(write_error)
}

/// One legacy `database/retention_policy` pair and the bucket it lands in.
struct BucketPlan<'m> {
    database: &'m DatabaseInfo,
    policy: Option<&'m RetentionPolicy>,
    primary: bool,
}

impl BucketPlan<'_> {
    fn policy_name(&self) -> &str {
        self.policy
            .map(|rp| rp.name.as_str())
            .unwrap_or(DEFAULT_RETENTION_POLICY)
    }

    fn is_default(&self) -> bool {
        match (self.database.default_policy(), self.policy) {
            (Some(default), Some(policy)) => default.name == policy.name,
            _ => true,
        }
    }
}

/// The primary database's default policy maps onto the onboarding bucket;
/// every other pair gets a bucket of its own.
fn plan_buckets(databases: &[DatabaseInfo]) -> Vec<BucketPlan<'_>> {
    let mut plans = Vec::new();
    let mut migrated = databases.iter().filter(|db| !db.is_internal());

    if let Some(primary) = migrated.next() {
        let default = primary.default_policy();
        plans.push(BucketPlan {
            database: primary,
            policy: default,
            primary: true,
        });
        plans.extend(
            primary
                .retention_policies
                .iter()
                .filter(|rp| default.is_none_or(|default| default.name != rp.name))
                .map(|rp| BucketPlan {
                    database: primary,
                    policy: Some(rp),
                    primary: false,
                }),
        );
    }
    for database in migrated {
        plans.extend(database.retention_policies.iter().map(|rp| BucketPlan {
            database,
            policy: Some(rp),
            primary: false,
        }));
    }
    plans
}

async fn migrate_databases(
    request: &UpgradeRequest,
    services: &Services,
    onboarded: &OnboardingResult,
) -> Result<DatabaseBucketMap, DatabaseMigrationError> {
    let databases = services.legacy.databases();
    let plans = plan_buckets(databases);
    let mut buckets = DatabaseBucketMap::default();
    if plans.is_empty() {
        info!("No legacy databases to upgrade");
        return Ok(buckets);
    }

    let mut cq_export = ContinuousQueryExport::create(&request.target.cq_export_path)?;
    for database in databases.iter().filter(|db| !db.is_internal()) {
        cq_export.write_database(database)?;
    }
    cq_export.finish()?;

    let org_id = onboarded.org.id;
    for plan in &plans {
        let database = plan.database.name.as_str();
        let policy_name = plan.policy_name();
        let bucket = if plan.primary {
            onboarded.bucket.clone()
        } else {
            let name = format!("{database}/{policy_name}");
            debug!(bucket = %name, "Creating bucket");
            services.tenant.create_bucket(NewBucket {
                org_id,
                name,
                description: format!(
                    "Upgraded from v1 database {database} with retention policy {policy_name}"
                ),
                retention: plan.policy.and_then(RetentionPolicy::duration),
                retention_policy_name: policy_name.to_owned(),
            })?
        };

        services.tenant.create_dbrp_mapping(&DbrpMapping {
            database: database.to_owned(),
            retention_policy: policy_name.to_owned(),
            default: plan.is_default(),
            org_id,
            bucket_id: bucket.id,
        })?;

        let shard_group = plan.policy.and_then(|rp| {
            (rp.shard_group_duration_secs > 0)
                .then(|| Duration::from_secs(rp.shard_group_duration_secs))
        });
        services.engine.create_bucket_storage(&bucket, shard_group)?;
        if plan.policy.is_some() {
            let copied = services
                .engine
                .import_shards(
                    ShardSource {
                        data_dir: request.source.data_dir.clone(),
                        wal_dir: request.source.wal_dir.clone(),
                        database: database.to_owned(),
                        retention_policy: policy_name.to_owned(),
                    },
                    bucket.id,
                )
                .await?;
            debug!(database, retention_policy = policy_name, files = copied, "Copied shards");
        }

        buckets.insert(database, bucket.id);
        info!(
            database,
            retention_policy = policy_name,
            bucket = %bucket.name,
            bucket_id = %bucket.id,
            "Upgraded database"
        );
    }

    Ok(buckets)
}

/// Continuous queries are written out for the operator, never translated.
struct ContinuousQueryExport {
    path: PathBuf,
    writer: BufWriter<fs::File>,
    count: usize,
}

impl ContinuousQueryExport {
    fn create(path: &Path) -> Result<Self, ArtifactError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| ArtifactError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| ArtifactError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            count: 0,
        })
    }

    fn write_database(&mut self, database: &DatabaseInfo) -> Result<(), ArtifactError> {
        for cq in &database.continuous_queries {
            writeln!(
                self.writer,
                "# DATABASE: {}\n# CQ: {}\n{}\n",
                database.name, cq.name, cq.query
            )
            .map_err(|source| ArtifactError::Write {
                path: self.path.clone(),
                source,
            })?;
            self.count += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), ArtifactError> {
        self.writer.flush().map_err(|source| ArtifactError::Write {
            path: self.path.clone(),
            source,
        })?;
        info!(
            path = %self.path.display(),
            queries = self.count,
            "Exported continuous queries"
        );
        Ok(())
    }
}

fn actions(privilege: Privilege) -> &'static [Action] {
    match privilege {
        Privilege::Read => &[Action::Read],
        Privilege::Write => &[Action::Write],
        Privilege::All => &[Action::Read, Action::Write],
        Privilege::NoPrivileges => &[],
    }
}

fn permissions_for(
    user: &UserInfo,
    org_id: Id,
    buckets: &DatabaseBucketMap,
) -> Vec<Permission> {
    let mut permissions = Vec::new();
    for (database, privilege) in &user.privileges {
        let Some(bucket_ids) = buckets.get(database) else {
            debug!(user = %user.name, database = %database, "No upgraded bucket for privilege");
            continue;
        };
        for bucket_id in bucket_ids {
            for action in actions(*privilege) {
                permissions.push(Permission::bucket(*action, *bucket_id, org_id));
            }
        }
    }
    permissions
}

/// Returns the number of users that received a legacy authorization.
fn migrate_users(
    services: &Services,
    onboarded: &OnboardingResult,
    buckets: &DatabaseBucketMap,
) -> Result<usize, tsdb_upgrade_metastore::StoreError> {
    let mut users: Vec<&UserInfo> = services.legacy.users().iter().collect();
    users.sort_by(|a, b| a.name.cmp(&b.name));

    let mut migrated = 0;
    for user in users {
        if user.admin {
            warn!(user = %user.name, "User is admin and will not be upgraded");
            continue;
        }
        if user.privileges.is_empty() {
            warn!(user = %user.name, "User has no privileges and will not be upgraded");
            continue;
        }
        let permissions = permissions_for(user, onboarded.org.id, buckets);
        if permissions.is_empty() {
            warn!(user = %user.name, "User has no privileges on upgraded databases and will not be upgraded");
            continue;
        }

        let authorization = services.legacy_auth.create_legacy_authorization(NewAuthorization {
            org_id: onboarded.org.id,
            user_id: onboarded.user.id,
            token: user.name.clone(),
            description: format!("{}'s Legacy Token", user.name),
            permissions,
        })?;
        services
            .legacy_auth
            .set_password_hash(authorization.id, &user.hash)?;
        debug!(user = %user.name, "User upgraded");
        migrated += 1;
    }

    info!(users = migrated, "Upgraded users");
    Ok(migrated)
}
