use std::{fs, path::Path, sync::Arc};

use eyre::WrapErr;
use tracing::{Level, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};
use tsdb_upgrade_legacy::{LegacyMeta, LegacyMetaReader};
use tsdb_upgrade_metastore::{
    Engine, LegacyAuthorizationService, MetaStore, OnboardingService, SqlAuthorizationService,
    SqlOnboardingService, SqlTenantService, StorageEngine, TenantService,
};

use crate::{
    error::{BootstrapError, ResourceReleaseError, UpgradeError},
    request::UpgradeRequest,
    runtime::Runtime,
};

/// Installs the global subscriber: stderr always, plus `log_path` when given.
/// Stdout is left to the upgrade report.
///
/// The returned guard flushes the file writer and must outlive the run.
pub fn init_tracing(level: Level, log_path: Option<&Path>) -> eyre::Result<Option<WorkerGuard>> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(level))
        .from_env_lossy();

    let include_target = matches!(level, Level::DEBUG | Level::TRACE);
    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_path {
        Some(log_path) => {
            if let Some(parent) = log_path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("Cannot create log directory {parent:?}"))?;
            }
            let file = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_path)
                .wrap_err_with(|| format!("Cannot open log file {log_path:?}"))?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_target(include_target)
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber =
        Registry::default().with(fmt_layer.and_then(file_layer).with_filter(log_filter));
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("Setting default subscriber failed")?;

    Ok(guard)
}

/// Handles the pipeline works with. Built by [`bootstrap`].
///
/// [`Services::release`] closes the storage engine, then the metadata store.
/// It runs at most once; dropping unreleased services releases them.
pub struct Services {
    pub store: Arc<MetaStore>,
    pub legacy: Arc<dyn LegacyMetaReader + Send + Sync>,
    pub tenant: Arc<dyn TenantService>,
    pub legacy_auth: Arc<dyn LegacyAuthorizationService>,
    pub onboarding: Arc<dyn OnboardingService>,
    pub engine: Arc<dyn StorageEngine>,
    released: bool,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("store", &self.store)
            .field("engine", &self.engine.path())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Closes every handle. Failures are logged and returned, never raised.
    pub fn release(&mut self) -> Vec<ResourceReleaseError> {
        if self.released {
            return Vec::new();
        }
        self.released = true;

        let mut errors = Vec::new();
        if let Err(err) = self.engine.close() {
            errors.push(ResourceReleaseError::Engine(err));
        }
        if let Err(err) = self.store.close() {
            errors.push(ResourceReleaseError::Store(err));
        }
        for err in &errors {
            error!(error = %err, "Failed to release resource");
        }
        errors
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the legacy metadata and the target metadata store, applies pending
/// schema migrations and builds every target handle on top of the store.
///
/// On failure, handles already acquired here are released before returning.
pub fn bootstrap(request: &UpgradeRequest, runtime: &Runtime) -> Result<Services, UpgradeError> {
    let legacy = LegacyMeta::open(&request.source.meta_dir).map_err(BootstrapError::from)?;
    info!(
        databases = legacy.databases().len(),
        users = legacy.users().len(),
        "Opened legacy meta"
    );

    let store = Arc::new(
        MetaStore::open(&request.target.bolt_path).map_err(BootstrapError::from)?,
    );
    info!(path = %store.path().display(), "Opened metadata store");

    if let Err(err) = runtime.migrator().up(&store) {
        release_store(&store);
        return Err(err.into());
    }

    let engine = match Engine::open(&request.target.engine_path, store.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            release_store(&store);
            return Err(BootstrapError::from(err).into());
        }
    };

    Ok(Services {
        legacy: Arc::new(legacy),
        tenant: Arc::new(SqlTenantService::new(store.clone())),
        legacy_auth: Arc::new(SqlAuthorizationService::new(store.clone())),
        onboarding: Arc::new(SqlOnboardingService::new(store.clone())),
        engine,
        store,
        released: false,
    })
}

fn release_store(store: &MetaStore) {
    if let Err(err) = store.close() {
        error!(error = %err, "Failed to close metadata store after bootstrap failure");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tsdb_upgrade_legacy::META_FILENAME;

    use super::*;
    use crate::request::UpgradeOptions;

    fn request(root: &Path) -> UpgradeRequest {
        let source_dir = root.join("v1");
        fs::create_dir_all(source_dir.join("meta")).expect("meta dir");
        fs::write(
            source_dir.join("meta").join(META_FILENAME),
            r#"{"databases": [{"name": "db"}]}"#,
        )
        .expect("meta file");
        UpgradeRequest::prepare(&UpgradeOptions {
            source_dir,
            config_file: None,
            bolt_path: root.join("v2/tsdb.sqlite"),
            configs_path: root.join("v2/configs"),
            engine_path: root.join("v2/engine"),
            cq_export_path: root.join("cq.txt"),
            username: "admin".to_owned(),
            password: "password123".to_owned(),
            org: "acme".to_owned(),
            bucket: "bucket".to_owned(),
            retention: None,
            token: None,
        })
        .expect("prepare")
    }

    #[test]
    fn bootstrap_migrates_store_and_release_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = request(dir.path());
        let runtime = Runtime::new().expect("runtime");

        let mut services = bootstrap(&request, &runtime).expect("bootstrap");
        assert_eq!(services.legacy.databases().len(), 1);
        assert!(services.onboarding.is_onboarding().expect("fresh store"));
        assert!(request.target.engine_path.join("data").is_dir());

        assert!(services.release().is_empty());
        assert!(services.store.is_closed());
        assert!(services.release().is_empty());
    }

    #[test]
    fn dropping_services_closes_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = request(dir.path());
        let runtime = Runtime::new().expect("runtime");

        let services = bootstrap(&request, &runtime).expect("bootstrap");
        let store = services.store.clone();
        drop(services);
        assert!(store.is_closed());
    }

    #[test]
    fn engine_failure_releases_the_already_opened_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = request(dir.path());
        let runtime = Runtime::new().expect("runtime");
        // A file where the engine directory should go makes the engine fail to open.
        let engine_path: PathBuf = request.target.engine_path.clone();
        fs::create_dir_all(engine_path.parent().expect("parent")).expect("v2");
        fs::write(&engine_path, "not a directory").expect("blocker");

        let error = bootstrap(&request, &runtime).expect_err("engine cannot open");
        assert!(matches!(
            error,
            UpgradeError::Bootstrap(BootstrapError::Engine(_))
        ));

        // The store was closed, so it can be reopened and still carries its schema.
        let reopened = MetaStore::open(&request.target.bolt_path).expect("reopen");
        assert_eq!(
            tsdb_upgrade_metastore::SchemaMigrator::applied(&reopened)
                .expect("records")
                .len(),
            runtime.migrator().len()
        );
    }
}
