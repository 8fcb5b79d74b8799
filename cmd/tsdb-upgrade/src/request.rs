use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::info;
use tsdb_upgrade_legacy::{DEFAULT_BIND_ADDRESS, TranslationTarget, translate_config};
use tsdb_upgrade_metastore::{OnboardingRequest, password::MIN_PASSWORD_LENGTH};

use crate::{
    error::{PreconditionError, UpgradeError},
    validate::validate_paths,
};

/// Raw options of one run, as given on the command line.
#[derive(Clone)]
pub struct UpgradeOptions {
    pub source_dir: PathBuf,
    pub config_file: Option<PathBuf>,
    pub bolt_path: PathBuf,
    pub configs_path: PathBuf,
    pub engine_path: PathBuf,
    pub cq_export_path: PathBuf,
    pub username: String,
    pub password: String,
    pub org: String,
    pub bucket: String,
    /// Human-readable duration; absent or `0` keeps data forever.
    pub retention: Option<String>,
    pub token: Option<String>,
}

impl fmt::Debug for UpgradeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeOptions")
            .field("source_dir", &self.source_dir)
            .field("config_file", &self.config_file)
            .field("bolt_path", &self.bolt_path)
            .field("configs_path", &self.configs_path)
            .field("engine_path", &self.engine_path)
            .field("cq_export_path", &self.cq_export_path)
            .field("username", &self.username)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SourceSide {
    pub meta_dir: PathBuf,
    pub data_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub config_file: Option<PathBuf>,
    /// Target configuration written by the translator, if one was.
    pub translated_config: Option<PathBuf>,
    pub base_url: String,
    pub auth_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct TargetPaths {
    pub bolt_path: PathBuf,
    pub configs_path: PathBuf,
    pub engine_path: PathBuf,
    pub cq_export_path: PathBuf,
}

#[derive(Clone)]
pub struct AdminSpec {
    pub username: String,
    pub password: String,
    pub org: String,
    pub bucket: String,
    pub retention: Option<Duration>,
    pub token: Option<String>,
}

impl fmt::Debug for AdminSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminSpec")
            .field("username", &self.username)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl AdminSpec {
    pub fn onboarding_request(&self) -> OnboardingRequest {
        OnboardingRequest {
            user: self.username.clone(),
            password: self.password.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            retention: self.retention,
            token: self.token.clone(),
        }
    }
}

/// Validated description of one upgrade. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub source: SourceSide,
    pub target: TargetPaths,
    pub admin: AdminSpec,
}

impl UpgradeRequest {
    /// Validates paths and inputs, then translates the legacy config if one
    /// was given. The translated config is the only file this writes.
    pub fn prepare(options: &UpgradeOptions) -> Result<Self, UpgradeError> {
        let target = TargetPaths {
            bolt_path: options.bolt_path.clone(),
            configs_path: options.configs_path.clone(),
            engine_path: options.engine_path.clone(),
            cq_export_path: options.cq_export_path.clone(),
        };
        validate_paths(&options.source_dir, options.config_file.as_deref(), &target)?;
        let admin = admin_spec(options)?;

        let mut source = SourceSide {
            meta_dir: options.source_dir.join("meta"),
            data_dir: options.source_dir.join("data"),
            wal_dir: options.source_dir.join("wal"),
            config_file: options.config_file.clone(),
            translated_config: None,
            base_url: format!("http://localhost{DEFAULT_BIND_ADDRESS}"),
            auth_enabled: false,
        };

        match &options.config_file {
            Some(config_file) => {
                let translated = translate_config(
                    config_file,
                    &TranslationTarget {
                        bolt_path: target.bolt_path.clone(),
                        engine_path: target.engine_path.clone(),
                    },
                )?;
                info!(
                    from = %config_file.display(),
                    to = %translated.written_to.display(),
                    "Translated legacy config"
                );
                if let Some(dir) = translated.meta_dir {
                    source.meta_dir = dir;
                }
                if let Some(dir) = translated.data_dir {
                    source.data_dir = dir;
                }
                if let Some(dir) = translated.wal_dir {
                    source.wal_dir = dir;
                }
                source.base_url = translated.base_url;
                source.auth_enabled = translated.auth_enabled;
                source.translated_config = Some(translated.written_to);
            }
            None => info!("No legacy config file specified, skipping its upgrade"),
        }

        Ok(Self {
            source,
            target,
            admin,
        })
    }

    /// Every target artifact this request may create, in creation order.
    pub fn target_files(&self) -> Vec<&Path> {
        let mut files = Vec::with_capacity(4);
        if let Some(translated) = &self.source.translated_config {
            files.push(translated.as_path());
        }
        files.extend([
            self.target.bolt_path.as_path(),
            self.target.configs_path.as_path(),
            self.target.cq_export_path.as_path(),
        ]);
        files
    }
}

fn admin_spec(options: &UpgradeOptions) -> Result<AdminSpec, PreconditionError> {
    for (option, value) in [
        ("username", &options.username),
        ("org", &options.org),
        ("bucket", &options.bucket),
    ] {
        if value.trim().is_empty() {
            return Err(PreconditionError::InvalidOption(format!(
                "{option} must not be empty"
            )));
        }
    }
    if options.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PreconditionError::InvalidOption(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if options.token.as_deref().is_some_and(str::is_empty) {
        return Err(PreconditionError::InvalidOption(
            "token must not be empty when given".to_owned(),
        ));
    }

    Ok(AdminSpec {
        username: options.username.clone(),
        password: options.password.clone(),
        org: options.org.clone(),
        bucket: options.bucket.clone(),
        retention: parse_retention(options.retention.as_deref())?,
        token: options.token.clone(),
    })
}

/// `None` for an absent or zero retention, which keeps data forever.
pub fn parse_retention(value: Option<&str>) -> Result<Option<Duration>, PreconditionError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if value == "0" {
        return Ok(None);
    }
    let invalid = |reason: String| PreconditionError::InvalidRetention {
        value: value.to_owned(),
        reason,
    };
    let duration = humantime::parse_duration(value).map_err(|error| invalid(error.to_string()))?;
    if duration.is_zero() {
        return Ok(None);
    }
    // Buckets store whole seconds as a signed 64-bit count.
    if duration.as_secs() == 0 {
        return Err(invalid("retention must be at least one second".to_owned()));
    }
    if i64::try_from(duration.as_secs()).is_err() {
        return Err(invalid("retention is too long to store".to_owned()));
    }
    Ok(Some(duration))
}
