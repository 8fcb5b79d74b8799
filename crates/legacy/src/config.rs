use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use toml::{Table, Value};
use tracing::{debug, warn};

/// Address the legacy server listens on when `http.bind-address` is unset.
pub const DEFAULT_BIND_ADDRESS: &str = ":8086";

/// File name of the translated configuration, written next to the legacy file.
pub const TRANSLATED_CONFIG_FILENAME: &str = "config.toml";

/// Legacy keys carried into the target configuration, with their new names.
const CONFIG_MAP_RULES: [(&str, &str); 11] = [
    ("reporting-disabled", "reporting-disabled"),
    ("http.bind-address", "http-bind-address"),
    ("http.https-certificate", "tls-cert"),
    ("http.https-private-key", "tls-key"),
    ("logging.level", "log-level"),
    ("data.cache-max-memory-size", "storage-cache-max-memory-size"),
    (
        "data.cache-snapshot-memory-size",
        "storage-cache-snapshot-memory-size",
    ),
    ("data.wal-fsync-delay", "storage-wal-fsync-delay"),
    ("data.validate-keys", "storage-validate-keys"),
    (
        "data.max-series-per-database",
        "storage-max-series-per-database",
    ),
    ("coordinator.max-concurrent-queries", "query-concurrency"),
];

/// Legacy keys used to locate the source deployment. They have no target
/// equivalent but are not "unsupported" either.
const CONSUMED_KEYS: [&str; 5] = [
    "meta.dir",
    "data.dir",
    "data.wal-dir",
    "http.https-enabled",
    "http.auth-enabled",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read legacy config file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed legacy config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cannot encode translated config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("cannot write translated config file '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// The subset of the legacy configuration the upgrade consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub meta: MetaSection,
    pub data: DataSection,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetaSection {
    pub dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DataSection {
    pub dir: String,
    pub wal_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpSection {
    pub bind_address: String,
    pub https_enabled: bool,
    pub auth_enabled: bool,
}

impl LegacyConfig {
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// URL legacy clients use to reach the server.
    ///
    /// A port-only bind address (`:8086`) is served on `localhost`; any other
    /// address is used as the host verbatim.
    pub fn base_url(&self) -> String {
        let address = match self.http.bind_address.as_str() {
            "" => DEFAULT_BIND_ADDRESS,
            address => address,
        };
        let scheme = if self.http.https_enabled {
            "https"
        } else {
            "http"
        };
        if address.starts_with(':') {
            format!("{scheme}://localhost{address}")
        } else {
            format!("{scheme}://{address}")
        }
    }
}

/// Target paths written into the translated configuration.
#[derive(Debug, Clone)]
pub struct TranslationTarget {
    pub bolt_path: PathBuf,
    pub engine_path: PathBuf,
}

/// Result of translating a legacy configuration file.
#[derive(Debug, Clone)]
pub struct TranslatedConfig {
    pub meta_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub wal_dir: Option<PathBuf>,
    pub base_url: String,
    pub auth_enabled: bool,
    /// Where the target configuration was written.
    pub written_to: PathBuf,
    pub unsupported_keys: Vec<String>,
}

/// Path the translated counterpart of `legacy_config` is written to.
pub fn translated_config_path(legacy_config: &Path) -> PathBuf {
    legacy_config.with_file_name(TRANSLATED_CONFIG_FILENAME)
}

/// Reads the legacy configuration at `legacy_path`, derives the source side
/// settings and writes the target configuration next to it.
///
/// The target file is created exclusively: an existing file is an error and
/// is never overwritten.
pub fn translate_config(
    legacy_path: &Path,
    target: &TranslationTarget,
) -> Result<TranslatedConfig, ConfigError> {
    let contents = read_config(legacy_path)?;
    let legacy = LegacyConfig::parse(legacy_path, &contents)?;
    let raw: Table = contents.parse().map_err(|source| ConfigError::Parse {
        path: legacy_path.to_path_buf(),
        source,
    })?;

    let mut translated = Table::new();
    for (legacy_key, target_key) in CONFIG_MAP_RULES {
        if let Some(value) = lookup(&raw, legacy_key) {
            debug!(legacy_key, target_key, "Translating config option");
            translated.insert(target_key.to_owned(), value.clone());
        }
    }
    translated.insert(
        "bolt-path".to_owned(),
        Value::String(target.bolt_path.display().to_string()),
    );
    translated.insert(
        "engine-path".to_owned(),
        Value::String(target.engine_path.display().to_string()),
    );

    let mut unsupported_keys = Vec::new();
    collect_leaf_keys(&raw, "", &mut unsupported_keys);
    unsupported_keys.retain(|key| {
        let key = key.as_str();
        !CONFIG_MAP_RULES.iter().any(|(rule, _)| *rule == key) && !CONSUMED_KEYS.contains(&key)
    });
    for key in &unsupported_keys {
        warn!(key = %key, "Legacy config option is not supported by the target and was dropped");
    }

    let written_to = translated_config_path(legacy_path);
    let encoded = toml::to_string(&translated)?;
    write_new_file(&written_to, &encoded).map_err(|source| ConfigError::Write {
        path: written_to.clone(),
        source,
    })?;

    Ok(TranslatedConfig {
        meta_dir: non_empty_path(&legacy.meta.dir),
        data_dir: non_empty_path(&legacy.data.dir),
        wal_dir: non_empty_path(&legacy.data.wal_dir),
        base_url: legacy.base_url(),
        auth_enabled: legacy.http.auth_enabled,
        written_to,
        unsupported_keys,
    })
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn lookup<'a>(table: &'a Table, dotted_key: &str) -> Option<&'a Value> {
    let mut parts = dotted_key.split('.');
    let mut value = table.get(parts.next()?)?;
    for part in parts {
        value = value.as_table()?.get(part)?;
    }
    Some(value)
}

fn collect_leaf_keys(table: &Table, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Table(nested) => collect_leaf_keys(nested, &path, out),
            _ => out.push(path),
        }
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

fn write_new_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}
