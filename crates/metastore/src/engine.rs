//! Storage-engine handle of the target deployment.
//!
//! The shard format itself is opaque here: importing legacy data copies the
//! shard trees of one legacy `database/retention_policy` pair into the
//! directories owned by a target bucket.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rusqlite::params;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    error::StoreError,
    id::Id,
    store::{MetaStore, unix_now},
    tenant::{Bucket, retention_to_secs},
};

/// Retention policy name every target bucket's engine database gets.
pub const DEFAULT_RETENTION_POLICY: &str = "autogen";

const DATA_DIR: &str = "data";
const WAL_DIR: &str = "wal";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine i/o error at '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage engine is closed")]
    Closed,
    #[error("shard import task failed: {0}")]
    Join(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> EngineError + '_ {
    move |source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Location of one legacy `database/retention_policy` shard tree.
#[derive(Debug, Clone)]
pub struct ShardSource {
    pub data_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub database: String,
    pub retention_policy: String,
}

#[async_trait::async_trait]
pub trait StorageEngine: Send + Sync {
    fn path(&self) -> &Path;

    /// Registers the engine database backing `bucket` and creates its directories.
    fn create_bucket_storage(
        &self,
        bucket: &Bucket,
        shard_group_duration: Option<Duration>,
    ) -> Result<(), EngineError>;

    /// Copies legacy shards into the bucket's storage. Returns the number of files copied.
    async fn import_shards(&self, source: ShardSource, bucket_id: Id) -> Result<u64, EngineError>;

    /// Closing an already closed engine is a no-op.
    fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug)]
pub struct Engine {
    root: PathBuf,
    store: Arc<MetaStore>,
    closed: AtomicBool,
}

impl Engine {
    pub fn open(root: impl AsRef<Path>, store: Arc<MetaStore>) -> Result<Self, EngineError> {
        let root = root.as_ref().to_path_buf();
        for dir in [DATA_DIR, WAL_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        info!(path = %root.display(), "Opened storage engine");
        Ok(Self {
            root,
            store,
            closed: AtomicBool::new(false),
        })
    }

    fn bucket_dirs(&self, bucket_id: Id) -> [PathBuf; 2] {
        let bucket = bucket_id.to_string();
        [DATA_DIR, WAL_DIR].map(|dir| {
            self.root
                .join(dir)
                .join(&bucket)
                .join(DEFAULT_RETENTION_POLICY)
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageEngine for Engine {
    fn path(&self) -> &Path {
        &self.root
    }

    fn create_bucket_storage(
        &self,
        bucket: &Bucket,
        shard_group_duration: Option<Duration>,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        let retention_secs = retention_to_secs(bucket.retention)?;
        let shard_group_secs = retention_to_secs(shard_group_duration)?;
        let created_at = unix_now()?;
        self.store.with_connection(|conn| {
            conn.execute(
                "
                INSERT INTO engine_databases (bucket_id, retention_policy, retention_secs, shard_group_secs, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    bucket.id,
                    DEFAULT_RETENTION_POLICY,
                    retention_secs,
                    shard_group_secs,
                    created_at,
                ],
            )
            .map_err(|error| {
                StoreError::from_insert(error, || format!("engine database {}", bucket.id))
            })
        })?;

        for dir in self.bucket_dirs(bucket.id) {
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }
        debug!(bucket = %bucket.name, id = %bucket.id, "Created bucket storage");
        Ok(())
    }

    async fn import_shards(&self, source: ShardSource, bucket_id: Id) -> Result<u64, EngineError> {
        self.ensure_open()?;
        let [data_target, wal_target] = self.bucket_dirs(bucket_id);
        let data_source = source
            .data_dir
            .join(&source.database)
            .join(&source.retention_policy);
        let wal_source = source
            .wal_dir
            .join(&source.database)
            .join(&source.retention_policy);

        let copied = tokio::task::spawn_blocking(move || -> Result<u64, EngineError> {
            Ok(copy_tree(&data_source, &data_target)? + copy_tree(&wal_source, &wal_target)?)
        })
        .await
        .map_err(|error| EngineError::Join(error.to_string()))??;

        debug!(
            database = %source.database,
            retention_policy = %source.retention_policy,
            bucket = %bucket_id,
            files = copied,
            "Imported shards"
        );
        Ok(copied)
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for dir in [DATA_DIR, WAL_DIR] {
            sync_dir(&self.root.join(dir))?;
        }
        info!(path = %self.root.display(), "Closed storage engine");
        Ok(())
    }
}

/// Flushes directory entries so imported shards survive a crash after close.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), EngineError> {
    fs::File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(io_error(path))
}

#[cfg(not(unix))]
fn sync_dir(path: &Path) -> Result<(), EngineError> {
    fs::metadata(path).map(drop).map_err(io_error(path))
}

/// Index and internal directories are rebuilt by the target engine.
fn is_skipped_dir(name: &str) -> bool {
    name == "index" || name.starts_with('_')
}

/// Recursively copies `from` into `to`. A missing `from` copies nothing.
/// Symlinks are followed, both for `from` and for its entries.
fn copy_tree(from: &Path, to: &Path) -> Result<u64, EngineError> {
    if !from.is_dir() {
        return Ok(0);
    }
    fs::create_dir_all(to).map_err(io_error(to))?;

    let mut copied = 0;
    for entry in fs::read_dir(from).map_err(io_error(from))? {
        let entry = entry.map_err(io_error(from))?;
        let name = entry.file_name();
        let source = entry.path();
        let target = to.join(&name);
        if fs::metadata(&source).map_err(io_error(&source))?.is_dir() {
            if name.to_str().is_some_and(is_skipped_dir) {
                continue;
            }
            copied += copy_tree(&source, &target)?;
        } else {
            fs::copy(&source, &target).map_err(io_error(&source))?;
            copied += 1;
        }
    }
    Ok(copied)
}
