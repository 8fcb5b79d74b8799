use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// ### MetaStore
/// Single-file metadata store of the target deployment.
///
/// Exactly one writer is assumed for the lifetime of the handle: the upgrade
/// process owns the file for the whole run. All access goes through one
/// connection guarded by a mutex. Once [`MetaStore::close`] has run every
/// further access fails with [`StoreError::Closed`].
pub struct MetaStore {
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("path", &self.path).finish()
    }
}

impl MetaStore {
    /// Opens the store at `path`, creating the file and its parent directory if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let connection = Connection::open(&path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!(path = %path.display(), "Opened metadata store");

        Ok(Self {
            path,
            connection: Mutex::new(Some(connection)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with exclusive access to the underlying connection.
    pub fn with_connection<T, E>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.connection.lock().map_err(|_| StoreError::Poisoned)?;
        let connection = guard.as_mut().ok_or(StoreError::Closed)?;
        f(connection)
    }

    /// Closes the connection. Closing an already closed store is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.connection.lock().map_err(|_| StoreError::Poisoned)?;
        match guard.take() {
            Some(connection) => {
                connection.close().map_err(|(_, error)| StoreError::Sqlite(error))?;
                debug!(path = %self.path.display(), "Closed metadata store");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}

/// Seconds since the unix epoch, as stored in `*_at` columns.
pub(crate) fn unix_now() -> Result<i64, StoreError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| StoreError::InvalidValue(format!("system clock: {error}")))?
        .as_secs();
    i64::try_from(secs).map_err(|_| StoreError::InvalidValue(format!("timestamp {secs}")))
}
