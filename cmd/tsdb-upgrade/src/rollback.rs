use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{error, info, warn};

use crate::{error::RollbackError, request::UpgradeRequest};

/// Best-effort removal of what a failed database migration left on the
/// target side. The source deployment is never touched.
#[derive(Debug)]
pub struct RollbackManager<'r> {
    request: &'r UpgradeRequest,
}

/// Paths removed by a rollback and the ones left behind.
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<RollbackError>,
}

impl<'r> RollbackManager<'r> {
    pub fn new(request: &'r UpgradeRequest) -> Self {
        Self { request }
    }

    /// Deletes the metadata store, the engine directory and the flat target
    /// artifacts. Every failed deletion is logged and skipped.
    pub fn run(&self) -> RollbackReport {
        warn!("Rolling back target artifacts of the failed upgrade");
        let mut report = RollbackReport::default();

        for file in self.request.target_files() {
            report.record(file, remove_file(file));
        }
        let engine_path = &self.request.target.engine_path;
        report.record(engine_path, remove_dir(engine_path));

        info!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Rollback finished"
        );
        report
    }
}

impl RollbackReport {
    fn record(&mut self, path: &Path, result: io::Result<bool>) {
        match result {
            Ok(true) => {
                info!(path = %path.display(), "Removed");
                self.removed.push(path.to_path_buf());
            }
            Ok(false) => {}
            Err(source) => {
                error!(path = %path.display(), error = %source, "Failed to remove during rollback");
                self.failures.push(RollbackError {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

/// `Ok(false)` when there was nothing to remove.
fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn remove_dir(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
