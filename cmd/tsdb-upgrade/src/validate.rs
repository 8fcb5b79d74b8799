//! Read-only precondition checks run before anything is written.
//!
//! The upgrade is not transactional across the filesystem, so every target
//! artifact must be absent up front. That keeps a failed run retryable.

use std::{fs, io, path::Path};

use tsdb_upgrade_legacy::{META_FILENAME, translated_config_path};

use crate::{error::PreconditionError, request::TargetPaths};

/// Checks, in order and stopping at the first violation, that the source
/// deployment is usable and that no target artifact exists yet.
pub fn validate_paths(
    source_dir: &Path,
    config_file: Option<&Path>,
    target: &TargetPaths,
) -> Result<(), PreconditionError> {
    match fs::metadata(source_dir) {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(PreconditionError::SourceNotDirectory(
                source_dir.to_path_buf(),
            ));
        }
        Ok(_) => {}
        Err(_) => return Err(PreconditionError::SourceMissing(source_dir.to_path_buf())),
    }

    let meta_file = source_dir.join("meta").join(META_FILENAME);
    if !exists(&meta_file) {
        return Err(PreconditionError::MetaFileMissing(meta_file));
    }

    if let Some(config_file) = config_file {
        if !exists(config_file) {
            return Err(PreconditionError::ConfigFileMissing(
                config_file.to_path_buf(),
            ));
        }
        let translated = translated_config_path(config_file);
        if exists(&translated) {
            return Err(PreconditionError::TranslatedConfigPresent(translated));
        }
    }

    if exists(&target.bolt_path) {
        return Err(PreconditionError::MetaStorePresent(
            target.bolt_path.clone(),
        ));
    }

    // A symlink is judged by what it points at. A dangling one is not a directory.
    if exists(&target.engine_path) {
        if !fs::metadata(&target.engine_path).is_ok_and(|metadata| metadata.is_dir()) {
            return Err(PreconditionError::EngineNotDirectory(
                target.engine_path.clone(),
            ));
        }
        if !is_empty_dir(&target.engine_path).map_err(|source| PreconditionError::Inspect {
            path: target.engine_path.clone(),
            source,
        })? {
            return Err(PreconditionError::EngineNotEmpty(
                target.engine_path.clone(),
            ));
        }
    }

    if exists(&target.configs_path) {
        return Err(PreconditionError::CliConfigPresent(
            target.configs_path.clone(),
        ));
    }

    if exists(&target.cq_export_path) {
        return Err(PreconditionError::ContinuousQueryExportPresent(
            target.cq_export_path.clone(),
        ));
    }

    Ok(())
}

/// Anything `stat` can see counts, including dangling symlinks.
fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    struct Layout {
        _dir: tempfile::TempDir,
        source: PathBuf,
        target: TargetPaths,
    }

    fn layout() -> Layout {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("v1");
        fs::create_dir_all(source.join("meta")).expect("meta dir");
        fs::write(source.join("meta").join(META_FILENAME), "{}").expect("meta file");
        let v2 = dir.path().join("v2");
        let target = TargetPaths {
            bolt_path: v2.join("tsdb.sqlite"),
            configs_path: v2.join("configs"),
            engine_path: v2.join("engine"),
            cq_export_path: dir.path().join("continuous_queries.txt"),
        };
        Layout {
            _dir: dir,
            source,
            target,
        }
    }

    #[test]
    fn accepts_a_clean_layout() {
        let layout = layout();
        validate_paths(&layout.source, None, &layout.target).expect("clean layout");
    }

    #[test]
    fn rejects_missing_or_non_directory_source() {
        let layout = layout();
        let missing = layout.source.join("nope");
        assert!(matches!(
            validate_paths(&missing, None, &layout.target),
            Err(PreconditionError::SourceMissing(path)) if path == missing
        ));

        let file = layout.source.join("meta").join(META_FILENAME);
        assert!(matches!(
            validate_paths(&file, None, &layout.target),
            Err(PreconditionError::SourceNotDirectory(_))
        ));
    }

    #[test]
    fn rejects_missing_meta_file() {
        let layout = layout();
        fs::remove_file(layout.source.join("meta").join(META_FILENAME)).expect("remove");
        let error = validate_paths(&layout.source, None, &layout.target).expect_err("no meta");
        assert!(error.to_string().contains(META_FILENAME));
    }

    #[test]
    fn rejects_missing_config_and_existing_translation() {
        let layout = layout();
        let config = layout.source.join("tsdb.conf");
        assert!(matches!(
            validate_paths(&layout.source, Some(&config), &layout.target),
            Err(PreconditionError::ConfigFileMissing(_))
        ));

        fs::write(&config, "").expect("config");
        fs::write(translated_config_path(&config), "").expect("translated");
        assert!(matches!(
            validate_paths(&layout.source, Some(&config), &layout.target),
            Err(PreconditionError::TranslatedConfigPresent(_))
        ));
    }

    #[test]
    fn rejects_non_empty_engine_dir_but_accepts_empty_one() {
        let layout = layout();
        fs::create_dir_all(&layout.target.engine_path).expect("engine dir");
        validate_paths(&layout.source, None, &layout.target).expect("empty engine dir is fine");

        fs::write(layout.target.engine_path.join("leftover"), "x").expect("leftover");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::EngineNotEmpty(_))
        ));
    }

    #[test]
    fn rejects_engine_path_that_is_a_file() {
        let layout = layout();
        fs::create_dir_all(layout.target.engine_path.parent().expect("parent")).expect("v2");
        fs::write(&layout.target.engine_path, "x").expect("file");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::EngineNotDirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn engine_symlinks_are_resolved() {
        let layout = layout();
        let v2 = layout.target.engine_path.parent().expect("parent").to_path_buf();
        fs::create_dir_all(&v2).expect("v2");
        std::os::unix::fs::symlink(v2.join("gone"), &layout.target.engine_path).expect("symlink");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::EngineNotDirectory(_))
        ));

        fs::create_dir(v2.join("gone")).expect("link target");
        validate_paths(&layout.source, None, &layout.target)
            .expect("symlink to an empty directory is fine");
    }

    #[test]
    fn checks_target_files_in_order() {
        let layout = layout();
        fs::create_dir_all(layout.target.bolt_path.parent().expect("parent")).expect("v2");
        fs::write(&layout.target.cq_export_path, "").expect("cq");
        fs::write(&layout.target.configs_path, "").expect("configs");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::CliConfigPresent(_))
        ));

        fs::write(&layout.target.bolt_path, "").expect("bolt");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::MetaStorePresent(_))
        ));

        fs::remove_file(&layout.target.bolt_path).expect("rm bolt");
        fs::remove_file(&layout.target.configs_path).expect("rm configs");
        assert!(matches!(
            validate_paths(&layout.source, None, &layout.target),
            Err(PreconditionError::ContinuousQueryExportPresent(_))
        ));
    }
}
