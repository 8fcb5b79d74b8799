use std::{
    fs::{self, File, OpenOptions},
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use clap::Parser as ClapParser;
use dialoguer::Confirm;
use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::Level;

use crate::{
    pipeline::{CompletedUpgrade, FailedUpgrade, UpgradePipeline},
    request::UpgradeOptions,
    runtime::Runtime,
};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Environment variable naming the legacy config file when `--config-file` is absent.
pub const LEGACY_CONFIG_PATH_ENV: &str = "TSDB_CONFIG_PATH";

fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_source_dir() -> PathBuf {
    home_dir().join(".tsdb")
}

fn default_target_dir() -> PathBuf {
    home_dir().join(".tsdbv2")
}

/// `$TSDB_CONFIG_PATH`, else the first legacy config found in the usual places.
pub fn default_config_file() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(LEGACY_CONFIG_PATH_ENV).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }
    [
        default_source_dir().join("tsdb.conf"),
        PathBuf::from("/etc/tsdb/tsdb.conf"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

#[derive(ClapParser, Debug, Clone)]
#[command(
    name = "tsdb-upgrade",
    about = "Upgrade a legacy time-series database deployment to the new on-disk layout",
    long_about = "Migrates the legacy metadata, data, users and configuration into a fresh target deployment. \
                  The legacy deployment is only read. A failed run can be retried once its target artifacts are gone.",
    version
)]
pub struct Options {
    #[arg(
        long = "v1-dir",
        value_name = "DIRECTORY",
        default_value = default_source_dir().into_os_string(),
        help = "Path to the legacy deployment root, containing meta, data and wal directories.",
        help_heading = "Source options",
        env = "TSDB_UPGRADE_V1_DIR"
    )]
    pub source_dir: PathBuf,
    #[arg(
        long = "config-file",
        value_name = "FILE",
        help = "Legacy configuration file to translate.",
        long_help = "Defaults to $TSDB_CONFIG_PATH, then ~/.tsdb/tsdb.conf, then /etc/tsdb/tsdb.conf, whichever exists first.",
        help_heading = "Source options",
        env = "TSDB_UPGRADE_CONFIG_FILE"
    )]
    pub config_file: Option<PathBuf>,
    #[arg(
        long = "bolt-path",
        short = 'm',
        value_name = "FILE",
        default_value = default_target_dir().join("tsdb.sqlite").into_os_string(),
        help = "Path for the target metadata store. Must not exist.",
        help_heading = "Target options",
        env = "TSDB_UPGRADE_BOLT_PATH"
    )]
    pub bolt_path: PathBuf,
    #[arg(
        long = "configs-path",
        short = 'c',
        value_name = "FILE",
        default_value = default_target_dir().join("configs").into_os_string(),
        help = "Path for the CLI credentials file. Must not exist.",
        help_heading = "Target options",
        env = "TSDB_UPGRADE_CONFIGS_PATH"
    )]
    pub configs_path: PathBuf,
    #[arg(
        long = "engine-path",
        short = 'e',
        value_name = "DIRECTORY",
        default_value = default_target_dir().join("engine").into_os_string(),
        help = "Path for the target storage engine. Must be absent or empty.",
        help_heading = "Target options",
        env = "TSDB_UPGRADE_ENGINE_PATH"
    )]
    pub engine_path: PathBuf,
    #[arg(
        long = "continuous-query-export-path",
        value_name = "FILE",
        default_value = home_dir().join("continuous_queries.txt").into_os_string(),
        help = "Path for the exported legacy continuous queries. Must not exist.",
        help_heading = "Target options",
        env = "TSDB_UPGRADE_CONTINUOUS_QUERY_EXPORT_PATH"
    )]
    pub cq_export_path: PathBuf,
    #[arg(
        long = "username",
        short = 'u',
        value_name = "USERNAME",
        help = "Primary username.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_USERNAME"
    )]
    pub username: String,
    #[arg(
        long = "password",
        short = 'p',
        value_name = "PASSWORD",
        help = "Password for the primary user.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_PASSWORD",
        hide_env_values = true
    )]
    pub password: String,
    #[arg(
        long = "org",
        short = 'o',
        value_name = "ORG",
        help = "Primary organization name.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_ORG"
    )]
    pub org: String,
    #[arg(
        long = "bucket",
        short = 'b',
        value_name = "BUCKET",
        help = "Primary bucket name.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_BUCKET"
    )]
    pub bucket: String,
    #[arg(
        long = "retention",
        short = 'r',
        value_name = "DURATION",
        help = "Retention of the primary bucket, e.g. 30d or 1w.",
        long_help = "Absent or 0 keeps data forever.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_RETENTION"
    )]
    pub retention: Option<String>,
    #[arg(
        long = "token",
        short = 't',
        value_name = "TOKEN",
        help = "Token for the primary user. Generated when absent.",
        help_heading = "Setup options",
        env = "TSDB_UPGRADE_TOKEN",
        hide_env_values = true
    )]
    pub token: Option<String>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "TSDB_UPGRADE_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Output options"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.path",
        value_name = "FILE",
        help = "Also write logs to this file.",
        help_heading = "Output options",
        env = "TSDB_UPGRADE_LOG_PATH"
    )]
    pub log_path: Option<PathBuf>,
    #[arg(
        long = "json",
        default_value_t = false,
        help = "Emit a machine-readable JSON report.",
        help_heading = "Output options"
    )]
    pub json: bool,
    #[arg(
        long = "report-file",
        value_name = "FILE",
        help = "Optional path to append emitted reports (JSON lines in --json mode).",
        help_heading = "Output options"
    )]
    pub report_file: Option<PathBuf>,
    #[arg(
        long = "force",
        short = 'f',
        default_value_t = false,
        help = "Skip the confirmation prompt.",
        long_help = "The prompt is also skipped when stdin is not a terminal.",
        help_heading = "Setup options"
    )]
    pub force: bool,
}

impl Options {
    pub fn upgrade_options(&self) -> UpgradeOptions {
        UpgradeOptions {
            source_dir: self.source_dir.clone(),
            config_file: self.config_file.clone().or_else(default_config_file),
            bolt_path: self.bolt_path.clone(),
            configs_path: self.configs_path.clone(),
            engine_path: self.engine_path.clone(),
            cq_export_path: self.cq_export_path.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            retention: self.retention.clone(),
            token: self.token.clone(),
        }
    }

    pub fn report_file(&self) -> Option<&Path> {
        self.report_file.as_deref()
    }

    pub async fn run(&self, runtime: &Runtime, started_at: Instant) -> Result<()> {
        let options = self.upgrade_options();
        if needs_confirmation(self.force, std::io::stdin().is_terminal())
            && !confirm_upgrade(&options)?
        {
            eyre::bail!("Upgrade cancelled at the confirmation prompt");
        }

        let mut pipeline = UpgradePipeline::new(options, runtime);
        let completed = pipeline.run().await.into_result()?;
        let report = UpgradeReport::completed(&completed, started_at);
        emit_report(&report, self.json, self.report_file())
    }
}

#[derive(Serialize)]
struct UpgradeReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    org_id: String,
    primary_bucket_id: String,
    buckets_migrated: usize,
    users_migrated: usize,
    rolled_back: bool,
    warnings: Vec<String>,
    release_errors: Vec<String>,
    elapsed_ms: u64,
}

impl UpgradeReport {
    fn completed(upgrade: &CompletedUpgrade, started_at: Instant) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status: "completed",
            phase: "done",
            org_id: upgrade.org_id.to_string(),
            primary_bucket_id: upgrade.primary_bucket_id.to_string(),
            buckets_migrated: upgrade.bucket_count,
            users_migrated: upgrade.user_count,
            rolled_back: false,
            warnings: upgrade.warnings.clone(),
            release_errors: upgrade
                .release_errors
                .iter()
                .map(ToString::to_string)
                .collect(),
            elapsed_ms: elapsed_ms(started_at),
        }
    }
}

#[derive(Serialize)]
struct UpgradeErrorReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    rolled_back: bool,
    error: String,
    release_errors: Vec<String>,
    rollback_errors: Vec<String>,
    elapsed_ms: u64,
}

fn needs_confirmation(force: bool, interactive: bool) -> bool {
    !force && interactive
}

fn confirm_upgrade(options: &UpgradeOptions) -> Result<bool> {
    Confirm::new()
        .with_prompt(format!(
            "Upgrade '{}' into metadata store '{}' and engine '{}'?",
            options.source_dir.display(),
            options.bolt_path.display(),
            options.engine_path.display()
        ))
        .default(false)
        .interact()
        .wrap_err("Cannot read the confirmation answer")
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

fn build_error_report(error: &eyre::Report, started_at: Instant) -> UpgradeErrorReport {
    let failed = error.downcast_ref::<FailedUpgrade>();

    UpgradeErrorReport {
        schema_version: REPORT_SCHEMA_VERSION,
        status: "failed",
        phase: failed.map_or("startup", |failed| failed.phase.as_str()),
        rolled_back: failed.is_some_and(|failed| failed.rolled_back),
        error: format!("{error:#}"),
        release_errors: failed.map_or_else(Vec::new, |failed| rendered(&failed.release_errors)),
        rollback_errors: failed.map_or_else(Vec::new, |failed| rendered(&failed.rollback_errors)),
        elapsed_ms: elapsed_ms(started_at),
    }
}

fn rendered<E: ToString>(errors: &[E]) -> Vec<String> {
    errors.iter().map(ToString::to_string).collect()
}

#[derive(Debug, Clone, Copy)]
enum Console {
    Stdout,
    Stderr,
}

/// Echoes report lines to the console and appends them to `--report-file`.
/// The file and its parent directories are created on the first line.
struct ReportWriter<'a> {
    console: Console,
    path: Option<&'a Path>,
    file: Option<File>,
}

impl<'a> ReportWriter<'a> {
    fn new(console: Console, path: Option<&'a Path>) -> Self {
        Self {
            console,
            path,
            file: None,
        }
    }

    fn line(&mut self, line: &str) -> Result<()> {
        match self.console {
            Console::Stdout => println!("{line}"),
            Console::Stderr => eprintln!("{line}"),
        }
        let Some(path) = self.path else {
            return Ok(());
        };
        if self.file.is_none() {
            self.file = Some(open_report_file(path)?);
        }
        if let Some(file) = &mut self.file {
            writeln!(file, "{line}")
                .wrap_err_with(|| format!("Cannot write report file {}", path.display()))?;
        }
        Ok(())
    }
}

fn open_report_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Cannot create report directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("Cannot open report file {}", path.display()))
}

/// Reports a failed run. JSON goes to stdout so it can be piped; the human
/// line goes to stderr. Never fails: problems are printed instead.
pub fn emit_error_report(
    json: bool,
    started_at: Instant,
    error: &eyre::Report,
    report_file: Option<&Path>,
) {
    let (console, line) = if json {
        match serde_json::to_string(&build_error_report(error, started_at)) {
            Ok(encoded) => (Console::Stdout, encoded),
            Err(encode_error) => {
                eprintln!("Upgrade failed: {error:#}\nReport encoding failed: {encode_error}");
                return;
            }
        }
    } else {
        (
            Console::Stderr,
            format!("Upgrade failed after {}ms: {error:#}", elapsed_ms(started_at)),
        )
    };

    if let Err(write_error) = ReportWriter::new(console, report_file).line(&line) {
        eprintln!("Cannot write report file: {write_error:#}");
    }
}

fn emit_report(report: &UpgradeReport, json: bool, report_file: Option<&Path>) -> Result<()> {
    let mut writer = ReportWriter::new(Console::Stdout, report_file);
    if json {
        let encoded = serde_json::to_string(report).wrap_err("Cannot serialize upgrade report")?;
        return writer.line(&encoded);
    }

    writer.line(&format!(
        "Upgrade completed successfully in {}ms: {} bucket(s) and {} user(s) upgraded.",
        report.elapsed_ms, report.buckets_migrated, report.users_migrated
    ))?;
    for warning in report.warnings.iter().chain(&report.release_errors) {
        writer.line(&format!("Warning: {warning}"))?;
    }
    Ok(())
}
