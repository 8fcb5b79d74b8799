use std::time::Instant;

use clap::Parser;
use tsdb_upgrade::{
    cli::{Options, emit_error_report},
    initializers::init_tracing,
    runtime::Runtime,
};

#[tokio::main]
async fn main() {
    let started_at = Instant::now();
    let opts = Options::parse();

    let guard = match init_tracing(opts.log_level, opts.log_path.as_deref()) {
        Ok(guard) => guard,
        Err(error) => {
            emit_error_report(opts.json, started_at, &error, opts.report_file());
            std::process::exit(1);
        }
    };

    let result = match Runtime::global() {
        Ok(runtime) => opts.run(runtime, started_at).await,
        Err(error) => Err(error.into()),
    };

    if let Err(error) = result {
        emit_error_report(opts.json, started_at, &error, opts.report_file());
        drop(guard);
        std::process::exit(1);
    }
}
