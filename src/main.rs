use std::process::ExitCode;

use clap::Parser;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use volley::config::Config;
use volley::{ Report, Runner };

fn main() -> ExitCode {
    let config = Config::parse();

    tracing_subscriber
        ::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
        )
        .with_writer(std::io::stderr)
        .init();

    let job = match config.to_job() {
        Ok(job) => job,
        Err(err) => {
            eprintln!("{}\nUse --help for more info", err);
            return ExitCode::FAILURE;
        }
    };

    let mut runtime = Builder::new_multi_thread();
    if let Some(threads) = config.threads.filter(|&t| t > 0) {
        runtime.worker_threads(threads);
    }
    let runtime = match runtime.enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create tokio runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // Ctrl+C stops new requests, the report still covers everything that was sent
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %err, "could not install Ctrl+C handler");
    }

    let report = Report::new(config.output_format(), job.requests);
    let runner = Runner::new(job).with_progress(!config.no_progress);

    match runtime.block_on(runner.run(report, cancel)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
