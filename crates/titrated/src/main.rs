//! titrated entry point.
//!
//! Parses configuration, loads the datapath object, runs the controller
//! until SIGINT or SIGTERM and exits 0, or exits 1 on any fatal error.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use titrated::{Args, DaemonConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match DaemonConfig::resolve(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "titrated: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        policy = ?config.policy,
        interfaces = %config.interfaces.join(","),
        rate_kbps = config.rate,
        avg_samples = config.avg_samples,
        avg_sample_period_us = config.avg_sample_period,
        read_rate_ms = config.read_rate,
        "titrated: starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("titrated: exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "titrated: fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout carries only the CSV stream.
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .init();
}

#[cfg(target_os = "linux")]
async fn run(config: DaemonConfig) -> titrate_common::ShaperResult<()> {
    use std::fs::File;
    use std::io::{self, Write};

    use titrated::ebpf::{self, SystemResolver};
    use titrated::Controller;

    let sink: Box<dyn Write + Send> = match &config.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };

    let stop = termination()?;
    let (bridge, datapath) = ebpf::load(&config.bpf_object, config.policy)?;
    let controller = Controller::start(
        &config.controller_settings(),
        bridge,
        datapath,
        &SystemResolver,
        sink,
    )?;

    let report = controller.run_until(stop).await;
    info!(
        sampler_ticks = report.sampler.ticks,
        sampler_read_failures = report.sampler.read_failures,
        sampler_write_failures = report.sampler.write_failures,
        reporter_rows = report.reporter.rows_emitted,
        reporter_read_failures = report.reporter.read_failures,
        released = report.release.released,
        release_failures = report.release.failed,
        "titrated: shutdown complete"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: DaemonConfig) -> titrate_common::ShaperResult<()> {
    Err(titrate_common::ShaperError::load(
        "the XDP datapath is only available on Linux",
    ))
}

/// Installs the SIGINT and SIGTERM handlers and returns a future resolving
/// on the first of them.
///
/// One missing handler is logged; if neither can be installed the daemon
/// would have no way to stop cleanly, so that is an error.
#[cfg(target_os = "linux")]
fn termination() -> titrate_common::ShaperResult<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind, name: &'static str) -> std::io::Result<Signal> {
        signal(kind).inspect_err(|e| {
            tracing::warn!(error = %e, signal = name, "titrated: cannot install signal handler")
        })
    }

    async fn received(signal: &mut Option<Signal>) -> Option<()> {
        match signal {
            Some(signal) => signal.recv().await,
            None => std::future::pending().await,
        }
    }

    let (mut sigint, mut sigterm) = match (
        install(SignalKind::interrupt(), "SIGINT"),
        install(SignalKind::terminate(), "SIGTERM"),
    ) {
        (Err(e), Err(_)) => return Err(e.into()),
        (sigint, sigterm) => (sigint.ok(), sigterm.ok()),
    };

    Ok(async move {
        tokio::select! {
            Some(()) = received(&mut sigint) => info!("titrated: received SIGINT"),
            Some(()) = received(&mut sigterm) => info!("titrated: received SIGTERM"),
            else => tracing::warn!("titrated: signal streams closed"),
        }
    })
}
