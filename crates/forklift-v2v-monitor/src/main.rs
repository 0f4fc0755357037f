//! forklift-v2v-monitor - echo virt-v2v output and export disk progress

use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use forklift_common::telemetry::{init_telemetry, LogTarget, TelemetryConfig};
use forklift_v2v_monitor::{pump, router, SharedProgress};
use tracing::{error, info};

/// Reads virt-v2v output on stdin, echoes it to stdout, and serves progress
#[derive(Parser, Debug)]
#[command(name = "forklift-v2v-monitor", version, about, long_about = None)]
struct Cli {
    /// Port for the metrics endpoint
    #[arg(long, env = "V2V_MONITOR_PORT", default_value_t = 2112)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the echoed conversion log
    init_telemetry(TelemetryConfig {
        service_name: "forklift-v2v-monitor".to_string(),
        log_target: LogTarget::Stderr,
        ..Default::default()
    })
    .context("initializing telemetry")?;

    let progress = SharedProgress::default();
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving conversion progress");

    let app = router(progress.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "metrics server stopped");
        }
    });

    let lines = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        pump(stdin.lock(), stdout.lock(), &progress)
    })
    .await
    .context("reader task panicked")?
    .context("reading conversion output")?;

    info!(lines, "conversion output closed");
    Ok(())
}
