use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use apiary::config::Settings;
use apiary::persistence::InMemoryPersistence;
use apiary::state::AppState;
use apiary::server;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "apiary-server", version, author)]
/// Coordinator for a distributed work-dispatch fabric.
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the bind address from config.
    #[arg(long)]
    host: Option<String>,
    /// Override the bind port from config.
    #[arg(long)]
    port: Option<u16>,
}

/// Formats timestamps as `DD/MM/YYYY HH:MM:SS`.
struct DdMmYyyy;

impl FormatTime for DdMmYyyy {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%d/%m/%Y %H:%M:%S"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    let host = cli.host.unwrap_or(settings.global.connection.address.clone());
    let port = cli.port.unwrap_or(settings.global.connection.port);

    let stdout_level = if settings.server.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let stdout_layer = tracing_subscriber::fmt::layer().with_timer(DdMmYyyy).with_filter(stdout_level);

    let _file_guard;
    let file_layer = if settings.server.logging {
        let log_name = format!("server[{host}{port}].log");
        let file_appender = tracing_appender::rolling::never(".", &log_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _file_guard = Some(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(DdMmYyyy),
        )
    } else {
        _file_guard = None;
        None
    };

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).init();

    let bind_addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind tcp listener on {bind_addr}"))?;
    tracing::info!(%bind_addr, "apiary dispatch server listening");

    let persistence = Arc::new(InMemoryPersistence::new(Vec::<String>::new()));
    let app = Arc::new(AppState::new(persistence, Vec::new(), Vec::new()));

    server::run(listener, app, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
