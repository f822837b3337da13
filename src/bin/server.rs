use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use targetd::server;
use targetd::{DEFAULT_HOST, DEFAULT_PORT};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let addr = SocketAddr::new(cli.host, cli.port);

    let listener = server::bind_with_retry(addr).await?;
    info!("listening on {addr}");

    let grace_period = cli.grace_period_secs.map(Duration::from_secs);
    server::run(listener, shutdown_signal(), grace_period).await;

    Ok(())
}

/// Resolves once either Ctrl-C or, on unix, SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[derive(Debug, Parser)]
#[command(name = "targetd", version, author)]
/// A cluster-wide coordinator arbitrating READ/WRIT access to shared targets.
struct Cli {
    /// Address to bind the coordinator on.
    #[arg(long, default_value = DEFAULT_HOST)]
    host: IpAddr,
    /// Port to bind the coordinator on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// How long to wait for in-flight connections to drain on shutdown
    /// before forcing termination. Defaults to 30s if not given; pass 0
    /// to force-terminate as soon as clients have been notified.
    #[arg(long)]
    grace_period_secs: Option<u64>,
}
