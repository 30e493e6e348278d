use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Heartbeat an instance against a registry-server leader and serve a
/// trivial health endpoint on the instance's own port.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Cli {
    /// `host:port` HTTP address of the registry leader.
    #[arg(long)]
    leader: String,

    /// Logical service name this instance registers under.
    #[arg(long, default_value = "test-1")]
    service: String,

    /// Host this instance advertises to the registry.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port this instance advertises, and also listens on for its own
    /// health endpoint.
    #[arg(long)]
    port: u16,
}

#[derive(Serialize)]
struct HeartbeatRequest {
    service: String,
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let health_addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let health_app = Router::new().route("/", get(|| async { "OK" }));
    let listener = TcpListener::bind(health_addr).await?;
    info!(addr = %health_addr, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_app).await {
            warn!(error = %e, "health endpoint server stopped");
        }
    });

    heartbeat_loop(cli).await;
    Ok(())
}

async fn heartbeat_loop(cli: Cli) {
    let client = reqwest::Client::new();
    let body = HeartbeatRequest { service: cli.service.clone(), host: cli.host.clone(), port: cli.port };
    let url = format!("http://{}/heartbeat", cli.leader);

    loop {
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(service = %cli.service, host = %cli.host, port = cli.port, "heartbeat accepted");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "leader rejected heartbeat");
            }
            Err(e) => {
                warn!(error = %e, "failed to contact leader, retrying in 2 seconds");
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
