use anyhow::Context;
use clap::Parser;
use registry_core::cleanup::{CleanupConfig, CleanupLoop};
use registry_core::consensus::ConsensusHandle;
use registry_core::fsm::Fsm;
use registry_core::state::RegistryState;
use registry_server::http;
use registry_server::transport::{self, TcpTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Start a node of the replicated service registry.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// This node's id, used by peers to address it in consensus RPCs.
    #[arg(long)]
    id: String,

    /// Address the HTTP boundary (`/join`, `/heartbeat`, `/services`) listens on.
    #[arg(long)]
    bind_addr: SocketAddr,

    /// Address the consensus engine's peer transport listens on.
    #[arg(long)]
    consensus_addr: SocketAddr,

    /// HTTP address of an existing leader to join. Omit to bootstrap a new
    /// single-node cluster with this node as leader.
    #[arg(long)]
    leader_addr: Option<String>,

    /// Directory snapshots are persisted to and restored from on startup.
    #[arg(long)]
    data_dir: PathBuf,

    /// How often the cleanup loop scans for expired instances.
    #[arg(long, default_value_t = 10)]
    heartbeat_period_secs: u64,

    /// How long an instance may go without a heartbeat before it is
    /// proposed for removal.
    #[arg(long, default_value_t = 20)]
    heartbeat_threshold_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    info!(id = %cli.id, bind_addr = %cli.bind_addr, consensus_addr = %cli.consensus_addr, "starting registry node");

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("creating data_dir {:?}", cli.data_dir))?;

    let state = Arc::new(RegistryState::new());
    let snapshot_path = cli.data_dir.join("snapshot.json");
    let fsm = Arc::new(Fsm::new(state));
    if let Ok(bytes) = std::fs::read(&snapshot_path) {
        fsm.restore(&bytes).context("restoring snapshot from data_dir")?;
        info!(path = ?snapshot_path, "restored state from snapshot");
    }

    let peer_transport = Arc::new(TcpTransport::new());
    let consensus = Arc::new(ConsensusHandle::new(cli.id.clone(), peer_transport.clone(), fsm.clone()));

    let is_leader = cli.leader_addr.is_none();
    consensus.bootstrap(is_leader).await.context("bootstrapping consensus engine")?;

    let consensus_listener = TcpListener::bind(cli.consensus_addr)
        .await
        .with_context(|| format!("binding consensus listener on {}", cli.consensus_addr))?;
    tokio::spawn(transport::serve_consensus(consensus_listener, consensus.clone()));

    if let Some(leader_addr) = &cli.leader_addr {
        join_cluster(leader_addr, &cli.id, cli.consensus_addr).await?;
    }

    let cleanup = CleanupLoop::new(
        fsm.state().clone(),
        consensus.clone(),
        CleanupConfig {
            period: Duration::from_secs(cli.heartbeat_period_secs),
            threshold: Duration::from_secs(cli.heartbeat_threshold_secs),
        },
    );
    tokio::spawn(async move { cleanup.run().await });

    spawn_snapshot_writer(fsm.clone(), snapshot_path);

    let app_state = http::AppState { consensus, fsm, transport: peer_transport };
    let app = registry_server::router(app_state);

    let listener = TcpListener::bind(cli.bind_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", cli.bind_addr))?;
    info!(addr = %cli.bind_addr, "HTTP boundary listening");
    axum::serve(listener, app).await.context("HTTP server error")?;

    Ok(())
}

/// Post a join request to the leader, carrying this node's own consensus
/// address so the leader's transport can dial it back.
async fn join_cluster(leader_addr: &str, id: &str, consensus_addr: SocketAddr) -> anyhow::Result<()> {
    info!(leader_addr, "joining existing cluster");
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "id": id, "addr": consensus_addr.to_string() });
    let resp = client
        .post(format!("http://{leader_addr}/join"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("sending join request to {leader_addr}"))?;
    if !resp.status().is_success() {
        anyhow::bail!("leader rejected join request: {}", resp.status());
    }
    info!("join acknowledged by leader");
    Ok(())
}

/// Best-effort periodic snapshot to disk, so a restart picks up roughly
/// where this process left off. Not a substitute for the consensus log;
/// just bounds how much a crash loses.
fn spawn_snapshot_writer(fsm: Arc<Fsm>, path: PathBuf) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            match fsm.snapshot() {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&path, bytes) {
                        tracing::warn!(error = %e, "failed to persist snapshot");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to build snapshot"),
            }
        }
    });
}
