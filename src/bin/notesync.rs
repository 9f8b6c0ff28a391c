//! notesync: run one reconciliation pass between two note-store replicas.
//!
//! Usage:
//!   notesync --local-url http://127.0.0.1:6806 --local-token aaa \
//!            --remote-url https://peer.example:6806 --remote-token bbb
//!   notesync ... --snapshot-interval-mins 30    # checkpoint before syncing
//!   RUST_LOG=debug notesync ...                 # verbose engine tracing

use clap::Parser;
use notesync::sync::EngineConfig;
use notesync::{ReconciliationEngine, ReplicaConfig, SessionLog};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "notesync", about = "Reconcile two note-store replicas")]
struct Args {
    /// Address of the local replica's storage API
    #[arg(long, env = "NOTESYNC_LOCAL_URL")]
    local_url: String,

    /// Credential for the local replica
    #[arg(long, env = "NOTESYNC_LOCAL_TOKEN")]
    local_token: String,

    /// Display name for the local replica
    #[arg(long, default_value = "local")]
    local_name: String,

    /// Address of the remote replica's storage API
    #[arg(long, env = "NOTESYNC_REMOTE_URL")]
    remote_url: String,

    /// Credential for the remote replica
    #[arg(long, env = "NOTESYNC_REMOTE_TOKEN")]
    remote_token: String,

    /// Display name for the remote replica
    #[arg(long, default_value = "remote")]
    remote_name: String,

    /// Minimum minutes between content-history snapshots (0 disables them)
    #[arg(long, default_value_t = 0)]
    snapshot_interval_mins: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let local = ReplicaConfig {
        address: args.local_url,
        credential: args.local_token,
        display_name: args.local_name,
    };
    let remote = ReplicaConfig {
        address: args.remote_url,
        credential: args.remote_token,
        display_name: args.remote_name,
    };

    let config = EngineConfig {
        snapshot_interval: match args.snapshot_interval_mins {
            0 => None,
            mins => Some(Duration::from_secs(mins * 60)),
        },
    };
    let engine = ReconciliationEngine::new(config);
    let session = SessionLog::new();

    match engine.run_http(&local, &remote, &session).await {
        Ok(report) => {
            println!(
                "sync finished in {:.1}s: {}",
                report.elapsed.as_secs_f64(),
                report.summary()
            );
        }
        Err(e) => {
            eprintln!("sync failed: {}", e);
            std::process::exit(1);
        }
    }
}
