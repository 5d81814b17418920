use std::path::PathBuf;

use clap::Parser;
use deaddrop_server::{AppState, DEFAULT_MAX_UPLOAD_BYTES, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "deaddrop-server")]
struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
    /// Directory drops are written to. Defaults to `<temp dir>/deaddrop`.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ServerArgs::parse();
    let storage_dir = args
        .storage_dir
        .unwrap_or_else(|| std::env::temp_dir().join("deaddrop"));
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(
        "deaddrop starting on {} (storage {})",
        args.bind_address,
        storage_dir.display()
    );
    let state = AppState::new(storage_dir).with_max_upload_bytes(args.max_upload_bytes);
    if let Err(err) = serve(listener, state).await {
        warn!("deaddrop server exited: {}", err);
    }
}
