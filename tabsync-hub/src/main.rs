use std::net::SocketAddr;

use clap::Parser;
use tabsync_hub::{HubState, serve};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tabsync-hub")]
struct HubArgs {
    /// Tabs of every origin connect to `ws://<bind-address>/ws`.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: SocketAddr,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = HubArgs::parse();
    let listener = match TcpListener::bind(args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, %err, "cannot open hub socket");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = serve(listener, HubState::new()) => {
            if let Err(err) = result {
                error!(%err, "hub stopped");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("hub interrupted, dropping all tabs"),
    }
}
