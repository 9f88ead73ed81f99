//! Mote device binary.
//!
//! # Usage
//!
//! ```bash
//! # Register directly with a management server
//! mote-device --endpoint sensor-1 --server coap://leshan.example:5683
//!
//! # Let a bootstrap server provision the accounts
//! mote-device --endpoint sensor-1 --bootstrap coap://bs.example:5683
//! ```
//!
//! Ctrl-C de-registers from every server before exiting.

use std::{net::IpAddr, time::Duration};

use clap::Parser;
use mote_client::{
    Engine,
    runtime::{self, SystemEnv, UdpTransport},
};
use mote_core::{EngineConfig, MemoryStore, ServerAccount};
use mote_proto::Binding;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LwM2M device
#[derive(Parser, Debug)]
#[command(name = "mote-device")]
#[command(about = "LwM2M client device over CoAP/UDP")]
#[command(version)]
struct Args {
    /// Endpoint client name
    #[arg(short, long)]
    endpoint: String,

    /// Management server URI
    #[arg(short, long, required_unless_present = "bootstrap")]
    server: Option<String>,

    /// Short server id of the management server
    #[arg(long, default_value = "1")]
    short_id: u16,

    /// Registration lifetime in seconds
    #[arg(long, default_value = "300")]
    lifetime: u64,

    /// Binding mode (U, Q, UQ)
    #[arg(long, default_value = "U")]
    binding: String,

    /// Send notifications confirmable
    #[arg(long)]
    confirmable_notifications: bool,

    /// Bootstrap server URI
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Local address server sessions bind to (ephemeral ports)
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Device manufacturer (/3/0/0)
    #[arg(long, default_value = "mote")]
    manufacturer: String,

    /// Device model number (/3/0/1)
    #[arg(long, default_value = "mote-device")]
    model: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn accounts(&self) -> Result<Vec<ServerAccount>, Box<dyn std::error::Error>> {
        let binding =
            Binding::parse(&self.binding).ok_or_else(|| format!("invalid binding: {}", self.binding))?;

        let mut accounts = Vec::new();
        if let Some(uri) = &self.server {
            let mut account = ServerAccount::server(self.short_id, uri.clone())
                .with_lifetime(Duration::from_secs(self.lifetime))
                .with_binding(binding);
            if self.confirmable_notifications {
                account = account.with_confirmable_notifications();
            }
            accounts.push(account);
        }
        if let Some(uri) = &self.bootstrap {
            accounts.push(ServerAccount::bootstrap(uri.clone()));
        }
        Ok(accounts)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Mote device starting");

    let accounts = args.accounts()?;
    let transport = UdpTransport::new(args.bind)?;
    tracing::info!("Binding server sessions to {}", args.bind);

    let store = MemoryStore::with_device(&args.manufacturer, &args.model);
    let mut engine = Engine::new(SystemEnv::new(), transport, store, EngineConfig::default())?;
    engine.configure(args.endpoint.clone(), &accounts)?;

    runtime::run(&mut engine, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    })
    .await?;

    Ok(())
}
