//! binderd binary entry point.

use binder_dns::zookeeper::ZkDirectory;
use binder_dns::{telemetry, Config, DnsServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// DNS frontend for a ZooKeeper service directory.
#[derive(Parser, Debug)]
#[command(name = "binderd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "binder.toml")]
    config: PathBuf,

    /// Port to listen on, overriding `dns.listen_addr`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("BINDER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    if let Some(port) = args.port {
        config.dns.listen_addr.set_port(port);
    }
    config.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry, args.verbose).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        directory = %config.directory.connect_string(),
        "Starting binderd"
    );

    // Setup graceful shutdown
    let (stop_tx, shutdown) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    tokio::spawn({
        let stop_tx = stop_tx.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received interrupt, shutting down");
            stop_tx.send_replace(true);
        }
    });

    // Connect to the directory
    let (directory, events) = ZkDirectory::new(config.directory.connect_string());
    let session = tokio::spawn(directory.clone().run(shutdown.clone()));

    // Run DNS server
    let server = DnsServer::new(config);
    let result = server
        .run_with_directory(Arc::new(directory), events, shutdown)
        .await;

    // Release the directory session
    stop_tx.send_replace(true);
    match session.await {
        Ok(Err(e)) => error!("Directory session error: {}", e),
        Err(e) => error!("Directory session task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if let Err(e) = result {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("binderd shutdown complete");
    Ok(())
}
