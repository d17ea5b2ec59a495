use clap::Parser;
use inverter_core::config::Config;
use inverter_core::coordinator::PollCoordinator;
use tracing_subscriber::EnvFilter;

/// Command-line overrides for the inverter polling daemon. Anything left
/// unset falls back to the corresponding environment variable.
#[derive(Parser, Debug)]
#[command(name = "inverter-poller")]
struct Args {
    #[arg(long)]
    inverter_ip: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    scan_interval: Option<u64>,

    /// Run a single poll cycle and print the resulting snapshot, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Some(inverter_ip) = &args.inverter_ip {
        std::env::set_var("INVERTER_IP", inverter_ip);
    }
    if let Some(model) = &args.model {
        std::env::set_var("INVERTER_MODEL", model);
    }
    if let Some(scan_interval) = args.scan_interval {
        std::env::set_var("SCAN_INTERVAL_SECS", scan_interval.to_string());
    }

    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        inverter_ip = %config.inverter_ip,
        model = config.model,
        scan_interval_secs = config.scan_interval_secs,
        "starting inverter poller"
    );

    let coordinator = PollCoordinator::spawn(
        config.inverter_ip,
        config.local_ip,
        config.local_port,
        config.model,
        config.scan_interval(),
    );
    let mut snapshots = coordinator.snapshots();

    if args.once {
        // The coordinator only ticks after scan_interval; wait out the
        // first cycle rather than reading the initial empty placeholder.
        snapshots.changed().await.map_err(|_| Error::CoordinatorClosed)?;
        let snapshot = snapshots.borrow().clone();
        println!("{snapshot:#?}");
        coordinator.shutdown().await;
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
            result = snapshots.changed() => {
                if result.is_err() {
                    tracing::warn!("poll coordinator shut down unexpectedly");
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                tracing::debug!(?snapshot, "published new snapshot");
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] inverter_core::config::ConfigError),
    #[error("poll coordinator shut down before producing a snapshot")]
    CoordinatorClosed,
}
