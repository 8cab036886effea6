/*!
Uptime monitor maintenance daemon
*/

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uptime_monitor::core::{
    config::{Environment, ServiceConfig},
    maintenance::MaintenanceEvent,
    service::UptimeService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("Uptime Monitor")
        .version(clap::crate_version!())
        .about("Maintains the account, session and check records of the uptime monitor")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to a TOML configuration file")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .help("Directory holding the users, tokens and checks collections")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("env")
                .short('e')
                .long("env")
                .help("Environment preset used when no configuration file is given")
                .value_name("NAME")
                .default_value("staging"),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single maintenance pass and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ServiceConfig::from_file(path).await?,
        None => {
            let environment = matches
                .get_one::<String>("env")
                .map(|name| name.parse::<Environment>())
                .transpose()?
                .unwrap_or_default();
            ServiceConfig::for_environment(environment)
        }
    };

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.store.data_dir = PathBuf::from(data_dir);
    }

    let service = UptimeService::new(config).await?;
    let maintenance = service.maintenance();

    if matches.get_flag("once") {
        let report = maintenance.run_once().await?;
        info!("Maintenance finished: {:?}", report);
        return Ok(());
    }

    if !service.config().maintenance.enabled {
        warn!("Maintenance is disabled in the configuration, nothing to do");
        return Ok(());
    }

    info!(
        "🚀 Running maintenance every {}s",
        service.config().maintenance.interval_secs.max(1)
    );
    let mut events = Box::pin(maintenance.run());

    tokio::select! {
        _ = async {
            while let Some(event) = events.next().await {
                if let MaintenanceEvent::Failed(reason) = event {
                    error!("⚠️ Maintenance error: {}", reason);
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown");
        }
    }

    Ok(())
}
