use clap::Parser;
use log::{error, info};
use matterbridge::config::{Cli, Settings};
use matterbridge::frontend::Frontend;
use matterbridge::instance_lock::InstanceLock;
use matterbridge::Matterbridge;
use tokio::signal;

fn init_logger(settings: &Settings) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.logger_level.to_filter().as_str()),
    )
    .format_timestamp_millis()
    .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli);
    init_logger(&settings);

    info!("Starting Matterbridge in {} mode", settings.mode);

    let _lock = match InstanceLock::acquire(settings.profile.as_deref()) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let frontend_port = settings.frontend_port;
    let bridge = match Matterbridge::initialize(settings) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Initialization failed: {e}");
            std::process::exit(1);
        }
    };

    // Platform factories ship as separate crates built against this
    // library; a bare binary still serves the control plane and virtual
    // devices.

    if frontend_port != 0 {
        if let Err(e) = Frontend::start(bridge.clone(), frontend_port).await {
            error!("Frontend failed to start: {e}");
            bridge.destroy().await;
            std::process::exit(1);
        }
    }

    if let Err(e) = bridge.startup().await {
        error!("Startup failed: {e}");
        bridge.destroy().await;
        std::process::exit(1);
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }

    bridge.destroy().await;
    info!("Matterbridge stopped");
}
