use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{LevelFilter, error, info};

mod config;
mod connectivity;
mod hardware;
mod indicator;
mod manager;
mod messages;
mod mqtt;
mod network;
mod occupancy;
mod publisher;
mod report;
mod sampler;

/// Exit status asking the service supervisor for a restart.
const RESTART_EXIT_CODE: i32 = 3;

#[derive(Parser, Debug)]
#[command(version, about = "Parking space occupancy monitor")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the LED test at startup
    #[arg(long)]
    skip_led_test: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = config::AppConfig::load(&args.config)?;

    let client_id = mqtt::client_identity(&config.mqtt);
    println!("{}", report::render_banner(&client_id, &config.mqtt.host));

    let echoes: HashMap<u8, f32> = config
        .spaces
        .iter()
        .map(|pins| pins.echo)
        .zip(config.simulation().distances())
        .collect();
    let mut board = hardware::SimBoard::new(config.sensing().cm_per_us(), echoes);

    let connectivity = connectivity::Connectivity::new(
        network::HostNetwork::new(&config.mqtt.host, config.mqtt.port()),
        mqtt::MqttSession::new(&config.mqtt, &client_id),
        connectivity::Policy::from_config(&config),
        &client_id,
    );
    let publisher = publisher::Publisher::new(
        &client_id,
        config.mqtt.status_topic(),
        config.publish().interval(),
    );

    let mut core = manager::Manager::new(&mut board, &config, connectivity, publisher)
        .context("setting up sensor and indicator pins")?;

    if !args.skip_led_test {
        core.lamp_test().await;
    }

    info!("Starting control loop");
    let restart = core.run_loop().await;

    error!("{}; restarting in {:?}", restart, config.network().restart_delay());
    tokio::time::sleep(config.network().restart_delay()).await;
    std::process::exit(RESTART_EXIT_CODE);
}
