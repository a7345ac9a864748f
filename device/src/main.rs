use anyhow::Result;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time;
use tracing_subscriber::EnvFilter;

use field_node::clock::SystemClock;
use field_node::commands::Command;
use field_node::config::Config;
use field_node::context::DeviceContext;
use field_node::net::HttpTransport;
use field_node::node::{Control, Node};
use field_node::records::RecordStore;
use field_node::simulate::SimulatedProvider;
use field_node::sleep::{HostPlatform, WakeLine};
use field_node::storage::SqliteStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> Result<Config> {
    if let Ok(config) = Config::load_from_file() {
        return Ok(config);
    }
    let config = Config::from_env()?;
    // Persist so a generated device id survives restarts.
    if let Err(e) = config.save_to_file() {
        log::warn!("Could not save config: {}", e);
    }
    Ok(config)
}

/// Reads remote commands from stdin. A bare `wake` line plays the wake
/// controller and pulses the wake line instead.
async fn read_commands(tx: mpsc::UnboundedSender<Command>, wake: WakeLine) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("wake") {
            wake.pulse();
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => {
                if tx.send(command).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config()?;
    log::info!("Node starting with config: {:?}", config);

    let store = SqliteStore::open(&config.store_path)?;
    let records = RecordStore::new(Box::new(store));
    log::info!("Opened non-volatile store at {}", config.store_path);

    let transport = HttpTransport::new(&config);
    let platform = HostPlatform::from_env();
    let provider = SimulatedProvider::new(config.measurement_failure_rate);
    let loop_interval = config.loop_interval();

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_commands(command_tx, platform.wake_line()));

    let ctx = DeviceContext::new(config, records, Box::new(SystemClock));
    let mut node = Node::new(ctx, transport, platform, provider);

    loop {
        while let Ok(command) = command_rx.try_recv() {
            if let Err(e) = node.handle_command(command).await {
                log::warn!("Command rejected: {}", e);
            }
        }

        match node.step().await? {
            Control::Continue => time::sleep(loop_interval).await,
            Control::Restart(action) => {
                log::warn!(
                    "Restarting ({:?}) from state {} (previously {})",
                    action,
                    node.state(),
                    node.previous_state()
                );
                // The process supervisor brings the node back up.
                std::process::exit(0);
            }
        }
    }
}
