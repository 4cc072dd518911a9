//! `roverlink` – rover-side telemetry/command bridge.
//!
//! 1. Loads `~/.roverlink/config.toml` and environment overrides.
//! 2. Connects the actuator/sensor bus: rosbridge when configured, otherwise
//!    an in-process loopback bus that logs every actuator command.
//! 3. Runs the bridge until Ctrl-C / SIGTERM, then shuts it down in order:
//!    timers, server socket, sensor bus.

mod config;

use colored::Colorize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use roverlink_middleware::{EventBus, RobotBus, RosbridgeBus, Subscription};
use roverlink_runtime::bridge::DEFAULT_COMMAND_TOPIC;
use roverlink_runtime::{RoverBridge, WsConnector, init_tracing};
use roverlink_types::BusMessage;

fn main() {
    // Held for the whole process; flushes spans on exit.
    let _tracing = init_tracing("roverlink");

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => {
            println!(
                "  Config: {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    println!("  Server:    {}", cfg.server_url.bold());
    println!("  Rover ID:  {}", cfg.rover_id.bold());
    println!(
        "  Bus:       {}",
        cfg.rosbridge_url
            .as_deref()
            .unwrap_or("in-process loopback")
            .bold()
    );
    println!();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("roverlink")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build Tokio runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(run(cfg));
}

async fn run(cfg: config::Config) {
    let (bus, _command_log) = connect_bus(&cfg).await;

    let handle = RoverBridge::new(cfg.to_bridge_config(), Arc::new(WsConnector), bus).start();

    wait_for_termination().await;

    println!();
    println!(
        "{}",
        "⚠  Termination requested – shutting down the bridge …"
            .yellow()
            .bold()
    );
    handle.stop().await;
    println!("{}", "  ✓ Bridge stopped.".green());
}

/// The bus the bridge talks to, plus the loopback command logger when the
/// in-process bus is used.
async fn connect_bus(cfg: &config::Config) -> (Option<Arc<dyn RobotBus>>, Option<Subscription>) {
    if let Some(url) = &cfg.rosbridge_url {
        return match RosbridgeBus::connect(url).await {
            Ok(bus) => (Some(Arc::new(bus) as Arc<dyn RobotBus>), None),
            Err(e) => {
                warn!(url = %url, error = %e, "rosbridge unavailable, running without actuator bus");
                println!(
                    "  {} rosbridge at {} is unreachable – commands will fail.",
                    "!".yellow().bold(),
                    url.dimmed()
                );
                (None, None)
            }
        };
    }

    let bus = Arc::new(EventBus::default());
    let log_command = Arc::new(|message: &BusMessage| {
        let text = message.data.get("data").and_then(|d| d.as_str()).unwrap_or("");
        info!(topic = %message.topic, command = %text, "actuator command (loopback)");
    });
    let subscription = match bus.subscribe(DEFAULT_COMMAND_TOPIC, "std_msgs/msg/String", log_command) {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            warn!(error = %e, "failed to attach loopback command logger");
            None
        }
    };
    (Some(bus as Arc<dyn RobotBus>), subscription)
}

/// Resolve on Ctrl-C or SIGTERM.
async fn wait_for_termination() {
    let (tx, mut rx) = watch::channel(false);
    match ctrlc::set_handler(move || {
        let _ = tx.send(true);
    }) {
        Ok(()) => {
            let _ = rx.wait_for(|stop| *stop).await;
        }
        Err(e) => {
            warn!(error = %e, "failed to install termination handler; falling back to Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"    ____                        __    _       __  "#.bold().cyan());
    println!("{}", r#"   / __ \____ _   _____  _____/ /   (_)___  / /__"#.bold().cyan());
    println!("{}", r#"  / /_/ / __ \ | / / _ \/ ___/ /   / / __ \/ //_/"#.bold().cyan());
    println!("{}", r#" / _, _/ /_/ / |/ /  __/ /  / /___/ / / / / ,<   "#.bold().cyan());
    println!("{}", r#"/_/ |_|\____/|___/\___/_/  /_____/_/_/ /_/_/|_|  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "RoverLink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Rover telemetry & command bridge");
    println!();
}
