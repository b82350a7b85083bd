//! `js8bridge` – JS8Call ↔ bus bridge daemon.
//!
//! This binary:
//!
//! 1. Loads `~/.js8bridge/config.toml` (or the path given as the first
//!    argument / `JS8BRIDGE_CONFIG`), writing the defaults on first run.
//! 2. Connects to the MQTT broker (or, with `bus_transport = "websocket"`,
//!    starts the in-process bus and its WebSocket gateway) and the JS8Call
//!    TCP link.
//! 3. Runs the bridge until **Ctrl-C**, then publishes the offline notice and
//!    exits.

mod config;

use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

use js8bridge_core::{Bridge, init_tracing};
use js8bridge_middleware::{BusGateway, EventBus, Js8Link, LinkConfig, MqttBus};
use js8bridge_types::BridgeError;

use config::BusTransport;

/// How long the offline notice gets to reach the broker on shutdown.
const BROKER_CLOSE_GRACE: Duration = Duration::from_secs(3);

fn main() {
    // Logging must be up before the runtime exists; the OTLP exporter is
    // synchronous.
    let _guard = init_tracing("js8bridge");

    print_banner();

    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load_or_init(&path) {
        Ok((cfg, created)) => {
            if created {
                println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
            } else {
                println!("  Config loaded from {}", path.display().to_string().bold());
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };
    print_summary(&cfg);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the bridge down …".yellow().bold());
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg, shutdown_rx)) {
        error!(error = %e, "bridge terminated");
        println!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Bridge stopped.".green());
}

async fn run(cfg: config::Config, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
    let radio = Arc::new(Js8Link::spawn(
        LinkConfig::new(cfg.js8call_addr()).with_reconnect_delay(cfg.reconnect_delay()),
    ));

    let result = match cfg.bus_transport {
        BusTransport::Mqtt => {
            let bus = Arc::new(MqttBus::spawn(cfg.mqtt_config()));
            let bridge = Bridge::new(cfg.bridge_config(), radio.clone(), bus.clone());
            let result = bridge.run(shutdown).await;
            bus.close(BROKER_CLOSE_GRACE).await;
            result
        }
        BusTransport::Websocket => {
            let bus = Arc::new(EventBus::default());
            let listener = BusGateway::bind(&cfg.bus_addr()).await?;
            let gateway = tokio::spawn(BusGateway::new(Arc::clone(&bus)).serve(listener));
            let bridge = Bridge::new(cfg.bridge_config(), radio.clone(), bus);
            let result = bridge.run(shutdown).await;
            gateway.abort();
            result
        }
    };

    radio.shutdown();
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"     _     ___  _         _     _"#.bold().cyan());
    println!("{}", r#"    (_)___( _ )| |__ _ __(_) __| | __ _  ___"#.bold().cyan());
    println!("{}", r#"    | / __/ _ \| '_ \ '__| |/ _` |/ _` |/ _ \"#.bold().cyan());
    println!("{}", r#"    | \__ \ (_) | |_) | |  | | (_| | (_| |  __/"#.bold().cyan());
    println!("{}", r#"   _/ |___/\___/|_.__/|_|  |_|\__,_|\__, |\___|"#.bold().cyan());
    println!("{}", r#"  |__/                              |___/"#.bold().cyan());
    println!();
    println!("  {} {}",
        "js8bridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  JS8Call ↔ publish/subscribe bridge");
    println!();
}

fn print_summary(cfg: &config::Config) {
    println!("  JS8Call API   {}", cfg.js8call_addr().bold());
    match cfg.bus_transport {
        BusTransport::Mqtt => {
            println!("  MQTT broker   {}", format!("mqtt://{}", cfg.broker_addr()).bold());
        }
        BusTransport::Websocket => {
            println!("  Bus gateway   {}", format!("ws://{}", cfg.bus_addr()).bold());
        }
    }
    println!("  Topic prefix  {}", cfg.topic_prefix.bold());
    println!(
        "  TX delay      {}",
        format!("{}s", cfg.tx_delay_secs).dimmed()
    );
    println!();
}
