//! # Telemetry Collector
//!
//! Servidor central da frota: aceita conexões TCP dos dispositivos, atribui
//! IDs, envia comandos `start`/`stop` e avalia a telemetria recebida contra
//! os thresholds configurados.
//!
//! ## Uso
//! ```bash
//! telemetry_collector              # porta 12345
//! telemetry_collector -p 9000
//! ```

mod console;
mod events;
mod net_thread;
mod registry;
mod server;

use clap::Parser;
use server::Collector;
use std::path::PathBuf;
use telemetry_core::config::AppConfig;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(name = "telemetry_collector")]
#[command(about = "Telemetry fleet collector")]
struct Args {
    /// Porta TCP para escutar
    #[arg(short, long)]
    port: Option<u16>,

    /// Caminho do config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // ── Config ──
    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path);

    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    for error in config.validate() {
        warn!("Config: {error}");
    }
    if config.collector.thresholds.validate().is_err() {
        warn!("Thresholds do config inválidos, usando padrão");
        config.collector.thresholds = Default::default();
    }
    if let Some(port) = args.port {
        config.collector.port = port;
    }

    // ── Collector ──
    let (collector, events) = match Collector::spawn(&config.collector) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    std::thread::Builder::new()
        .name("console-events".into())
        .spawn(move || console::print_events(events))
        .expect("Falha ao criar thread de eventos");

    if let Err(e) = collector.start_server(config.collector.port) {
        error!("{e}");
        std::process::exit(1);
    }

    console::run(&collector, config.collector.port);
}
