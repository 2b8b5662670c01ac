//! # Telemetry Device
//!
//! Dispositivo simulado: conecta ao Collector via TCP, aguarda a
//! confirmação e o comando `start`, e então envia telemetria sintética
//! (métricas de rede, status e logs) em intervalos aleatórios. Reconecta
//! sozinho a cada 5 s enquanto o Collector estiver fora.
//!
//! ## Uso
//! ```bash
//! telemetry_device                         # localhost:12345
//! telemetry_device --host 10.0.0.5 -p 9000
//! telemetry_device --seed 42               # sequência determinística
//! ```

mod connection;
mod session;
mod telemetry;

use clap::Parser;
use connection::DeviceEvent;
use session::{Session, Timing};
use std::path::PathBuf;
use std::time::Duration;
use telemetry::TelemetryGenerator;
use telemetry_core::config::AppConfig;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "telemetry_device")]
#[command(about = "Simulated telemetry device")]
struct Args {
    /// Host do Collector
    #[arg(long)]
    host: Option<String>,

    /// Porta do Collector
    #[arg(short, long)]
    port: Option<u16>,

    /// Semente do gerador de telemetria
    #[arg(long)]
    seed: Option<u64>,

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

    // ── Carregar config ──
    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    for error in config.validate() {
        warn!("Config: {error}");
    }

    let mut device_cfg = config.device;
    if let Some(host) = args.host {
        device_cfg.host = host;
    }
    if let Some(port) = args.port {
        device_cfg.port = port;
    }
    if args.seed.is_some() {
        device_cfg.seed = args.seed;
    }

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   📡 TELEMETRY DEVICE – SIMULADOR");
    println!("══════════════════════════════════════════════");
    println!("  Collector: {}:{}", device_cfg.host, device_cfg.port);
    println!(
        "  Envio:     {}–{} ms",
        device_cfg.min_send_interval_ms, device_cfg.max_send_interval_ms
    );
    println!("  Reconexão: {} ms", device_cfg.reconnect_interval_ms);
    match device_cfg.seed {
        Some(seed) => println!("  Semente:   {seed}"),
        None => println!("  Semente:   entropia do sistema"),
    }
    println!("══════════════════════════════════════════════");
    println!();

    // ── Sessão ──
    let timing = Timing::from(&device_cfg);
    let connect_timeout = Duration::from_millis(device_cfg.connect_timeout_ms);
    let generator = match device_cfg.seed {
        Some(seed) => TelemetryGenerator::seeded(seed),
        None => TelemetryGenerator::from_entropy(),
    };
    let session = Session::new(device_cfg.host.clone(), device_cfg.port, timing, generator);

    let handle = match connection::spawn(session, connect_timeout) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Falha ao criar thread de conexão: {e}");
            std::process::exit(1);
        }
    };
    handle.connect(device_cfg.host, device_cfg.port);

    // ── Loop principal ──
    for event in handle.events().iter() {
        match event {
            DeviceEvent::StateChanged(state) => info!("Estado: {state}"),
            DeviceEvent::Confirmed(id) => info!("ID atribuído pelo collector: {id}"),
            DeviceEvent::Log(text) => warn!("{text}"),
        }
    }
}
