//! Console do operador.
//!
//! Substitui o dashboard: imprime os eventos do Collector e traduz linhas
//! digitadas no stdin em chamadas do [`Collector`].

use crate::events::ServerEvent;
use crate::server::Collector;
use crossbeam_channel::Receiver;
use std::io::BufRead;
use telemetry_core::config::ThresholdConfig;
use telemetry_core::types::{ClientId, TelemetryMessage};

pub const HELP: &str = "\
Comandos:
  list                                lista clientes
  start <id>|all                      inicia envio de telemetria
  stop <id>|all                       para envio de telemetria
  thresholds                          mostra limites atuais
  set <latency|loss|cpu|memory> <v>   altera um limite
  server start [porta]|stop           liga/desliga o servidor
  quit                                sai";

/// Comando digitado pelo operador.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    List,
    Start(Target),
    Stop(Target),
    ShowThresholds,
    Set(Limit, f64),
    ServerStart(Option<u16>),
    ServerStop,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    One(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Latency,
    PacketLoss,
    Cpu,
    Memory,
}

impl Limit {
    /// Aplica o valor sobre uma cópia da configuração atual.
    pub fn apply(self, mut config: ThresholdConfig, value: f64) -> Result<ThresholdConfig, String> {
        match self {
            Limit::Latency => config.max_latency = value,
            Limit::PacketLoss => config.max_packet_loss = value,
            Limit::Cpu | Limit::Memory => {
                if value.fract() != 0.0 || !(0.0..=u32::MAX as f64).contains(&value) {
                    return Err(format!("valor inteiro esperado: {value}"));
                }
                if self == Limit::Cpu {
                    config.max_cpu = value as u32;
                } else {
                    config.max_memory = value as u32;
                }
            }
        }
        Ok(config)
    }
}

/// Interpreta uma linha do operador.
pub fn parse_command(line: &str) -> Result<OperatorCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();

    match words.as_slice() {
        ["list"] | ["ls"] => Ok(OperatorCommand::List),
        ["start", target] => parse_target(target).map(OperatorCommand::Start),
        ["stop", target] => parse_target(target).map(OperatorCommand::Stop),
        ["thresholds"] => Ok(OperatorCommand::ShowThresholds),
        ["set", limit, value] => {
            let limit = match *limit {
                "latency" => Limit::Latency,
                "loss" | "packet_loss" => Limit::PacketLoss,
                "cpu" => Limit::Cpu,
                "memory" | "mem" => Limit::Memory,
                other => return Err(format!("limite desconhecido: {other}")),
            };
            let value = value
                .parse::<f64>()
                .map_err(|_| format!("número inválido: {value}"))?;
            Ok(OperatorCommand::Set(limit, value))
        }
        ["server", "start"] => Ok(OperatorCommand::ServerStart(None)),
        ["server", "start", port] => port
            .parse()
            .map(|p| OperatorCommand::ServerStart(Some(p)))
            .map_err(|_| format!("porta inválida: {port}")),
        ["server", "stop"] => Ok(OperatorCommand::ServerStop),
        ["help"] | ["?"] => Ok(OperatorCommand::Help),
        ["quit"] | ["exit"] | ["q"] => Ok(OperatorCommand::Quit),
        [] => Err(String::new()),
        _ => Err(format!("comando desconhecido: {line}")),
    }
}

fn parse_target(word: &str) -> Result<Target, String> {
    if word == "all" {
        return Ok(Target::All);
    }
    word.parse()
        .map(Target::One)
        .map_err(|_| format!("ID inválido: {word}"))
}

/// Formata um evento para o terminal.
pub fn render(event: &ServerEvent) -> String {
    match event {
        ServerEvent::ClientConnected(r) => {
            format!("[+] Client {} ({}:{})", r.id, r.address, r.port)
        }
        ServerEvent::ClientDisconnected(id) => format!("[-] Client {id}"),
        ServerEvent::ClientStatusChanged { client_id, running } => {
            let status = if *running { "RUNNING" } else { "STOPPED" };
            format!("[*] Client {client_id}: {status}")
        }
        ServerEvent::DataReceived {
            client_id,
            payload,
            timestamp,
            ..
        } => {
            let time = timestamp.format("%H:%M:%S%.3f");
            match payload {
                TelemetryMessage::NetworkMetrics(m) => format!(
                    "{time} #{client_id} NetworkMetrics bw={:.1} lat={:.1}ms loss={:.2}%",
                    m.bandwidth, m.latency, m.packet_loss
                ),
                TelemetryMessage::DeviceStatus(s) => format!(
                    "{time} #{client_id} DeviceStatus up={}s cpu={}% mem={}%",
                    s.uptime, s.cpu_usage, s.memory_usage
                ),
                TelemetryMessage::Log(l) => {
                    format!("{time} #{client_id} Log [{}] {}", l.severity, l.message)
                }
            }
        }
        ServerEvent::Warning { client_id, text } => format!("⚠ WARNING [Client {client_id}]: {text}"),
        ServerEvent::Log(text) => format!("· {text}"),
        ServerEvent::ServerStarted => "== Servidor iniciado ==".into(),
        ServerEvent::ServerStopped => "== Servidor parado ==".into(),
    }
}

/// Imprime eventos até o canal fechar.
pub fn print_events(events: Receiver<ServerEvent>) {
    for event in events.iter() {
        println!("{}", render(&event));
    }
}

/// Lê comandos do stdin até `quit` ou EOF.
pub fn run(collector: &Collector, default_port: u16) {
    println!("{HELP}");
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) if e.is_empty() => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            OperatorCommand::List => {
                let clients = collector.clients();
                if clients.is_empty() {
                    println!("Nenhum cliente conectado");
                }
                for c in clients {
                    let status = if c.running { "RUNNING" } else { "STOPPED" };
                    println!("  #{:<4} {}:{:<6} {status}", c.id, c.address, c.port);
                }
            }
            OperatorCommand::Start(Target::All) => collector.start_all(),
            OperatorCommand::Start(Target::One(id)) => collector.start_client(id),
            OperatorCommand::Stop(Target::All) => collector.stop_all(),
            OperatorCommand::Stop(Target::One(id)) => collector.stop_client(id),
            OperatorCommand::ShowThresholds => {
                let t = collector.thresholds();
                println!(
                    "  latency ≤ {}ms | packet_loss ≤ {}% | cpu ≤ {}% | memory ≤ {}%",
                    t.max_latency, t.max_packet_loss, t.max_cpu, t.max_memory
                );
            }
            OperatorCommand::Set(limit, value) => {
                match limit.apply(collector.thresholds(), value) {
                    Ok(config) => {
                        if let Err(e) = collector.set_thresholds(config) {
                            println!("{e}");
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            OperatorCommand::ServerStart(port) => {
                if let Err(e) = collector.start_server(port.unwrap_or(default_port)) {
                    println!("{e}");
                }
            }
            OperatorCommand::ServerStop => collector.stop_server(),
            OperatorCommand::Help => println!("{HELP}"),
            OperatorCommand::Quit => break,
        }
    }
}
