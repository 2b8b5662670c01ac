//! Definição das mensagens trocadas entre Device e Collector.
//!
//! Todas as mensagens são objetos JSON com um campo `"type"` que identifica
//! a variante. As enums usam `#[serde(tag = "type")]` para que o formato em
//! disco seja exatamente o do protocolo.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identificador atribuído pelo Collector a cada conexão aceita.
///
/// Começa em 1, cresce monotonicamente e nunca é reutilizado enquanto o
/// processo estiver vivo.
pub type ClientId = u64;

/// Mensagem que conhece o conjunto de tags `"type"` que sabe decodificar.
///
/// Permite ao codec separar um tipo desconhecido (ignorado com log) de um
/// tipo conhecido com campos inválidos.
pub trait WireMessage: serde::de::DeserializeOwned {
    const KNOWN_TYPES: &'static [&'static str];
}

// ──────────────────────────────────────────────
// Device → Collector
// ──────────────────────────────────────────────

/// Métricas de rede simuladas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkMetrics {
    /// Banda disponível (Mbps)
    pub bandwidth: f64,
    /// Latência (ms)
    pub latency: f64,
    /// Perda de pacotes (%)
    pub packet_loss: f64,
}

/// Estado geral do dispositivo.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    /// Uptime acumulado (s)
    pub uptime: u64,
    /// Uso de CPU (0–100%)
    pub cpu_usage: u32,
    /// Uso de memória (0–100%)
    pub memory_usage: u32,
}

/// Severidade de uma linha de log do dispositivo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Debug,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linha de log emitida pelo dispositivo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub message: String,
    pub severity: Severity,
}

/// Telemetria enviada pelo Device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TelemetryMessage {
    NetworkMetrics(NetworkMetrics),
    DeviceStatus(DeviceStatus),
    Log(LogEntry),
}

impl TelemetryMessage {
    /// Tag `"type"` usada no fio.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryMessage::NetworkMetrics(_) => "NetworkMetrics",
            TelemetryMessage::DeviceStatus(_) => "DeviceStatus",
            TelemetryMessage::Log(_) => "Log",
        }
    }
}

impl WireMessage for TelemetryMessage {
    const KNOWN_TYPES: &'static [&'static str] = &["NetworkMetrics", "DeviceStatus", "Log"];
}

// ──────────────────────────────────────────────
// Collector → Device
// ──────────────────────────────────────────────

/// Comando de controle enviado pelo Collector.
///
/// Serializado como string simples. Valores desconhecidos (ex.: `"pause"`)
/// são preservados em [`Command::Unknown`] para serem reportados pelo nome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Start,
    Stop,
    Unknown(String),
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => Command::Start,
            "stop" => Command::Stop,
            _ => Command::Unknown(value),
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        match command {
            Command::Start => "start".into(),
            Command::Stop => "stop".into(),
            Command::Unknown(other) => other,
        }
    }
}

/// Mensagens de controle do Collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    ConnectionConfirm { client_id: ClientId, status: String },
    Command { command: Command },
}

impl ControlMessage {
    pub fn confirm(client_id: ClientId) -> Self {
        ControlMessage::ConnectionConfirm {
            client_id,
            status: "connected".into(),
        }
    }

    pub fn command(command: Command) -> Self {
        ControlMessage::Command { command }
    }
}

impl WireMessage for ControlMessage {
    const KNOWN_TYPES: &'static [&'static str] = &["ConnectionConfirm", "Command"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_uses_type_tag() {
        let msg = TelemetryMessage::DeviceStatus(DeviceStatus {
            uptime: 42,
            cpu_usage: 12,
            memory_usage: 55,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"DeviceStatus","uptime":42,"cpu_usage":12,"memory_usage":55}"#
        );
    }

    #[test]
    fn severity_is_uppercase_on_the_wire() {
        let msg = TelemetryMessage::Log(LogEntry {
            message: "ARP cache flushed".into(),
            severity: Severity::Warning,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""severity":"WARNING""#), "{json}");
    }

    #[test]
    fn control_messages_match_protocol() {
        let confirm = serde_json::to_string(&ControlMessage::confirm(7)).unwrap();
        assert_eq!(
            confirm,
            r#"{"type":"ConnectionConfirm","client_id":7,"status":"connected"}"#
        );

        let stop = serde_json::to_string(&ControlMessage::command(Command::Stop)).unwrap();
        assert_eq!(stop, r#"{"type":"Command","command":"stop"}"#);
    }

    #[test]
    fn unknown_command_is_preserved() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"Command","command":"pause"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlMessage::Command {
                command: Command::Unknown("pause".into())
            }
        );
    }
}
