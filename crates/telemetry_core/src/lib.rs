//! # Telemetry Core
//!
//! Crate compartilhada entre Device e Collector: mensagens do protocolo,
//! framing JSON delimitado por newline, thresholds de alerta e configuração
//! TOML.
//!
//! ## Módulos
//! - [`types`] – Mensagens de telemetria e de controle
//! - [`protocol`] – Framing sobre stream + encode/decode JSON
//! - [`config`] – Configuração unificada via TOML e thresholds compartilhados
//! - [`alerts`] – Avaliação de thresholds

pub mod types;
pub mod protocol;
pub mod config;
pub mod alerts;

// Re-exports convenientes
pub use types::{ClientId, Command, ControlMessage, TelemetryMessage};
pub use protocol::{FrameDecoder, FramingError, ProtocolError, decode, encode};
pub use config::{AppConfig, CollectorConfig, DeviceConfig, SharedThresholds, ThresholdConfig};
