//! Gerador de telemetria sintética.
//!
//! Substitui a coleta de sensores reais por valores aleatórios com
//! distribuições fixas. O RNG é injetável: com a mesma semente a sequência
//! de mensagens é idêntica.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use telemetry_core::types::*;

/// Modelos de mensagem de log.
pub const LOG_TEMPLATES: [&str; 10] = [
    "Interface eth0 restarted",
    "Connection established to gateway",
    "Packet buffer cleared",
    "Routing table updated",
    "DNS resolution completed",
    "Firewall rules reloaded",
    "Network interface configured",
    "DHCP lease renewed",
    "ARP cache flushed",
    "TCP connection timeout handled",
];

/// Alfabeto do sufixo aleatório dos logs.
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789 ";

/// Tamanho máximo do sufixo (inclusivo).
const MAX_SUFFIX_LEN: usize = 200;

/// Gerador de mensagens do dispositivo simulado.
pub struct TelemetryGenerator<R: Rng> {
    rng: R,
    /// Contador monotônico que define o tipo da próxima mensagem
    counter: u64,
    /// Uptime acumulado (s)
    uptime: u64,
}

impl TelemetryGenerator<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> TelemetryGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            counter: 0,
            uptime: 0,
        }
    }

    /// Próxima mensagem: NetworkMetrics → DeviceStatus → Log → …
    pub fn next_message(&mut self) -> TelemetryMessage {
        let slot = self.counter % 3;
        self.counter += 1;

        match slot {
            0 => TelemetryMessage::NetworkMetrics(self.network_metrics()),
            1 => TelemetryMessage::DeviceStatus(self.device_status()),
            _ => TelemetryMessage::Log(self.log_entry()),
        }
    }

    /// Atraso uniforme em `[min_ms, max_ms]` até o próximo envio.
    pub fn next_delay(&mut self, min_ms: u64, max_ms: u64) -> Duration {
        let (lo, hi) = if min_ms <= max_ms {
            (min_ms, max_ms)
        } else {
            (max_ms, min_ms)
        };
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }

    pub fn uptime(&self) -> u64 {
        self.uptime
    }

    fn network_metrics(&mut self) -> NetworkMetrics {
        NetworkMetrics {
            bandwidth: self.rng.gen_range(50.0..=150.0),
            latency: self.rng.gen_range(1.0..=200.0),
            packet_loss: self.rng.gen_range(0.0..=10.0),
        }
    }

    fn device_status(&mut self) -> DeviceStatus {
        self.uptime += self.rng.gen_range(1..60);
        DeviceStatus {
            uptime: self.uptime,
            cpu_usage: self.rng.gen_range(0..100),
            memory_usage: self.rng.gen_range(20..95),
        }
    }

    fn log_entry(&mut self) -> LogEntry {
        let template = LOG_TEMPLATES[self.rng.gen_range(0..LOG_TEMPLATES.len())];
        let severity = Severity::ALL[self.rng.gen_range(0..Severity::ALL.len())];
        let suffix = self.random_suffix();

        let message = if suffix.is_empty() {
            template.to_string()
        } else {
            format!("{template} - {suffix}")
        };

        LogEntry { message, severity }
    }

    fn random_suffix(&mut self) -> String {
        let len = self.rng.gen_range(0..=MAX_SUFFIX_LEN);
        (0..len)
            .map(|_| SUFFIX_CHARSET[self.rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
            .collect()
    }
}
