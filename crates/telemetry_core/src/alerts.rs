//! Avaliação de thresholds sobre a telemetria recebida.
//!
//! Função pura: não guarda estado e não interfere no controle das conexões,
//! apenas devolve os alertas para serem logados.

use crate::config::ThresholdConfig;
use crate::types::{ClientId, TelemetryMessage};
use serde_json::{Map, Value};
use std::fmt;

/// Métrica que ultrapassou o limite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Latency,
    PacketLoss,
    CpuUsage,
    MemoryUsage,
}

impl Metric {
    fn label(self) -> &'static str {
        match self {
            Metric::Latency => "High latency",
            Metric::PacketLoss => "High packet loss",
            Metric::CpuUsage => "High CPU usage",
            Metric::MemoryUsage => "High memory usage",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Metric::Latency => "ms",
            _ => "%",
        }
    }
}

/// Um alerta disparado para uma conexão.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub client_id: ClientId,
    pub metric: Metric,
    pub value: f64,
    pub limit: f64,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}", self.metric.label(), self.value, self.metric.unit())
    }
}

/// Avalia uma mensagem contra os thresholds e retorna os alertas.
///
/// Cada regra é independente; uma mensagem pode gerar mais de um alerta.
pub fn evaluate(
    client_id: ClientId,
    message: &TelemetryMessage,
    thresholds: &ThresholdConfig,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    match message {
        TelemetryMessage::NetworkMetrics(m) => {
            check(&mut alerts, client_id, Metric::Latency, m.latency, thresholds.max_latency);
            check(
                &mut alerts,
                client_id,
                Metric::PacketLoss,
                m.packet_loss,
                thresholds.max_packet_loss,
            );
        }
        TelemetryMessage::DeviceStatus(s) => {
            check(
                &mut alerts,
                client_id,
                Metric::CpuUsage,
                s.cpu_usage as f64,
                thresholds.max_cpu as f64,
            );
            check(
                &mut alerts,
                client_id,
                Metric::MemoryUsage,
                s.memory_usage as f64,
                thresholds.max_memory as f64,
            );
        }
        TelemetryMessage::Log(_) => {}
    }

    alerts
}

/// Avalia os campos de um frame que não passou na validação de tipos.
///
/// Só as métricas presentes e numéricas são comparadas; campos ausentes ou
/// de outro tipo são ignorados.
pub fn evaluate_fields(
    client_id: ClientId,
    kind: &str,
    fields: &Map<String, Value>,
    thresholds: &ThresholdConfig,
) -> Vec<Alert> {
    let rules = match kind {
        "NetworkMetrics" => vec![
            ("latency", Metric::Latency, thresholds.max_latency),
            ("packet_loss", Metric::PacketLoss, thresholds.max_packet_loss),
        ],
        "DeviceStatus" => vec![
            ("cpu_usage", Metric::CpuUsage, thresholds.max_cpu as f64),
            ("memory_usage", Metric::MemoryUsage, thresholds.max_memory as f64),
        ],
        _ => Vec::new(),
    };

    let mut alerts = Vec::new();
    for (field, metric, limit) in rules {
        if let Some(value) = fields.get(field).and_then(Value::as_f64) {
            check(&mut alerts, client_id, metric, value, limit);
        }
    }
    alerts
}

fn check(alerts: &mut Vec<Alert>, client_id: ClientId, metric: Metric, value: f64, limit: f64) {
    if value > limit {
        alerts.push(Alert {
            client_id,
            metric,
            value,
            limit,
        });
    }
}
