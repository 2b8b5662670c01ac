//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável alimenta Device e Collector.
//! Os limites de alerta ([`ThresholdConfig`]) também podem ser trocados em
//! tempo de execução através de [`SharedThresholds`].

use crate::protocol::MAX_FRAME_BYTES;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Porta TCP padrão do Collector.
pub const DEFAULT_PORT: u16 = 12345;

/// Limite superior aceito para `max_latency` (ms).
pub const LATENCY_LIMIT_MS: f64 = 10_000.0;

/// Erro de validação de configuração.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} fora do intervalo permitido: {value} ({min}–{max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

// ──────────────────────────────────────────────
// Thresholds
// ──────────────────────────────────────────────

/// Limites de alerta avaliados contra cada telemetria recebida.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Latência máxima (ms)
    pub max_latency: f64,
    /// Perda de pacotes máxima (%)
    pub max_packet_loss: f64,
    /// Uso de CPU máximo (%)
    #[serde(rename = "max_cpu_usage")]
    pub max_cpu: u32,
    /// Uso de memória máximo (%)
    #[serde(rename = "max_memory_usage")]
    pub max_memory: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_latency: 100.0,
            max_packet_loss: 5.0,
            max_cpu: 90,
            max_memory: 90,
        }
    }
}

impl ThresholdConfig {
    /// Rejeita valores fora dos intervalos aceitos pelo operador.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_latency", self.max_latency, 0.0, LATENCY_LIMIT_MS)?;
        check_range("max_packet_loss", self.max_packet_loss, 0.0, 100.0)?;
        check_range("max_cpu_usage", self.max_cpu as f64, 0.0, 100.0)?;
        check_range("max_memory_usage", self.max_memory as f64, 0.0, 100.0)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    // NaN falha as duas comparações e cai no erro
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Célula compartilhada de thresholds.
///
/// Leituras copiam o valor inteiro sob o lock, escritas trocam o valor
/// inteiro: um leitor nunca vê uma atualização pela metade.
#[derive(Debug, Clone, Default)]
pub struct SharedThresholds {
    inner: Arc<RwLock<ThresholdConfig>>,
}

impl SharedThresholds {
    /// Cria a célula. Falha se o valor inicial for inválido.
    pub fn new(initial: ThresholdConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(initial)),
        })
    }

    pub fn snapshot(&self) -> ThresholdConfig {
        *self.inner.read()
    }

    /// Valida e substitui a configuração.
    pub fn set(&self, config: ThresholdConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write() = config;
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Seções do config.toml
// ──────────────────────────────────────────────

/// Configuração do Device simulado.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host do Collector
    pub host: String,
    /// Porta TCP do Collector
    pub port: u16,
    /// Intervalo fixo entre tentativas de reconexão (ms)
    pub reconnect_interval_ms: u64,
    /// Intervalo mínimo entre envios (ms)
    pub min_send_interval_ms: u64,
    /// Intervalo máximo entre envios (ms)
    pub max_send_interval_ms: u64,
    /// Timeout de cada tentativa de conexão (ms)
    pub connect_timeout_ms: u64,
    /// Semente do gerador (None = entropia do sistema)
    pub seed: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            reconnect_interval_ms: 5000,
            min_send_interval_ms: 10,
            max_send_interval_ms: 100,
            connect_timeout_ms: 3000,
            seed: None,
        }
    }
}

/// Configuração do Collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Porta TCP para escutar
    pub port: u16,
    /// Limite do buffer de recepção por conexão (bytes)
    pub max_frame_bytes: usize,
    /// Timeout de escrita por conexão (ms)
    pub write_timeout_ms: u64,
    /// Thresholds de alerta iniciais
    pub thresholds: ThresholdConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_frame_bytes: MAX_FRAME_BYTES,
            write_timeout_ms: 1000,
            thresholds: ThresholdConfig::default(),
        }
    }
}

/// Configuração raiz do aplicativo (unifica device e collector).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub collector: CollectorConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.device.port == 0 {
            errors.push("Porta do device não pode ser 0".into());
        }
        if self.device.host.trim().is_empty() {
            errors.push("Host do device não pode ser vazio".into());
        }
        if self.device.min_send_interval_ms > self.device.max_send_interval_ms {
            errors.push(format!(
                "Intervalo de envio inválido: {}–{} ms",
                self.device.min_send_interval_ms, self.device.max_send_interval_ms
            ));
        }
        if self.device.reconnect_interval_ms == 0 {
            errors.push("Intervalo de reconexão não pode ser 0".into());
        }
        if self.collector.max_frame_bytes == 0 {
            errors.push("Limite do buffer de recepção não pode ser 0".into());
        }
        if let Err(e) = self.collector.thresholds.validate() {
            errors.push(e.to_string());
        }

        errors
    }
}
