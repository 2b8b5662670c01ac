//! Protocolo de comunicação sobre stream TCP.
//!
//! Cada mensagem é um objeto JSON compacto, em uma única linha, terminado
//! por um byte delimitador:
//!
//! ```text
//! ┌──────────────────────────┬──────┐
//! │ JSON compacto (N bytes)  │ '\n' │
//! └──────────────────────────┴──────┘
//! ```
//!
//! Não há prefixo de tamanho. O [`FrameDecoder`] acumula bytes entre
//! leituras parciais e nunca retém mais que o limite configurado.

use crate::types::WireMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Byte que termina cada frame.
pub const DELIMITER: u8 = b'\n';

/// Tamanho máximo de um frame pendente (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Erros locais a um frame. A conexão continua.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON inválido: {0}")]
    Json(#[source] serde_json::Error),

    #[error("Payload não é um objeto JSON")]
    NotAnObject,

    #[error("Campo \"type\" ausente ou não textual")]
    MissingType,

    #[error("Tipo de mensagem desconhecido: {0}")]
    UnknownType(String),

    /// Tipo conhecido com campos ausentes ou inválidos. `fields` guarda o
    /// objeto recebido para quem quiser aproveitar os campos válidos.
    #[error("Campos inválidos para {kind}: {source}")]
    Schema {
        kind: String,
        #[source]
        source: serde_json::Error,
        fields: Map<String, Value>,
    },

    #[error("Erro de serialização: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Erro fatal de framing: a conexão deve ser abortada.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Buffer de recepção excedeu {cap} bytes ({attempted} sem delimitador)")]
    Overflow { cap: usize, attempted: usize },
}

/// Acumulador de bytes por conexão.
///
/// Guarda no máximo um frame parcial, sempre com `pending_len() <= cap`.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    cap: usize,
}

impl FrameDecoder {
    pub fn new(cap: usize) -> Self {
        Self {
            pending: Vec::new(),
            cap,
        }
    }

    pub fn with_default_cap() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }

    /// Alimenta bytes crus do stream e devolve os frames completos.
    ///
    /// Frames vazios (delimitadores consecutivos) são descartados. Em caso de
    /// overflow o buffer é limpo e nenhum frame desta chamada é devolvido.
    pub fn append(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        let mut frames = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|&b| b == DELIMITER) {
            let (body, tail) = rest.split_at(pos);
            let size = self.pending.len() + body.len();
            if size > self.cap {
                return Err(self.overflow(size));
            }

            let mut frame = std::mem::take(&mut self.pending);
            frame.extend_from_slice(body);
            if !frame.is_empty() {
                frames.push(frame);
            }
            rest = &tail[1..];
        }

        let size = self.pending.len() + rest.len();
        if size > self.cap {
            return Err(self.overflow(size));
        }
        self.pending.extend_from_slice(rest);

        Ok(frames)
    }

    /// Bytes de frame parcial retidos.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn overflow(&mut self, attempted: usize) -> FramingError {
        self.pending.clear();
        FramingError::Overflow {
            cap: self.cap,
            attempted,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_default_cap()
    }
}

/// Serializa uma mensagem em JSON compacto + delimitador.
///
/// O buffer retornado deve ser escrito de uma só vez.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = serde_json::to_vec(message).map_err(ProtocolError::Serialize)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Decodifica um frame (sem o delimitador) numa mensagem tipada.
pub fn decode<T: WireMessage>(frame: &[u8]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_slice(frame).map_err(ProtocolError::Json)?;

    let kind = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        },
        _ => return Err(ProtocolError::NotAnObject),
    };

    if !T::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    match T::deserialize(&value) {
        Ok(message) => Ok(message),
        Err(source) => {
            let fields = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Err(ProtocolError::Schema {
                kind,
                source,
                fields,
            })
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
