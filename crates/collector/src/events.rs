//! Notificações emitidas pelo Collector.
//!
//! Canal estritamente de saída: o núcleo nunca espera resposta de quem
//! consome os eventos. O envio usa um channel ilimitado e ignora
//! consumidores que já foram embora.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use telemetry_core::types::{ClientId, TelemetryMessage};
use tracing::{debug, info, warn};

/// Registro de um dispositivo conectado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: ClientId,
    pub address: String,
    pub port: u16,
    pub connected: bool,
    pub running: bool,
}

/// Evento publicado para a camada de apresentação.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientConnected(ClientRecord),
    ClientDisconnected(ClientId),
    ClientStatusChanged {
        client_id: ClientId,
        running: bool,
    },
    DataReceived {
        client_id: ClientId,
        kind: &'static str,
        payload: TelemetryMessage,
        timestamp: DateTime<Utc>,
    },
    Warning {
        client_id: ClientId,
        text: String,
    },
    Log(String),
    ServerStarted,
    ServerStopped,
}

/// Lado emissor do canal de eventos.
///
/// Cada evento também é espelhado no `tracing`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<ServerEvent>,
}

impl EventSink {
    pub fn new() -> (Self, Receiver<ServerEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.emit(ServerEvent::Log(text));
    }

    pub fn warning(&self, client_id: ClientId, text: impl Into<String>) {
        let text = text.into();
        warn!("WARNING [Client {client_id}]: {text}");
        self.emit(ServerEvent::Warning { client_id, text });
    }

    pub fn client_connected(&self, record: ClientRecord) {
        self.emit(ServerEvent::ClientConnected(record));
    }

    pub fn client_disconnected(&self, client_id: ClientId) {
        self.emit(ServerEvent::ClientDisconnected(client_id));
    }

    pub fn status_changed(&self, client_id: ClientId, running: bool) {
        self.emit(ServerEvent::ClientStatusChanged { client_id, running });
    }

    pub fn data_received(&self, client_id: ClientId, payload: TelemetryMessage) {
        debug!("← Client {client_id}: {}", payload.kind());
        self.emit(ServerEvent::DataReceived {
            client_id,
            kind: payload.kind(),
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn server_started(&self) {
        self.emit(ServerEvent::ServerStarted);
    }

    pub fn server_stopped(&self) {
        self.emit(ServerEvent::ServerStopped);
    }

    fn emit(&self, event: ServerEvent) {
        // Consumidor ausente não é erro
        let _ = self.tx.send(event);
    }
}
