//! Máquina de estados da conexão do Device.
//!
//! Não faz I/O: recebe eventos (bytes, conexão, timers) e devolve [`Action`]s
//! para o driver executar. Os timers são deadlines single-shot guardadas
//! aqui; o driver só precisa dormir até [`Session::next_deadline`].
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─ok─▶ WaitingConfirmation ─confirm─▶ WaitingStart
//!                            │  ▲                                            │ start
//!                       erro └──┘ (retry 5 s)              Stopped ◀─stop─ Running
//! ```

use crate::telemetry::TelemetryGenerator;
use rand::Rng;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use telemetry_core::config::DeviceConfig;
use telemetry_core::protocol::{self, FrameDecoder};
use telemetry_core::types::{ClientId, Command, ControlMessage};
use tracing::{debug, error, info, warn};

/// Estado da conexão com o Collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    WaitingConfirmation,
    WaitingStart,
    Running,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::WaitingConfirmation => "WaitingConfirmation",
            ConnectionState::WaitingStart => "WaitingStart",
            ConnectionState::Running => "Running",
            ConnectionState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Efeito colateral pedido ao driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Abrir conexão TCP
    Connect { host: String, port: u16 },
    /// Escrever um frame completo
    Send(Vec<u8>),
    /// Fechar o transporte atual
    Close,
    /// Avisar o operador (comando desconhecido, frame descartado...)
    Log(String),
}

/// Intervalos usados pela sessão.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub reconnect_interval: Duration,
    pub min_send_ms: u64,
    pub max_send_ms: u64,
}

impl From<&DeviceConfig> for Timing {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            min_send_ms: config.min_send_interval_ms,
            max_send_ms: config.max_send_interval_ms,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::from(&DeviceConfig::default())
    }
}

/// Sessão do Device com o Collector.
pub struct Session<R: Rng> {
    state: ConnectionState,
    host: String,
    port: u16,
    client_id: Option<ClientId>,
    decoder: FrameDecoder,
    generator: TelemetryGenerator<R>,
    timing: Timing,
    send_at: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl<R: Rng> Session<R> {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timing: Timing,
        generator: TelemetryGenerator<R>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            host: host.into(),
            port,
            client_id: None,
            decoder: FrameDecoder::with_default_cap(),
            generator,
            timing,
            send_at: None,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// ID atribuído pelo Collector, se já confirmado.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn send_deadline(&self) -> Option<Instant> {
        self.send_at
    }

    /// Deadline mais próxima entre os timers armados.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.send_deadline(), self.reconnect_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Inicia (ou reinicia) a conexão com `host:port`.
    pub fn connect(&mut self, host: impl Into<String>, port: u16) -> Vec<Action> {
        self.host = host.into();
        self.port = port;

        let mut actions = Vec::new();
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            actions.push(Action::Close);
        }

        self.reconnect_at = None;
        self.send_at = None;
        self.client_id = None;
        self.decoder.clear();
        self.state = ConnectionState::Connecting;

        info!("Conectando a {}:{}...", self.host, self.port);
        actions.push(Action::Connect {
            host: self.host.clone(),
            port: self.port,
        });
        actions
    }

    /// Transporte conectado.
    pub fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!("Conexão concluída fora do estado Connecting ({}), ignorando", self.state);
            return;
        }
        self.reconnect_at = None;
        self.decoder.clear();
        self.state = ConnectionState::WaitingConfirmation;
        info!("Conectado ao collector, aguardando confirmação...");
    }

    /// Falha ao conectar: agenda nova tentativa e permanece em Connecting.
    pub fn on_connect_failed(&mut self, err: &io::Error, now: Instant) {
        if self.state != ConnectionState::Connecting {
            debug!("Falha de conexão ignorada no estado {}: {err}", self.state);
            return;
        }
        warn!(
            "Falha ao conectar em {}:{}: {err}. Tentando novamente em {}s...",
            self.host,
            self.port,
            self.timing.reconnect_interval.as_secs()
        );
        self.reconnect_at = Some(now + self.timing.reconnect_interval);
    }

    /// Bytes recebidos do Collector.
    pub fn on_bytes(&mut self, data: &[u8], now: Instant) -> Vec<Action> {
        let frames = match self.decoder.append(data) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Erro fatal de framing: {e}. Abortando conexão");
                return self.on_disconnected(now);
            }
        };

        frames
            .iter()
            .filter_map(|frame| self.handle_frame(frame, now))
            .map(Action::Log)
            .collect()
    }

    /// Queda do transporte (remota ou por erro). Agenda uma reconexão.
    pub fn on_disconnected(&mut self, now: Instant) -> Vec<Action> {
        self.send_at = None;
        self.client_id = None;
        self.decoder.clear();

        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }

        self.state = ConnectionState::Disconnected;
        self.reconnect_at = Some(now + self.timing.reconnect_interval);
        info!(
            "Desconectado do collector. Reconectando em {}s...",
            self.timing.reconnect_interval.as_secs()
        );
        vec![Action::Close]
    }

    /// Desconexão local explícita: não agenda reconexão.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.send_at = None;
        self.reconnect_at = None;
        self.client_id = None;
        self.decoder.clear();

        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        info!("Desconectado pelo operador");
        vec![Action::Close]
    }

    /// Dispara os timers vencidos em `now`.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            if matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Connecting
            ) {
                let host = self.host.clone();
                actions.extend(self.connect(host, self.port));
            }
        }

        if self.send_at.is_some_and(|at| at <= now) {
            self.send_at = None;
            if self.state == ConnectionState::Running {
                let message = self.generator.next_message();
                match protocol::encode(&message) {
                    Ok(frame) => {
                        debug!("→ {} ({} bytes)", message.kind(), frame.len());
                        actions.push(Action::Send(frame));
                    }
                    Err(e) => error!("Erro ao serializar {}: {e}", message.kind()),
                }
                self.schedule_send(now);
            }
        }

        actions
    }

    fn schedule_send(&mut self, now: Instant) {
        let delay = self
            .generator
            .next_delay(self.timing.min_send_ms, self.timing.max_send_ms);
        self.send_at = Some(now + delay);
    }

    /// Processa um frame; devolve o aviso para o operador, se houver.
    fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Option<String> {
        let message = match protocol::decode::<ControlMessage>(frame) {
            Ok(message) => message,
            Err(e) => return Some(format!("Mensagem do collector descartada: {e}")),
        };

        match message {
            ControlMessage::ConnectionConfirm { client_id, status } => {
                if self.state != ConnectionState::WaitingConfirmation {
                    return Some(format!(
                        "Confirmação inesperada no estado {}, ignorando",
                        self.state
                    ));
                }
                self.client_id = Some(client_id);
                self.state = ConnectionState::WaitingStart;
                info!("Conexão confirmada. Client ID: {client_id}, Status: {status}");
                None
            }
            ControlMessage::Command { command } => self.handle_command(command, now),
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) -> Option<String> {
        match command {
            Command::Start => match self.state {
                ConnectionState::WaitingStart | ConnectionState::Stopped => {
                    self.state = ConnectionState::Running;
                    info!("Comando START recebido, iniciando transmissão");
                    self.schedule_send(now);
                    None
                }
                ConnectionState::Running => {
                    debug!("START recebido já em Running");
                    None
                }
                other => Some(format!("START ignorado no estado {other}")),
            },
            Command::Stop => match self.state {
                ConnectionState::Running | ConnectionState::WaitingStart => {
                    self.send_at = None;
                    self.state = ConnectionState::Stopped;
                    info!("Comando STOP recebido, transmissão interrompida");
                    None
                }
                ConnectionState::Stopped => {
                    debug!("STOP recebido já em Stopped");
                    None
                }
                other => Some(format!("STOP ignorado no estado {other}")),
            },
            Command::Unknown(name) => Some(format!("Comando desconhecido: {name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use telemetry_core::types::TelemetryMessage;

    fn session() -> Session<StdRng> {
        Session::new(
            "localhost",
            12345,
            Timing::default(),
            TelemetryGenerator::seeded(7),
        )
    }

    fn line(message: &ControlMessage) -> Vec<u8> {
        protocol::encode(message).unwrap()
    }

    /// Leva a sessão até Running.
    fn running(now: Instant) -> Session<StdRng> {
        let mut s = session();
        s.connect("localhost", 12345);
        s.on_connected();
        s.on_bytes(&line(&ControlMessage::confirm(4)), now);
        s.on_bytes(&line(&ControlMessage::command(Command::Start)), now);
        s
    }

    #[test]
    fn handshake_reaches_running_then_stopped() {
        let now = Instant::now();
        let mut s = session();

        let actions = s.connect("10.0.0.1", 4000);
        assert_eq!(
            actions,
            vec![Action::Connect {
                host: "10.0.0.1".into(),
                port: 4000
            }]
        );
        assert_eq!(s.state(), ConnectionState::Connecting);

        s.on_connected();
        assert_eq!(s.state(), ConnectionState::WaitingConfirmation);

        s.on_bytes(&line(&ControlMessage::confirm(4)), now);
        assert_eq!(s.state(), ConnectionState::WaitingStart);
        assert_eq!(s.client_id(), Some(4));

        s.on_bytes(&line(&ControlMessage::command(Command::Start)), now);
        assert_eq!(s.state(), ConnectionState::Running);
        assert!(s.send_deadline().is_some());

        s.on_bytes(&line(&ControlMessage::command(Command::Stop)), now);
        assert_eq!(s.state(), ConnectionState::Stopped);
        assert_eq!(s.send_deadline(), None);
    }

    #[test]
    fn messages_split_across_reads() {
        let now = Instant::now();
        let mut s = session();
        s.connect("localhost", 12345);
        s.on_connected();

        let mut bytes = line(&ControlMessage::confirm(11));
        bytes.extend(line(&ControlMessage::command(Command::Start)));
        for b in bytes {
            s.on_bytes(&[b], now);
        }
        assert_eq!(s.state(), ConnectionState::Running);
        assert_eq!(s.client_id(), Some(11));
    }

    #[test]
    fn send_loop_cycles_and_rearms() {
        let start = Instant::now();
        let mut s = running(start);
        let mut kinds = Vec::new();

        for _ in 0..6 {
            let due = s.send_deadline().expect("timer de envio armado");
            let delay = due - start;
            assert!(delay >= Duration::from_millis(10));

            let actions = s.on_timer(due);
            assert_eq!(actions.len(), 1);
            let Action::Send(frame) = &actions[0] else {
                panic!("esperava Send, recebeu {actions:?}");
            };
            let msg: TelemetryMessage = protocol::decode(&frame[..frame.len() - 1]).unwrap();
            kinds.push(msg.kind());

            let next = s.send_deadline().unwrap();
            let gap = next - due;
            assert!(gap >= Duration::from_millis(10) && gap <= Duration::from_millis(100));
        }

        assert_eq!(
            kinds,
            vec!["NetworkMetrics", "DeviceStatus", "Log", "NetworkMetrics", "DeviceStatus", "Log"]
        );
    }

    #[test]
    fn timer_before_deadline_does_nothing() {
        let now = Instant::now();
        let mut s = running(now);
        assert!(s.on_timer(now).is_empty());
        assert!(s.send_deadline().is_some());
    }

    #[test]
    fn remote_disconnect_schedules_exactly_one_reconnect() {
        let now = Instant::now();
        let mut s = running(now);

        let actions = s.on_disconnected(now);
        assert_eq!(actions, vec![Action::Close]);
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.reconnect_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(s.send_deadline(), None);
        assert_eq!(s.client_id(), None);

        // Uma segunda notificação (erro + EOF) não arma outro timer
        let later = now + Duration::from_secs(1);
        assert!(s.on_disconnected(later).is_empty());
        assert_eq!(s.reconnect_deadline(), Some(now + Duration::from_secs(5)));

        // O timer dispara uma única reconexão para o mesmo host/porta
        assert!(s.on_timer(now + Duration::from_millis(4999)).is_empty());
        let actions = s.on_timer(now + Duration::from_secs(5));
        assert_eq!(
            actions,
            vec![Action::Connect {
                host: "localhost".into(),
                port: 12345
            }]
        );
        assert_eq!(s.reconnect_deadline(), None);
        assert_eq!(s.state(), ConnectionState::Connecting);
    }

    #[test]
    fn each_non_idle_state_reconnects_on_disconnect() {
        let now = Instant::now();
        let steps: [fn(&mut Session<StdRng>, Instant); 4] = [
            |s, _| {
                s.connect("localhost", 1);
            },
            |s, _| {
                s.connect("localhost", 1);
                s.on_connected();
            },
            |s, now| {
                s.connect("localhost", 1);
                s.on_connected();
                s.on_bytes(&line(&ControlMessage::confirm(1)), now);
            },
            |s, now| {
                s.connect("localhost", 1);
                s.on_connected();
                s.on_bytes(&line(&ControlMessage::confirm(1)), now);
                s.on_bytes(&line(&ControlMessage::command(Command::Start)), now);
                s.on_bytes(&line(&ControlMessage::command(Command::Stop)), now);
            },
        ];

        for step in steps {
            let mut s = session();
            step(&mut s, now);
            s.on_disconnected(now);
            assert_eq!(s.state(), ConnectionState::Disconnected);
            assert!(s.reconnect_deadline().is_some());
        }
    }

    #[test]
    fn connect_failure_retries_forever_at_fixed_interval() {
        let mut now = Instant::now();
        let mut s = session();
        s.connect("localhost", 12345);
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);

        for _ in 0..5 {
            s.on_connect_failed(&err, now);
            assert_eq!(s.state(), ConnectionState::Connecting);
            let due = s.reconnect_deadline().unwrap();
            assert_eq!(due - now, Duration::from_secs(5));

            now = due;
            let actions = s.on_timer(now);
            assert!(matches!(actions.as_slice(), [Action::Connect { .. }]));
        }

        s.on_connected();
        assert_eq!(s.reconnect_deadline(), None);
    }

    #[test]
    fn local_disconnect_does_not_reconnect() {
        let now = Instant::now();
        let mut s = running(now);
        assert_eq!(s.disconnect(), vec![Action::Close]);
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.next_deadline(), None);
        assert!(s.on_timer(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn unknown_command_changes_nothing() {
        let now = Instant::now();
        let mut s = running(now);
        let deadline = s.send_deadline();

        let pause = br#"{"type":"Command","command":"pause"}"#;
        let mut frame = pause.to_vec();
        frame.push(b'\n');
        let actions = s.on_bytes(&frame, now);
        assert_eq!(actions, vec![Action::Log("Comando desconhecido: pause".into())]);

        assert_eq!(s.state(), ConnectionState::Running);
        assert_eq!(s.send_deadline(), deadline);
        assert_eq!(s.client_id(), Some(4));
    }

    #[test]
    fn garbage_and_unknown_types_are_dropped() {
        let now = Instant::now();
        let mut s = session();
        s.connect("localhost", 12345);
        s.on_connected();

        let actions = s.on_bytes(b"{broken\n[1]\n{\"type\":\"Ping\"}\n", now);
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| matches!(a, Action::Log(_))));
        assert_eq!(s.state(), ConnectionState::WaitingConfirmation);

        assert!(s.on_bytes(&line(&ControlMessage::confirm(2)), now).is_empty());
        assert_eq!(s.state(), ConnectionState::WaitingStart);

        // Confirmação repetida é só avisada
        let actions = s.on_bytes(&line(&ControlMessage::confirm(9)), now);
        assert!(matches!(actions.as_slice(), [Action::Log(text)] if text.contains("inesperada")));
        assert_eq!(s.client_id(), Some(2));
    }

    #[test]
    fn framing_overflow_drops_connection() {
        let now = Instant::now();
        let mut s = running(now);
        let junk = vec![b'x'; 64 * 1024];

        let mut closed = false;
        for _ in 0..20 {
            if s.on_bytes(&junk, now) == vec![Action::Close] {
                closed = true;
                break;
            }
        }

        assert!(closed);
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(s.reconnect_deadline().is_some());
    }

    #[test]
    fn restart_after_stop() {
        let now = Instant::now();
        let mut s = running(now);
        s.on_bytes(&line(&ControlMessage::command(Command::Stop)), now);
        s.on_bytes(&line(&ControlMessage::command(Command::Start)), now);
        assert_eq!(s.state(), ConnectionState::Running);
        assert!(s.send_deadline().is_some());
    }

    #[test]
    fn reconnect_while_connected_closes_old_transport() {
        let now = Instant::now();
        let mut s = running(now);
        let actions = s.connect("otherhost", 9);
        assert_eq!(actions[0], Action::Close);
        assert!(matches!(&actions[1], Action::Connect { host, port: 9 } if host == "otherhost"));
    }
}
