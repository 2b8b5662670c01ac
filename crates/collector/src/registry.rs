//! Registro das conexões ativas do Collector.
//!
//! Indexado pelo [`ClientId`], que já é uma chave estável da conexão: não há
//! mapa reverso. Registro, buffer de recepção e transporte de cada cliente
//! vivem juntos no mesmo [`Slot`] e são criados e destruídos juntos.
//!
//! Só a thread dona do Collector mexe aqui; quem está de fora passa pela
//! fila de requisições de [`crate::server::Collector`].

use crate::events::{ClientRecord, EventSink};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use telemetry_core::alerts;
use telemetry_core::config::SharedThresholds;
use telemetry_core::protocol::{self, FrameDecoder, ProtocolError};
use telemetry_core::types::{ClientId, Command, ControlMessage, TelemetryMessage};
use tracing::debug;

/// Lado de escrita de uma conexão.
pub trait Link {
    /// Escreve um frame inteiro.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Derruba a conexão imediatamente.
    fn abort(&mut self);
}

impl Link for TcpStream {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)
    }

    fn abort(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

struct Slot<L> {
    record: ClientRecord,
    link: L,
    decoder: FrameDecoder,
}

/// Conexões ativas e seus registros.
pub struct Registry<L: Link> {
    clients: BTreeMap<ClientId, Slot<L>>,
    next_id: ClientId,
    max_frame_bytes: usize,
    events: EventSink,
}

impl<L: Link> Registry<L> {
    pub fn new(events: EventSink, max_frame_bytes: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            next_id: 1,
            max_frame_bytes,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Fotografia dos registros, em ordem de ID.
    pub fn records(&self) -> Vec<ClientRecord> {
        self.clients.values().map(|slot| slot.record.clone()).collect()
    }

    /// Registra uma conexão nova e envia a confirmação com o ID atribuído.
    pub fn accept(&mut self, link: L, peer: SocketAddr) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;

        let record = ClientRecord {
            id,
            address: peer.ip().to_string(),
            port: peer.port(),
            connected: true,
            running: false,
        };
        self.clients.insert(
            id,
            Slot {
                record: record.clone(),
                link,
                decoder: FrameDecoder::new(self.max_frame_bytes),
            },
        );

        self.events.client_connected(record);
        self.events
            .log(format!("Client {id} conectado de {}:{}", peer.ip(), peer.port()));

        self.send(id, &ControlMessage::confirm(id));
        id
    }

    /// Processa bytes recebidos de um cliente.
    pub fn ingest(&mut self, id: ClientId, data: &[u8], thresholds: &SharedThresholds) {
        let Some(slot) = self.clients.get_mut(&id) else {
            debug!("Dados de client {id} já removido, descartando");
            return;
        };

        let frames = match slot.decoder.append(data) {
            Ok(frames) => frames,
            Err(e) => {
                self.events
                    .log(format!("Client {id}: {e}, desconectando"));
                self.teardown(id);
                return;
            }
        };

        for frame in frames {
            self.process_frame(id, &frame, thresholds);
        }
    }

    /// O transporte do cliente fechou (EOF ou erro de leitura).
    pub fn disconnected(&mut self, id: ClientId, err: Option<io::Error>) {
        if !self.clients.contains_key(&id) {
            debug!("Fechamento de client {id} já removido");
            return;
        }
        if let Some(e) = err {
            self.events.log(format!("Client {id}: erro de socket: {e}"));
        }
        self.teardown(id);
    }

    pub fn start(&mut self, id: ClientId) {
        self.set_running(id, true);
    }

    pub fn stop(&mut self, id: ClientId) {
        self.set_running(id, false);
    }

    /// Inicia todos os clientes conectados que estão parados.
    pub fn start_all(&mut self) {
        let ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|slot| slot.record.connected && !slot.record.running)
            .map(|slot| slot.record.id)
            .collect();
        for id in ids {
            self.start(id);
        }
    }

    /// Para todos os clientes em execução.
    pub fn stop_all(&mut self) {
        let ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|slot| slot.record.running)
            .map(|slot| slot.record.id)
            .collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// Aborta todas as conexões e esvazia o registro.
    pub fn shutdown(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
    }

    fn set_running(&mut self, id: ClientId, running: bool) {
        let Some(slot) = self.clients.get_mut(&id) else {
            self.events.log(format!("Client {id} não encontrado"));
            return;
        };
        slot.record.running = running;

        let command = if running { Command::Start } else { Command::Stop };
        if self.send(id, &ControlMessage::command(command)) {
            self.events.status_changed(id, running);
            let verb = if running { "iniciado" } else { "parado" };
            self.events.log(format!("Client {id} {verb}"));
        }
    }

    fn process_frame(&mut self, id: ClientId, frame: &[u8], thresholds: &SharedThresholds) {
        let message = match protocol::decode::<TelemetryMessage>(frame) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                self.events
                    .log(format!("Client {id}: tipo de mensagem desconhecido: {kind}"));
                return;
            }
            Err(ProtocolError::Schema {
                kind,
                source,
                fields,
            }) => {
                // Frame incompleto: os campos numéricos presentes ainda contam
                self.events
                    .log(format!("Client {id}: {kind} incompleto ({source})"));
                let config = thresholds.snapshot();
                for alert in alerts::evaluate_fields(id, &kind, &fields, &config) {
                    self.events.warning(alert.client_id, alert.to_string());
                }
                return;
            }
            Err(e) => {
                self.events.log(format!("Client {id}: {e}"));
                return;
            }
        };

        let config = thresholds.snapshot();
        let warnings = alerts::evaluate(id, &message, &config);

        self.events.data_received(id, message);
        for alert in warnings {
            self.events.warning(alert.client_id, alert.to_string());
        }
    }

    /// Envia uma mensagem; em falha de escrita derruba só esta conexão.
    fn send(&mut self, id: ClientId, message: &ControlMessage) -> bool {
        let frame = match protocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                self.events.log(format!("Client {id}: {e}"));
                return false;
            }
        };

        let Some(slot) = self.clients.get_mut(&id) else {
            return false;
        };
        match slot.link.send(&frame) {
            Ok(()) => true,
            Err(e) => {
                self.events
                    .log(format!("Client {id}: erro de escrita: {e}"));
                self.teardown(id);
                false
            }
        }
    }

    fn teardown(&mut self, id: ClientId) {
        if let Some(mut slot) = self.clients.remove(&id) {
            slot.link.abort();
            self.events.client_disconnected(id);
            self.events.log(format!("Client {id} desconectado"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use crossbeam_channel::Receiver;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use telemetry_core::config::ThresholdConfig;
    use telemetry_core::types::{DeviceStatus, NetworkMetrics};

    /// Transporte falso que grava os frames enviados.
    #[derive(Clone, Default)]
    struct MockLink {
        sent: Rc<RefCell<Vec<ControlMessage>>>,
        aborted: Rc<RefCell<bool>>,
        broken: Rc<Cell<bool>>,
    }

    impl Link for MockLink {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            if self.broken.get() {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            assert_eq!(frame.last(), Some(&b'\n'));
            let message = protocol::decode(&frame[..frame.len() - 1]).unwrap();
            self.sent.borrow_mut().push(message);
            Ok(())
        }

        fn abort(&mut self) {
            *self.aborted.borrow_mut() = true;
        }
    }

    fn peer() -> SocketAddr {
        "192.168.0.10:50000".parse().unwrap()
    }

    fn registry() -> (Registry<MockLink>, Receiver<ServerEvent>) {
        let (sink, rx) = EventSink::new();
        (Registry::new(sink, 1024), rx)
    }

    fn line(message: &TelemetryMessage) -> Vec<u8> {
        protocol::encode(message).unwrap()
    }

    fn logs(rx: &Receiver<ServerEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|e| match e {
                ServerEvent::Log(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ids_are_unique_and_never_reused() {
        let (mut reg, _rx) = registry();
        let ids: Vec<ClientId> = (0..5).map(|_| reg.accept(MockLink::default(), peer())).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        reg.disconnected(3, None);
        assert!(!reg.contains(3));

        let next = reg.accept(MockLink::default(), peer());
        assert_eq!(next, 6);
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn accept_sends_confirmation_first() {
        let (mut reg, rx) = registry();
        let link = MockLink::default();
        let id = reg.accept(link.clone(), peer());

        assert_eq!(*link.sent.borrow(), vec![ControlMessage::confirm(id)]);

        let record = reg.records().into_iter().find(|r| r.id == id).unwrap();
        assert_eq!(record.address, "192.168.0.10");
        assert_eq!(record.port, 50000);
        assert!(record.connected && !record.running);

        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::ClientConnected(r)) if r.id == id
        ));
    }

    #[test]
    fn start_then_stop_is_dispatched_in_order() {
        let (mut reg, rx) = registry();
        let link = MockLink::default();
        let id = reg.accept(link.clone(), peer());

        reg.start(id);
        reg.stop(id);

        assert!(!reg.records()[0].running);
        assert_eq!(
            *link.sent.borrow(),
            vec![
                ControlMessage::confirm(id),
                ControlMessage::command(Command::Start),
                ControlMessage::command(Command::Stop),
            ]
        );

        let changes: Vec<bool> = rx
            .try_iter()
            .filter_map(|e| match e {
                ServerEvent::ClientStatusChanged { running, .. } => Some(running),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![true, false]);
    }

    #[test]
    fn unknown_id_is_reported_not_fatal() {
        let (mut reg, rx) = registry();
        reg.start(42);
        reg.stop(42);
        let logs = logs(&rx);
        assert_eq!(logs.len(), 2);
        assert!(logs[0].contains("42"));
        assert!(reg.is_empty());
    }

    #[test]
    fn start_all_and_stop_all_use_current_flags() {
        let (mut reg, _rx) = registry();
        let links: Vec<MockLink> = (0..3).map(|_| MockLink::default()).collect();
        for link in &links {
            reg.accept(link.clone(), peer());
        }
        reg.start(2);

        reg.start_all();
        assert!(reg.records().iter().all(|r| r.running));
        // Client 2 já estava rodando e não recebe outro start
        assert_eq!(links[1].sent.borrow().len(), 2);
        assert_eq!(links[0].sent.borrow().len(), 2);

        reg.stop(1);
        reg.stop_all();
        assert!(reg.records().iter().all(|r| !r.running));
        assert_eq!(links[0].sent.borrow().len(), 3);
        assert_eq!(links[2].sent.borrow().len(), 3);
    }

    #[test]
    fn telemetry_is_published_with_warnings() {
        let (mut reg, rx) = registry();
        let id = reg.accept(MockLink::default(), peer());
        let thresholds = SharedThresholds::new(ThresholdConfig {
            max_latency: 100.0,
            ..Default::default()
        })
        .unwrap();
        rx.try_iter().for_each(drop);

        let hot = TelemetryMessage::NetworkMetrics(NetworkMetrics {
            bandwidth: 80.0,
            latency: 150.0,
            packet_loss: 9.0,
        });
        let mut bytes = line(&hot);
        bytes.extend(line(&TelemetryMessage::DeviceStatus(DeviceStatus {
            uptime: 5,
            cpu_usage: 10,
            memory_usage: 30,
        })));

        let (first, second) = bytes.split_at(20);
        reg.ingest(id, first, &thresholds);
        reg.ingest(id, second, &thresholds);

        let events: Vec<ServerEvent> = rx.try_iter().collect();
        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::DataReceived { kind, client_id, .. } if *client_id == id => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["NetworkMetrics", "DeviceStatus"]);

        let warnings: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Warning { client_id, text } if *client_id == id => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("latency"));
        assert!(warnings[1].contains("packet loss"));
    }

    #[test]
    fn threshold_changes_apply_to_next_message() {
        let (mut reg, rx) = registry();
        let id = reg.accept(MockLink::default(), peer());
        let thresholds = SharedThresholds::default();
        let status = line(&TelemetryMessage::DeviceStatus(DeviceStatus {
            uptime: 1,
            cpu_usage: 80,
            memory_usage: 20,
        }));

        reg.ingest(id, &status, &thresholds);
        thresholds
            .set(ThresholdConfig {
                max_cpu: 50,
                ..Default::default()
            })
            .unwrap();
        reg.ingest(id, &status, &thresholds);

        let warnings = rx
            .try_iter()
            .filter(|e| matches!(e, ServerEvent::Warning { .. }))
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn malformed_and_unknown_frames_keep_connection() {
        let (mut reg, rx) = registry();
        let id = reg.accept(MockLink::default(), peer());
        rx.try_iter().for_each(drop);

        reg.ingest(
            id,
            b"{oops\n\"text\"\n{\"type\":\"Heartbeat\"}\n",
            &SharedThresholds::default(),
        );
        assert!(reg.contains(id));

        let logs = logs(&rx);
        assert_eq!(logs.len(), 3);
        assert!(logs[2].contains("Heartbeat"));
    }

    #[test]
    fn overflow_aborts_only_that_client() {
        let (mut reg, rx) = registry();
        let victim = MockLink::default();
        let a = reg.accept(victim.clone(), peer());
        let b = reg.accept(MockLink::default(), peer());

        reg.ingest(a, &vec![b'z'; 2048], &SharedThresholds::default());

        assert!(!reg.contains(a));
        assert!(reg.contains(b));
        assert!(*victim.aborted.borrow());
        assert!(
            rx.try_iter()
                .any(|e| e == ServerEvent::ClientDisconnected(a))
        );
    }

    #[test]
    fn write_failure_tears_down_connection() {
        let (mut reg, rx) = registry();
        let broken = MockLink::default();
        broken.broken.set(true);
        let id = reg.accept(broken, peer());

        assert!(!reg.contains(id));
        let events: Vec<ServerEvent> = rx.try_iter().collect();
        assert!(events.contains(&ServerEvent::ClientDisconnected(id)));
    }

    #[test]
    fn late_events_for_removed_client_are_ignored() {
        let (mut reg, _rx) = registry();
        let id = reg.accept(MockLink::default(), peer());
        reg.disconnected(id, None);
        reg.disconnected(id, None);
        reg.ingest(id, b"{}\n", &SharedThresholds::default());
        assert!(reg.is_empty());
    }

    #[test]
    fn shutdown_aborts_everything() {
        let (mut reg, rx) = registry();
        let links: Vec<MockLink> = (0..3).map(|_| MockLink::default()).collect();
        for link in &links {
            reg.accept(link.clone(), peer());
        }
        reg.shutdown();

        assert!(reg.is_empty());
        assert!(links.iter().all(|l| *l.aborted.borrow()));
        let gone = rx
            .try_iter()
            .filter(|e| matches!(e, ServerEvent::ClientDisconnected(_)))
            .count();
        assert_eq!(gone, 3);
    }

    #[test]
    fn incomplete_frames_still_raise_warnings() {
        let (mut reg, rx) = registry();
        let id = reg.accept(MockLink::default(), peer());
        let thresholds = SharedThresholds::default();
        rx.try_iter().for_each(drop);

        reg.ingest(id, b"{\"type\":\"DeviceStatus\",\"cpu_usage\":99}\n", &thresholds);
        reg.ingest(
            id,
            b"{\"type\":\"NetworkMetrics\",\"latency\":150.0,\"packet_loss\":\"n/a\"}\n",
            &thresholds,
        );

        let events: Vec<ServerEvent> = rx.try_iter().collect();
        let warnings: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Warning { client_id, text } if *client_id == id => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec!["High CPU usage: 99%", "High latency: 150ms"]);

        let incomplete = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Log(t) if t.contains("incompleto")))
            .count();
        assert_eq!(incomplete, 2);
        assert!(reg.contains(id));
    }

    #[test]
    fn failed_peer_is_dropped_once_during_start_all() {
        let (mut reg, _rx) = registry();
        let links: Vec<MockLink> = (0..3).map(|_| MockLink::default()).collect();
        let ids: Vec<ClientId> = links.iter().map(|l| reg.accept(l.clone(), peer())).collect();

        links[1].broken.set(true);
        reg.start_all();

        let remaining: Vec<ClientId> = reg.records().iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
        assert!(*links[1].aborted.borrow());
        for i in [0, 2] {
            assert_eq!(
                links[i].sent.borrow().last(),
                Some(&ControlMessage::command(Command::Start))
            );
        }

        // A rodada seguinte já não passa pelo peer derrubado
        reg.stop_all();
        assert_eq!(links[1].sent.borrow().len(), 1);
        assert_eq!(
            links[2].sent.borrow().last(),
            Some(&ControlMessage::command(Command::Stop))
        );
    }
}
