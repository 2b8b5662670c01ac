//! Thread dona do Collector e o handle usado pela camada de apresentação.
//!
//! Toda mutação do registro (accept, desconexão, start/stop, dados
//! recebidos) acontece numa única thread, em ordem de chegada. Chamadas de
//! fora viram [`Request`]s numa fila; os thresholds são a única coisa
//! compartilhada, via [`SharedThresholds`].

use crate::events::{ClientRecord, EventSink, ServerEvent};
use crate::net_thread::{self, Acceptor, NetEvent};
use crate::registry::Registry;
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use telemetry_core::config::{CollectorConfig, ConfigError, SharedThresholds, ThresholdConfig};
use telemetry_core::types::ClientId;
use tracing::{debug, error, info};

/// Erros do Collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Falha ao iniciar servidor na porta {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Falha ao criar thread do collector: {0}")]
    Spawn(#[source] io::Error),

    #[error("Thread do collector indisponível")]
    OwnerGone,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Requisições enfileiradas para a thread dona.
enum Request {
    StartServer {
        port: u16,
        reply: Sender<Result<SocketAddr, CollectorError>>,
    },
    StopServer,
    StartClient(ClientId),
    StopClient(ClientId),
    StartAll,
    StopAll,
    ListClients(Sender<Vec<ClientRecord>>),
    Shutdown,
}

/// Handle do Collector.
///
/// Não toca no estado do registro: só enfileira requisições. Ao ser
/// descartado encerra a thread dona e derruba todas as conexões.
pub struct Collector {
    requests: Sender<Request>,
    thresholds: SharedThresholds,
    sink: EventSink,
    owner: Option<JoinHandle<()>>,
}

impl Collector {
    /// Cria o Collector e devolve o stream de eventos.
    pub fn spawn(config: &CollectorConfig) -> Result<(Self, Receiver<ServerEvent>), CollectorError> {
        let thresholds = SharedThresholds::new(config.thresholds)?;
        let (sink, events) = EventSink::new();
        let (req_tx, req_rx) = unbounded();
        let (accept_tx, accept_rx) = unbounded();
        let (read_tx, read_rx) = bounded(net_thread::READ_QUEUE);

        let owner = Owner {
            registry: Registry::new(sink.clone(), config.max_frame_bytes),
            acceptor: None,
            accept_tx,
            accept_rx,
            read_tx,
            read_rx,
            sink: sink.clone(),
            thresholds: thresholds.clone(),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        };

        let thread = std::thread::Builder::new()
            .name("collector".into())
            .spawn(move || owner.run(req_rx))
            .map_err(CollectorError::Spawn)?;

        let collector = Self {
            requests: req_tx,
            thresholds,
            sink,
            owner: Some(thread),
        };
        Ok((collector, events))
    }

    /// Começa a escutar em `port`. Retorna o endereço efetivo.
    pub fn start_server(&self, port: u16) -> Result<SocketAddr, CollectorError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(Request::StartServer {
                port,
                reply: reply_tx,
            })
            .map_err(|_| CollectorError::OwnerGone)?;
        reply_rx.recv().map_err(|_| CollectorError::OwnerGone)?
    }

    pub fn stop_server(&self) {
        self.request(Request::StopServer);
    }

    pub fn start_client(&self, id: ClientId) {
        self.request(Request::StartClient(id));
    }

    pub fn stop_client(&self, id: ClientId) {
        self.request(Request::StopClient(id));
    }

    pub fn start_all(&self) {
        self.request(Request::StartAll);
    }

    pub fn stop_all(&self) {
        self.request(Request::StopAll);
    }

    /// Fotografia dos clientes registrados, em ordem de ID.
    pub fn clients(&self) -> Vec<ClientRecord> {
        let (reply_tx, reply_rx) = bounded(1);
        self.request(Request::ListClients(reply_tx));
        reply_rx.recv().unwrap_or_default()
    }

    /// Valida e aplica novos thresholds.
    pub fn set_thresholds(&self, config: ThresholdConfig) -> Result<(), ConfigError> {
        match self.thresholds.set(config) {
            Ok(()) => {
                self.sink.log(format!(
                    "Thresholds atualizados: latency={}ms, packet_loss={}%, cpu={}%, memory={}%",
                    config.max_latency, config.max_packet_loss, config.max_cpu, config.max_memory
                ));
                Ok(())
            }
            Err(e) => {
                self.sink.log(format!("Thresholds rejeitados: {e}"));
                Err(e)
            }
        }
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        self.thresholds.snapshot()
    }

    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            error!("Thread do collector indisponível");
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(thread) = self.owner.take() {
            if thread.join().is_err() {
                error!("Thread do collector terminou com panic");
            }
        }
    }
}

/// Estado da thread dona.
struct Owner {
    registry: Registry<TcpStream>,
    acceptor: Option<Acceptor>,
    accept_tx: Sender<NetEvent>,
    accept_rx: Receiver<NetEvent>,
    /// Limitado: segura os readers enquanto esta thread está ocupada
    read_tx: Sender<NetEvent>,
    read_rx: Receiver<NetEvent>,
    sink: EventSink,
    thresholds: SharedThresholds,
    write_timeout: Duration,
}

impl Owner {
    fn run(mut self, requests: Receiver<Request>) {
        let accept_rx = self.accept_rx.clone();
        let read_rx = self.read_rx.clone();

        loop {
            select! {
                recv(requests) -> request => match request {
                    Ok(Request::Shutdown) | Err(_) => {
                        self.stop_server();
                        debug!("Thread do collector encerrada");
                        return;
                    }
                    Ok(request) => self.handle(request),
                },
                recv(accept_rx) -> event => {
                    if let Ok(event) = event {
                        self.on_net(event);
                    }
                },
                recv(read_rx) -> event => {
                    if let Ok(event) = event {
                        self.on_net(event);
                    }
                },
            }
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::StartServer { port, reply } => {
                let _ = reply.send(self.start_server(port));
            }
            Request::StopServer => self.stop_server(),
            Request::StartClient(id) => self.registry.start(id),
            Request::StopClient(id) => self.registry.stop(id),
            Request::StartAll => self.registry.start_all(),
            Request::StopAll => self.registry.stop_all(),
            Request::ListClients(reply) => {
                let _ = reply.send(self.registry.records());
            }
            Request::Shutdown => {}
        }
    }

    fn start_server(&mut self, port: u16) -> Result<SocketAddr, CollectorError> {
        if let Some(acceptor) = &self.acceptor {
            self.sink.log("Servidor já está rodando");
            return Ok(acceptor.local_addr());
        }

        let bound = TcpListener::bind(("0.0.0.0", port))
            .and_then(|listener| net_thread::spawn_acceptor(listener, self.accept_tx.clone()));

        match bound {
            Ok(acceptor) => {
                let addr = acceptor.local_addr();
                self.acceptor = Some(acceptor);
                self.sink
                    .log(format!("Servidor iniciado na porta {}", addr.port()));
                self.sink.server_started();
                Ok(addr)
            }
            Err(source) => {
                self.sink
                    .log(format!("Falha ao iniciar servidor: {source}"));
                Err(CollectorError::Bind { port, source })
            }
        }
    }

    fn stop_server(&mut self) {
        if !self.registry.is_empty() {
            info!("Derrubando {} conexões", self.registry.len());
        }
        self.registry.shutdown();

        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
            self.sink.log("Servidor parado");
            self.sink.server_stopped();
        }
    }

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted(stream, peer) => self.on_accepted(stream, peer),
            NetEvent::AcceptFailed(e) => {
                self.sink.log(format!("Erro ao aceitar conexão: {e}"));
            }
            NetEvent::Data(id, bytes) => self.registry.ingest(id, &bytes, &self.thresholds),
            NetEvent::Closed(id, err) => self.registry.disconnected(id, err),
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.acceptor.is_none() {
            debug!("Conexão de {peer} chegou com o servidor parado, descartando");
            return;
        }

        let reader = match prepare(&stream, self.write_timeout) {
            Ok(reader) => reader,
            Err(e) => {
                self.sink
                    .log(format!("Falha ao configurar conexão de {peer}: {e}"));
                return;
            }
        };

        let id = self.registry.accept(stream, peer);
        if !self.registry.contains(id) {
            return;
        }
        if let Err(e) = net_thread::spawn_reader(id, reader, self.read_tx.clone()) {
            self.registry.disconnected(id, Some(e));
        }
    }
}

/// Configura o socket aceito e devolve o clone usado pela leitura.
fn prepare(stream: &TcpStream, write_timeout: Duration) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(write_timeout))?;
    stream.try_clone()
}
