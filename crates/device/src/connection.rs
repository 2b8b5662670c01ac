//! Driver de rede do Device.
//!
//! Uma thread dona da [`Session`] roda um `select!` sobre comandos do
//! operador, eventos de rede e um único timer. Conexão e leitura do socket
//! rodam em threads auxiliares que apenas postam eventos no channel; cada
//! evento carrega a geração do transporte para descartar eventos antigos.

use crate::session::{Action, ConnectionState, Session};
use crossbeam_channel::{Receiver, Sender, after, never, select, unbounded};
use rand::Rng;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use telemetry_core::types::ClientId;
use tracing::{debug, error, info, warn};

/// Timeout de escrita no socket.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tamanho do buffer de leitura.
const READ_CHUNK: usize = 4096;

/// Comandos aceitos pelo driver.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    Connect { host: String, port: u16 },
    Disconnect,
    Shutdown,
}

/// Notificações publicadas pelo driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChanged(ConnectionState),
    Confirmed(ClientId),
    /// Aviso da sessão (comando desconhecido, frame descartado...)
    Log(String),
}

/// Eventos das threads de rede para a thread dona.
enum NetEvent {
    Connected(u64, TcpStream),
    ConnectFailed(u64, io::Error),
    Data(u64, Vec<u8>),
    Closed(u64, Option<io::Error>),
}

/// Handle para a thread de conexão.
pub struct DeviceHandle {
    commands: Sender<DeviceCommand>,
    events: Receiver<DeviceEvent>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn connect(&self, host: impl Into<String>, port: u16) {
        let _ = self.commands.send(DeviceCommand::Connect {
            host: host.into(),
            port,
        });
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(DeviceCommand::Disconnect);
    }

    pub fn events(&self) -> &Receiver<DeviceEvent> {
        &self.events
    }

    /// Encerra a thread de conexão e aguarda o término.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Thread de conexão terminou com panic");
            }
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Inicia a thread dona da sessão.
pub fn spawn<R>(session: Session<R>, connect_timeout: Duration) -> io::Result<DeviceHandle>
where
    R: Rng + Send + 'static,
{
    let (cmd_tx, cmd_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let (net_tx, net_rx) = unbounded();

    let driver = Driver {
        session,
        net_tx,
        net_rx,
        events: event_tx,
        stream: None,
        generation: 0,
        connect_timeout,
    };

    let thread = std::thread::Builder::new()
        .name("device-conn".into())
        .spawn(move || driver.run(cmd_rx))?;

    Ok(DeviceHandle {
        commands: cmd_tx,
        events: event_rx,
        thread: Some(thread),
    })
}

struct Driver<R: Rng> {
    session: Session<R>,
    net_tx: Sender<NetEvent>,
    net_rx: Receiver<NetEvent>,
    events: Sender<DeviceEvent>,
    stream: Option<TcpStream>,
    /// Geração do transporte atual; eventos de outras gerações são antigos
    generation: u64,
    connect_timeout: Duration,
}

impl<R: Rng> Driver<R> {
    fn run(mut self, commands: Receiver<DeviceCommand>) {
        let net_rx = self.net_rx.clone();

        loop {
            let timer = match self.session.next_deadline() {
                Some(at) => after(at.saturating_duration_since(Instant::now())),
                None => never(),
            };
            let before = (self.session.state(), self.session.client_id());

            let actions = select! {
                recv(commands) -> cmd => match cmd {
                    Ok(DeviceCommand::Connect { host, port }) => self.session.connect(host, port),
                    Ok(DeviceCommand::Disconnect) => self.session.disconnect(),
                    Ok(DeviceCommand::Shutdown) | Err(_) => {
                        let actions = self.session.disconnect();
                        self.apply(actions);
                        self.publish(before);
                        info!("Thread de conexão encerrada");
                        return;
                    }
                },
                recv(net_rx) -> event => match event {
                    Ok(event) => self.on_net(event),
                    Err(_) => Vec::new(),
                },
                recv(timer) -> _ => self.session.on_timer(Instant::now()),
            };

            self.apply(actions);
            self.publish(before);
        }
    }

    fn on_net(&mut self, event: NetEvent) -> Vec<Action> {
        let now = Instant::now();

        match event {
            NetEvent::Connected(generation, stream) if generation == self.generation => {
                if let Err(e) = self.attach(stream) {
                    self.session.on_connect_failed(&e, now);
                    return Vec::new();
                }
                self.session.on_connected();
                Vec::new()
            }
            NetEvent::ConnectFailed(generation, err) if generation == self.generation => {
                self.session.on_connect_failed(&err, now);
                Vec::new()
            }
            NetEvent::Data(generation, bytes) if generation == self.generation => {
                self.session.on_bytes(&bytes, now)
            }
            NetEvent::Closed(generation, err) if generation == self.generation => {
                match err {
                    Some(e) => warn!("Erro de socket: {e}"),
                    None => debug!("Collector fechou a conexão"),
                }
                self.session.on_disconnected(now)
            }
            NetEvent::Connected(_, stream) => {
                debug!("Descartando conexão de uma tentativa antiga");
                let _ = stream.shutdown(Shutdown::Both);
                Vec::new()
            }
            _ => {
                debug!("Evento de rede de geração antiga descartado");
                Vec::new()
            }
        }
    }

    /// Adota o socket recém-conectado e inicia a thread de leitura.
    fn attach(&mut self, stream: TcpStream) -> io::Result<()> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        spawn_reader(self.generation, reader, self.net_tx.clone())?;
        self.stream = Some(stream);
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>) {
        let mut pending: VecDeque<Action> = actions.into();

        while let Some(action) = pending.pop_front() {
            match action {
                Action::Connect { host, port } => {
                    self.close_transport();
                    let spawned = spawn_connector(
                        self.generation,
                        host,
                        port,
                        self.connect_timeout,
                        self.net_tx.clone(),
                    );
                    if let Err(e) = spawned {
                        error!("Falha ao criar thread de conexão: {e}");
                        self.session.on_connect_failed(&e, Instant::now());
                    }
                }
                Action::Send(frame) => {
                    let Some(stream) = self.stream.as_mut() else {
                        debug!("Envio descartado: sem transporte");
                        continue;
                    };
                    if let Err(e) = stream.write_all(&frame) {
                        warn!("Erro ao enviar: {e}");
                        pending.extend(self.session.on_disconnected(Instant::now()));
                    }
                }
                Action::Close => self.close_transport(),
                Action::Log(text) => {
                    let _ = self.events.send(DeviceEvent::Log(text));
                }
            }
        }
    }

    fn close_transport(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.generation += 1;
    }

    fn publish(&self, (state, client_id): (ConnectionState, Option<ClientId>)) {
        if self.session.state() != state {
            debug!("Estado: {state} → {}", self.session.state());
            let _ = self
                .events
                .send(DeviceEvent::StateChanged(self.session.state()));
        }
        if let Some(id) = self.session.client_id() {
            if client_id != Some(id) {
                let _ = self.events.send(DeviceEvent::Confirmed(id));
            }
        }
    }
}

fn spawn_connector(
    generation: u64,
    host: String,
    port: u16,
    timeout: Duration,
    tx: Sender<NetEvent>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("device-connect".into())
        .spawn(move || {
            let event = match connect(&host, port, timeout) {
                Ok(stream) => NetEvent::Connected(generation, stream),
                Err(e) => NetEvent::ConnectFailed(generation, e),
            };
            let _ = tx.send(event);
        })
        .map(drop)
}

fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("{host}: endereço não resolvido"),
    );
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn spawn_reader(generation: u64, mut stream: TcpStream, tx: Sender<NetEvent>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("device-reader".into())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(NetEvent::Closed(generation, None));
                        break;
                    }
                    Ok(n) => {
                        if tx.send(NetEvent::Data(generation, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(NetEvent::Closed(generation, Some(e)));
                        break;
                    }
                }
            }
        })
        .map(drop)
}
