//! Threads de rede que aceitam conexões e leem sockets.
//!
//! Nenhuma delas toca no registro: tudo vira [`NetEvent`] no channel da
//! thread dona do Collector. Accepts usam um channel próprio; leituras vão
//! para um channel limitado a [`READ_QUEUE`] chunks.

use crossbeam_channel::Sender;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use telemetry_core::types::ClientId;
use tracing::{debug, info};

/// Intervalo de polling do accept não-bloqueante.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Tamanho do buffer de leitura por socket.
const READ_CHUNK: usize = 16 * 1024;

/// Capacidade do channel de leituras (em chunks), somando todos os clientes.
///
/// Com o channel cheio os readers param de ler e o TCP segura o peer.
pub const READ_QUEUE: usize = 64;

/// Evento de rede para a thread dona.
#[derive(Debug)]
pub enum NetEvent {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Data(ClientId, Vec<u8>),
    Closed(ClientId, Option<io::Error>),
}

/// Thread de accept em execução. Para ao ser descartada.
pub struct Acceptor {
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Acceptor {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Inicia a thread de accept sobre um listener já vinculado.
pub fn spawn_acceptor(listener: TcpListener, tx: Sender<NetEvent>) -> io::Result<Acceptor> {
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let stop = Arc::new(AtomicBool::new(false));

    let flag = stop.clone();
    std::thread::Builder::new()
        .name("collector-accept".into())
        .spawn(move || accept_loop(&listener, &tx, &flag))?;

    Ok(Acceptor { stop, local_addr })
}

fn accept_loop(listener: &TcpListener, tx: &Sender<NetEvent>, stop: &AtomicBool) {
    info!("Collector escutando em {:?}", listener.local_addr().ok());

    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if tx.send(NetEvent::Accepted(stream, addr)).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if tx.send(NetEvent::AcceptFailed(e)).is_err() {
                    break;
                }
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }

    debug!("Thread de accept encerrada");
}

/// Inicia a leitura bloqueante de um socket já registrado.
///
/// `tx` deve ser limitado: o envio bloqueia enquanto a thread dona não
/// consome, e o socket deixa de ser lido nesse intervalo.
pub fn spawn_reader(id: ClientId, mut stream: TcpStream, tx: Sender<NetEvent>) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("collector-client-{id}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(NetEvent::Closed(id, None));
                        break;
                    }
                    Ok(n) => {
                        if tx.send(NetEvent::Data(id, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(NetEvent::Closed(id, Some(e)));
                        break;
                    }
                }
            }
        })
        .map(drop)
}
