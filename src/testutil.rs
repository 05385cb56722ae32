//! A scripted in-process Gearman server for exercising the engine
//! end-to-end over real sockets.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::wire::packet::HEADER_LEN;
use crate::wire::{Magic, Packet, PacketType};

/// Install a quiet subscriber so failing tests can be re-run with more
/// verbose levels by editing one place.
pub(crate) fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init()
        .ok();
}

/// A fake server that hands each accepted connection to a scripted
/// handler. Connections are served one at a time, so aborting the server
/// also tears down the connection in progress.
pub(crate) struct MockServer {
    pub host: String,
    pub port: u16,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start<F, Fut>(serve: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_on(listener, serve)
    }

    /// Start on a specific port, for tests that bring a server back up at
    /// an address a client already knows.
    pub(crate) async fn start_on_port<F, Fut>(port: u16, serve: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener =
            TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::serve_on(listener, serve)
    }

    /// Serve exactly one connection, then drop the listener so later
    /// connection attempts are refused.
    pub(crate) async fn start_single<F, Fut>(serve: F) -> Self
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            drop(listener);
            serve(socket).await;
        });
        MockServer {
            host: addr.ip().to_string(),
            port: addr.port(),
            handle,
        }
    }

    fn serve_on<F, Fut>(listener: TcpListener, serve: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().unwrap();
        let serve = Arc::new(serve);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                serve(socket).await;
            }
        });
        MockServer {
            host: addr.ip().to_string(),
            port: addr.port(),
            handle,
        }
    }

    /// Kill the server, dropping the listener and any connection being
    /// served.
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read one binary request packet off the socket. Returns None once the
/// peer hangs up.
pub(crate) async fn read_packet(socket: &mut TcpStream) -> Option<Packet> {
    let mut header = [0u8; HEADER_LEN];
    socket.read_exact(&mut header).await.ok()?;
    let magic = Magic::from_bytes(&header[0..4]).expect("bad magic from client");
    let ptype =
        PacketType::from_code(u32::from_be_bytes(header[4..8].try_into().unwrap()));
    let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut data = vec![0u8; len];
    socket.read_exact(&mut data).await.ok()?;
    Some(Packet {
        magic,
        ptype,
        data: Bytes::from(data),
    })
}

/// Read one admin command line, newline included.
pub(crate) async fn read_line(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let byte = socket.read_u8().await.ok()?;
        line.push(byte);
        if byte == b'\n' {
            return Some(line);
        }
    }
}

/// Write a binary response packet.
pub(crate) async fn write_response(
    socket: &mut TcpStream,
    ptype: PacketType,
    data: &[u8],
) {
    socket
        .write_all(&Packet::response(ptype, data.to_vec()).to_binary())
        .await
        .unwrap();
}

/// Write raw bytes, e.g. an admin response.
pub(crate) async fn write_raw(socket: &mut TcpStream, data: &[u8]) {
    socket.write_all(data).await.unwrap();
}
