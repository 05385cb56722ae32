//! A single logical link to one Gearman server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{
    split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info};

use crate::admin::{AdminRequest, PendingAdmin};
use crate::error::{GearmanError, Result};
use crate::types::job::Job;
use crate::wire::{AdminLine, AdminQueue, Codec, Packet, PacketType};

/// TLS client configuration for a server connection.
///
/// All three files are required together: the private key, the client
/// certificate, and the CA bundle used to verify the server. Peer
/// verification is always on.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: PathBuf,
}

impl TlsConfig {
    pub fn new(
        key: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        ca: impl Into<PathBuf>,
    ) -> Self {
        TlsConfig {
            key: key.into(),
            cert: cert.into(),
            ca: ca.into(),
        }
    }

    /// Build a config from individually optional paths: all three present
    /// yields a config, all three absent yields None, and anything in
    /// between is a configuration error.
    pub fn from_optional(
        key: Option<PathBuf>,
        cert: Option<PathBuf>,
        ca: Option<PathBuf>,
    ) -> Result<Option<Self>> {
        match (key, cert, ca) {
            (None, None, None) => Ok(None),
            (Some(key), Some(cert), Some(ca)) => {
                Ok(Some(TlsConfig { key, cert, ca }))
            }
            _ => Err(GearmanError::Configuration(
                "TLS requires key, certificate, and CA together".into(),
            )),
        }
    }
}

/// The socket under a connection, plain or TLS.
#[derive(Debug)]
pub(crate) enum GearStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for GearStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            GearStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            GearStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GearStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            GearStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            GearStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            GearStream::Plain(s) => Pin::new(s).poll_flush(cx),
            GearStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            GearStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            GearStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The worker-role state label of a connection. Only role code reads or
/// writes this; the connection itself resets it to Init on reconnect.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum RoleState {
    #[default]
    Init,
    Idle,
    GrabWait,
    Sleep,
}

/// An in-process waiter for a correlated response on one connection.
///
/// Responses arrive in the order requests were written, so the pending
/// FIFO pairs them back up without any correlation id on the wire.
#[derive(Debug)]
pub(crate) enum Task {
    SubmitJob {
        job: Job,
        completion: oneshot::Sender<()>,
    },
    OptionReq {
        completion: oneshot::Sender<()>,
    },
}

impl Task {
    pub(crate) fn submit_job(job: Job) -> (Self, oneshot::Receiver<()>) {
        let (completion, rx) = oneshot::channel();
        (Task::SubmitJob { job, completion }, rx)
    }

    pub(crate) fn option_req() -> (Self, oneshot::Receiver<()>) {
        let (completion, rx) = oneshot::channel();
        (Task::OptionReq { completion }, rx)
    }

    /// Wake whoever is waiting on this task. The receiver may be gone
    /// (e.g. an option replay on reconnect that nobody awaits), which is
    /// fine.
    pub(crate) fn complete(self) {
        match self {
            Task::SubmitJob { completion, .. } => completion.send(()).ok(),
            Task::OptionReq { completion } => completion.send(()).ok(),
        };
    }
}

#[derive(Debug)]
struct ConnectionState {
    role_state: RoleState,
    state_since: Instant,
    pending_tasks: VecDeque<Task>,
    related_jobs: HashMap<Bytes, Job>,
    options: HashSet<Bytes>,
}

impl ConnectionState {
    fn new() -> Self {
        ConnectionState {
            role_state: RoleState::Init,
            state_since: Instant::now(),
            pending_tasks: VecDeque::new(),
            related_jobs: HashMap::new(),
            options: HashSet::new(),
        }
    }
}

/// A connection to a Gearman server.
///
/// Created by `add_server` and owned by the pool; the reconnect task opens
/// it, the poll task reads it, and caller tasks write requests on it. All
/// mutable state is reset whenever the connection is recycled.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    host: String,
    port: u16,
    tls: Option<TlsConfig>,
    connected: AtomicBool,
    writer: tokio::sync::Mutex<Option<FramedWrite<WriteHalf<GearStream>, Codec>>>,
    state: Mutex<ConnectionState>,
    echo_waiters: Mutex<HashMap<Bytes, oneshot::Sender<Bytes>>>,
    admin_queue: AdminQueue,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        host: impl Into<String>,
        port: u16,
        tls: Option<TlsConfig>,
    ) -> Self {
        Connection {
            id,
            host: host.into(),
            port,
            tls,
            connected: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(ConnectionState::new()),
            echo_waiters: Mutex::new(HashMap::new()),
            admin_queue: AdminQueue::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn admin_queue(&self) -> AdminQueue {
        self.admin_queue.clone()
    }

    /// Open a socket to the server, trying each resolved address in turn,
    /// and reset all per-connection state. Returns the read half for the
    /// poll task; the write half is retained for senders.
    pub(crate) async fn connect(&self) -> Result<ReadHalf<GearStream>> {
        debug!(conn = %self, "connecting");

        let addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|error| {
                GearmanError::Connection(format!(
                    "resolving {self}: {error}"
                ))
            })?;

        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(error) => {
                    debug!(conn = %self, %addr, %error, "connect attempt failed")
                }
            }
        }
        let Some(tcp) = tcp else {
            debug!(conn = %self, "unable to open socket");
            return Err(GearmanError::Connection(format!(
                "unable to open socket to {self}"
            )));
        };
        tcp.set_nodelay(true)?;

        let stream = match &self.tls {
            Some(tls) => {
                debug!(conn = %self, "using TLS");
                wrap_tls(&self.host, tls, tcp).await?
            }
            None => GearStream::Plain(tcp),
        };

        let (read, write) = split(stream);
        self.reset();
        *self.writer.lock().await = Some(FramedWrite::new(
            write,
            Codec::new(self.admin_queue.clone()),
        ));
        self.connected.store(true, Ordering::SeqCst);
        info!(conn = %self, "connected");

        Ok(read)
    }

    /// Close the socket and drop all associated state. Idempotent; any
    /// waiters on pending tasks, echo responses, or admin responses are
    /// released with a failure.
    pub(crate) async fn disconnect(&self) {
        if let Some(mut framed) = self.writer.lock().await.take() {
            framed.get_mut().shutdown().await.ok();
            info!(conn = %self, "disconnected");
        }
        self.connected.store(false, Ordering::SeqCst);
        self.reset();
    }

    /// Recycle the connection: disconnect, then connect afresh.
    pub(crate) async fn reconnect(&self) -> Result<ReadHalf<GearStream>> {
        self.disconnect().await;
        self.connect().await
    }

    fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.role_state = RoleState::Init;
            state.state_since = Instant::now();
            state.pending_tasks.clear();
            state.related_jobs.clear();
            state.options.clear();
        }
        self.echo_waiters.lock().unwrap().clear();
        self.admin_queue.lock().unwrap().clear();
    }

    /// Send a single packet to the server.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        debug!(conn = %self, %packet, "sending packet");
        let mut writer = self.writer.lock().await;
        let framed = writer.as_mut().ok_or_else(|| {
            GearmanError::Connection(format!("not connected to {self}"))
        })?;
        framed.send(packet).await
    }

    /// Send a packet whose response will be correlated back through the
    /// pending-task FIFO. The task is enqueued under the writer lock so
    /// the FIFO order always matches the order packets hit the wire.
    pub(crate) async fn send_with_task(
        &self,
        packet: Packet,
        task: Task,
    ) -> Result<()> {
        debug!(conn = %self, %packet, "sending packet");
        let mut writer = self.writer.lock().await;
        let framed = writer.as_mut().ok_or_else(|| {
            GearmanError::Connection(format!("not connected to {self}"))
        })?;
        self.state.lock().unwrap().pending_tasks.push_back(task);
        framed.send(packet).await
    }

    /// Send an administrative command and wait for its response.
    ///
    /// The raw response bytes, terminator included, are returned on
    /// completion; expiry of the timeout fails with `Timeout`.
    pub async fn send_admin_request(
        &self,
        request: AdminRequest,
        timeout: Duration,
    ) -> Result<Bytes> {
        debug!(conn = %self, command = ?request.command(), "sending admin request");
        let (tx, rx) = oneshot::channel();
        let line = request.command_line();
        {
            let mut writer = self.writer.lock().await;
            let framed = writer.as_mut().ok_or_else(|| {
                GearmanError::Connection(format!("not connected to {self}"))
            })?;
            self.admin_queue.lock().unwrap().push_back(PendingAdmin {
                request,
                completion: tx,
            });
            framed.send(AdminLine(line)).await?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GearmanError::Connection(format!(
                "connection to {self} closed while waiting for an admin \
                 response"
            ))),
            Err(_) => Err(GearmanError::Timeout("an admin response".into())),
        }
    }

    /// Perform an echo test against the server.
    ///
    /// Registers a waiter keyed by the payload, sends ECHO_REQ, and waits
    /// for the matching ECHO_RES. Only one waiter per payload may be
    /// outstanding at a time. On timeout the waiter is deregistered, so a
    /// late response is discarded rather than misreported as success.
    pub async fn echo(
        &self,
        data: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let data = data.into();
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.echo_waiters.lock().unwrap();
            if waiters.contains_key(&data) {
                return Err(GearmanError::InvalidData(format!(
                    "already waiting on an echo response of {data:?}"
                )));
            }
            waiters.insert(data.clone(), tx);
        }

        if let Err(error) = self
            .send_packet(Packet::request(PacketType::EchoReq, data.clone()))
            .await
        {
            self.echo_waiters.lock().unwrap().remove(&data);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(GearmanError::Connection(format!(
                "connection to {self} closed while waiting for an echo \
                 response"
            ))),
            Err(_) => {
                self.echo_waiters.lock().unwrap().remove(&data);
                Err(GearmanError::Timeout("an echo response".into()))
            }
        }
    }

    /// Release the waiter registered for this echo payload, if any.
    /// Returns false for a late or unsolicited response.
    pub(crate) fn handle_echo_res(&self, data: Bytes) -> bool {
        let waiter = self.echo_waiters.lock().unwrap().remove(&data);
        match waiter {
            Some(tx) => {
                tx.send(data).ok();
                true
            }
            None => false,
        }
    }

    pub(crate) fn role_state(&self) -> RoleState {
        self.state.lock().unwrap().role_state
    }

    pub(crate) fn state_since(&self) -> Instant {
        self.state.lock().unwrap().state_since
    }

    pub(crate) fn change_state(&self, role_state: RoleState) {
        debug!(conn = %self, state = ?role_state, "setting state");
        let mut state = self.state.lock().unwrap();
        state.role_state = role_state;
        state.state_since = Instant::now();
    }

    pub(crate) fn pop_pending_task(&self) -> Option<Task> {
        self.state.lock().unwrap().pending_tasks.pop_front()
    }

    pub(crate) fn register_job(&self, handle: Bytes, job: Job) {
        self.state.lock().unwrap().related_jobs.insert(handle, job);
    }

    pub(crate) fn related_job(&self, handle: &[u8]) -> Option<Job> {
        self.state.lock().unwrap().related_jobs.get(handle).cloned()
    }

    pub(crate) fn remove_related_job(&self, handle: &[u8]) {
        self.state.lock().unwrap().related_jobs.remove(handle);
    }

    /// Drain every in-flight job, for surfacing to the role's disconnect
    /// hook when this connection is lost.
    pub(crate) fn take_related_jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .unwrap()
            .related_jobs
            .drain()
            .map(|(_, job)| job)
            .collect()
    }

    pub(crate) fn add_option(&self, name: Bytes) {
        self.state.lock().unwrap().options.insert(name);
    }

    pub(crate) fn has_option(&self, name: &[u8]) -> bool {
        self.state.lock().unwrap().options.contains(name)
    }

    #[cfg(test)]
    pub(crate) fn echo_waiter_count(&self) -> usize {
        self.echo_waiters.lock().unwrap().len()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

async fn wrap_tls(
    host: &str,
    tls: &TlsConfig,
    tcp: TcpStream,
) -> Result<GearStream> {
    let mut roots = RootCertStore::empty();
    for cert in
        rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.ca)?))
    {
        roots.add(cert?).map_err(|error| {
            GearmanError::Configuration(format!(
                "invalid CA certificate in {}: {error}",
                tls.ca.display()
            ))
        })?;
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(
        &tls.cert,
    )?))
    .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(
        &tls.key,
    )?))?
    .ok_or_else(|| {
        GearmanError::Configuration(format!(
            "no private key found in {}",
            tls.key.display()
        ))
    })?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|error| {
            GearmanError::Configuration(format!(
                "invalid TLS client configuration: {error}"
            ))
        })?;

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|error| {
            GearmanError::Configuration(format!(
                "invalid TLS server name {host}: {error}"
            ))
        })?;

    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector.connect(server_name, tcp).await?;
    Ok(GearStream::Tls(Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn silent_server() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (listener, host, port) = silent_server().await;
        let conn = Connection::new(1, host, port, None);

        assert!(!conn.is_connected());
        let _read = conn.connect().await.unwrap();
        let _accepted = listener.accept().await.unwrap();
        assert!(conn.is_connected());

        conn.disconnect().await;
        assert!(!conn.is_connected());
        // Disconnect must be idempotent.
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, host, port) = silent_server().await;
        drop(listener);
        let conn = Connection::new(1, host, port, None);

        assert!(matches!(
            conn.connect().await,
            Err(GearmanError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = Connection::new(1, "127.0.0.1", 4730, None);
        let result = conn
            .send_packet(Packet::request(PacketType::PreSleep, Bytes::new()))
            .await;
        assert!(matches!(result, Err(GearmanError::Connection(_))));
    }

    // An unanswered echo must time out and leave no waiter behind, so a
    // late ECHO_RES is ignored rather than reported as success.
    #[tokio::test]
    async fn test_echo_timeout_clears_registry() {
        let (listener, host, port) = silent_server().await;
        let conn = Connection::new(1, host, port, None);
        let _read = conn.connect().await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let result = conn
            .echo(&b"ping"[..], Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(GearmanError::Timeout(_))));
        assert_eq!(conn.echo_waiter_count(), 0);
        assert!(!conn.handle_echo_res(Bytes::from_static(b"ping")));
    }

    #[tokio::test]
    async fn test_echo_duplicate_payload() {
        let (listener, host, port) = silent_server().await;
        let conn = Arc::new(Connection::new(1, host, port, None));
        let _read = conn.connect().await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.echo(&b"ping"[..], Duration::from_millis(500)).await
            })
        };
        // Give the first echo time to register its waiter.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = conn
            .echo(&b"ping"[..], Duration::from_millis(100))
            .await;
        assert!(matches!(second, Err(GearmanError::InvalidData(_))));

        assert!(matches!(
            first.await.unwrap(),
            Err(GearmanError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_request_timeout() {
        let (listener, host, port) = silent_server().await;
        let conn = Connection::new(1, host, port, None);
        let _read = conn.connect().await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let result = conn
            .send_admin_request(
                AdminRequest::version(),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(GearmanError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_partial_tls_config_is_an_error() {
        assert!(TlsConfig::from_optional(None, None, None)
            .unwrap()
            .is_none());
        assert!(TlsConfig::from_optional(
            Some("key.pem".into()),
            Some("cert.pem".into()),
            Some("ca.pem".into()),
        )
        .unwrap()
        .is_some());
        assert!(matches!(
            TlsConfig::from_optional(Some("key.pem".into()), None, None),
            Err(GearmanError::Configuration(_))
        ));
    }
}
