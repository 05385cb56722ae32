//! The client role: submitting jobs and tracking their lifecycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::conn::{Connection, Task, TlsConfig};
use crate::dispatch::{Dispatcher, ReceivedPacket, TimingReporter};
use crate::error::{GearmanError, Result};
use crate::pool::Pool;
use crate::types::job::{completion_fraction, Job, Precedence};
use crate::wire::{Packet, PacketType};
use crate::{poller, reconnect};

/// Select the submit packet type for a background/precedence combination.
pub(crate) const fn submit_packet_type(
    background: bool,
    precedence: Precedence,
) -> PacketType {
    match (background, precedence) {
        (false, Precedence::Normal) => PacketType::SubmitJob,
        (false, Precedence::Low) => PacketType::SubmitJobLow,
        (false, Precedence::High) => PacketType::SubmitJobHigh,
        (true, Precedence::Normal) => PacketType::SubmitJobBg,
        (true, Precedence::Low) => PacketType::SubmitJobLowBg,
        (true, Precedence::High) => PacketType::SubmitJobHighBg,
    }
}

/// A Gearman client.
///
/// Any number of servers may be added; jobs are submitted to them in
/// round-robin order, lost servers are retried in the background, and
/// options survive reconnection. Construction spawns the instance's two
/// background tasks, so a client must be created inside a Tokio runtime;
/// call [`Client::shutdown`] to stop them and close every connection.
pub struct Client {
    client_id: String,
    core: Arc<ClientCore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Create a client with the default client id.
    pub fn new() -> Self {
        Self::with_client_id("unknown")
    }

    /// Create a client with an id that will show up in this instance's
    /// log events.
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ClientCore {
            pool: Pool::new(wake),
            broadcast_lock: tokio::sync::Mutex::new(()),
            options: Mutex::new(HashSet::new()),
            timing_reporter: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        let span = info_span!("gearman_client", client_id = %client_id);
        let role: Arc<dyn Dispatcher> = core.clone();
        let poll_task = tokio::spawn(
            poller::run(role.clone(), wake_rx, cancel.clone())
                .instrument(span.clone()),
        );
        let connect_task = tokio::spawn(
            reconnect::run(role, cancel.clone()).instrument(span),
        );

        Client {
            client_id,
            core,
            cancel,
            tasks: Mutex::new(vec![poll_task, connect_task]),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Add a server to the connection pool.
    ///
    /// Non-blocking: the background reconnect task establishes the
    /// connection. Use [`Client::wait_for_server`] to wait for one to
    /// come up. Duplicate host/port pairs are refused.
    pub fn add_server(&self, host: &str, port: u16) -> Result<()> {
        self.core.pool.add_server(host, port, None).map(|_| ())
    }

    /// Add a TLS server to the connection pool. The connection uses
    /// mutual authentication and always verifies the server certificate.
    pub fn add_server_tls(
        &self,
        host: &str,
        port: u16,
        tls: TlsConfig,
    ) -> Result<()> {
        self.core.pool.add_server(host, port, Some(tls)).map(|_| ())
    }

    /// Block until at least one server is connected.
    pub async fn wait_for_server(&self, timeout: Duration) -> Result<()> {
        self.core.pool.wait_for_server(timeout).await
    }

    /// The next connection in round-robin rotation. Exposed for direct
    /// use of connection-level operations such as echo and admin
    /// requests.
    pub fn get_connection(&self) -> Result<Arc<Connection>> {
        self.core.pool.get_connection()
    }

    /// Set a connection option, e.g. `exceptions`, on every active
    /// connection, and re-apply it automatically after reconnects.
    ///
    /// Returns true only if every connection that stayed up acknowledged
    /// the option.
    pub async fn set_option(
        &self,
        name: impl Into<Bytes>,
        timeout: Duration,
    ) -> bool {
        self.core.set_option(name.into(), timeout).await
    }

    /// Submit a job to the next server in round-robin rotation.
    ///
    /// For a foreground job the supplied [`Job`] keeps updating as
    /// responses arrive. A connection that errors or times out is dropped
    /// from the pool and the next one is tried; the submit fails with a
    /// protocol error once every currently-active connection has been
    /// attempted.
    pub async fn submit_job(
        &self,
        job: &Job,
        background: bool,
        precedence: Precedence,
        timeout: Duration,
    ) -> Result<()> {
        self.core
            .submit_job(job, background, precedence, timeout)
            .await
    }

    /// Query the server that accepted `job` for its status; the answer
    /// lands in the job's `known`/`running`/fraction fields via
    /// STATUS_RES.
    pub async fn get_status(&self, job: &Job) -> Result<()> {
        self.core.get_status(job).await
    }

    /// Install a hook that receives the packet type and wall-clock
    /// duration of every dispatched packet, for layering metrics on
    /// without touching the engine.
    pub fn set_timing_reporter(
        &self,
        reporter: impl Fn(PacketType, Duration) + Send + Sync + 'static,
    ) {
        *self.core.timing_reporter.lock().unwrap() = Some(Box::new(reporter));
    }

    /// Stop the background tasks and close every connection. The client
    /// may not be used afterwards.
    pub async fn shutdown(&self) {
        if !self.core.pool.is_running() {
            warn!("shutdown called when not currently running; ignoring");
            return;
        }
        debug!("beginning shutdown");
        self.core.pool.set_running(false);
        self.core.pool.notify_all();
        self.cancel.cancel();

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.await.ok();
        }
        for conn in self.core.pool.drain_connections() {
            conn.disconnect().await;
        }
        debug!("finished shutdown");
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool {
        &self.core.pool
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ClientCore {
    pool: Pool,
    /// Serializes multi-connection state changes (the option set) so the
    /// on-connect replay stays consistent with live `set_option` calls.
    broadcast_lock: tokio::sync::Mutex<()>,
    options: Mutex<HashSet<Bytes>>,
    timing_reporter: Mutex<Option<TimingReporter>>,
}

impl ClientCore {
    async fn set_option(&self, name: Bytes, timeout: Duration) -> bool {
        let tasks = {
            let _guard = self.broadcast_lock.lock().await;
            self.options.lock().unwrap().insert(name.clone());

            let mut tasks = Vec::new();
            for conn in self.pool.snapshot_active() {
                // Error handling is all done by send_option_req.
                if let Ok(rx) = self.send_option_req(&conn, &name).await {
                    tasks.push((rx, conn));
                }
            }
            tasks
        };

        let mut success = true;
        for (rx, conn) in tasks {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => {
                    if !conn.has_option(&name) {
                        success = false;
                    }
                }
                _ => {
                    error!(
                        conn = %conn,
                        option = ?name,
                        "timed out waiting for a response to an option \
                         request"
                    );
                    self.connection_lost(&conn);
                }
            }
        }
        success
    }

    async fn send_option_req(
        &self,
        conn: &Arc<Connection>,
        name: &Bytes,
    ) -> Result<tokio::sync::oneshot::Receiver<()>> {
        let (task, rx) = Task::option_req();
        let packet = Packet::request(PacketType::OptionReq, name.clone());
        if let Err(error) = conn.send_with_task(packet, task).await {
            error!(conn = %conn, %error, "error sending packet");
            self.connection_lost(conn);
            return Err(error);
        }
        Ok(rx)
    }

    async fn submit_job(
        &self,
        job: &Job,
        background: bool,
        precedence: Precedence,
        timeout: Duration,
    ) -> Result<()> {
        let unique = job.unique().cloned().unwrap_or_default();
        let mut payload = BytesMut::with_capacity(
            job.name().len() + unique.len() + job.arguments().len() + 2,
        );
        payload.put_slice(job.name());
        payload.put_u8(0);
        payload.put_slice(&unique);
        payload.put_u8(0);
        payload.put_slice(job.arguments());
        let packet = Packet::request(
            submit_packet_type(background, precedence),
            payload.freeze(),
        );

        let mut attempted: HashSet<u64> = HashSet::new();
        loop {
            // Refreshed each attempt: a submit gives up only once every
            // currently-active connection has been tried.
            let active = self.pool.active_ids();
            if active.iter().all(|id| attempted.contains(id)) {
                break;
            }

            let conn = self.pool.get_connection()?;
            attempted.insert(conn.id());

            let (task, rx) = Task::submit_job(job.clone());
            if conn.send_with_task(packet.clone(), task).await.is_err() {
                self.connection_lost(&conn);
                continue;
            }

            match tokio::time::timeout(timeout, rx).await {
                Err(_) => {
                    error!(
                        conn = %conn,
                        "timed out waiting for a response to a submit job \
                         request"
                    );
                    self.connection_lost(&conn);
                    continue;
                }
                Ok(Err(_)) => {
                    debug!(
                        conn = %conn,
                        "connection reset while awaiting a submit response"
                    );
                    continue;
                }
                Ok(Ok(())) => {
                    if job.handle().is_none() {
                        error!(
                            conn = %conn,
                            "server sent an error in response to a submit \
                             job request"
                        );
                        continue;
                    }
                    job.progress().connection = Some(Arc::downgrade(&conn));
                    return Ok(());
                }
            }
        }
        Err(GearmanError::Protocol(
            "unable to submit job to any connected servers".into(),
        ))
    }

    async fn get_status(&self, job: &Job) -> Result<()> {
        let handle = job.handle().ok_or_else(|| {
            GearmanError::InvalidData(
                "job has not been assigned a handle".into(),
            )
        })?;
        let conn = job.connection().ok_or_else(|| {
            GearmanError::Connection(
                "the connection this job was submitted on is gone".into(),
            )
        })?;
        self.send_to(&conn, Packet::request(PacketType::GetStatus, handle))
            .await
    }
}

#[async_trait]
impl Dispatcher for ClientCore {
    fn pool(&self) -> &Pool {
        &self.pool
    }

    fn report_timing_stats(&self, ptype: PacketType, duration: Duration) {
        if let Some(report) = self.timing_reporter.lock().unwrap().as_ref() {
            report(ptype, duration);
        }
    }

    /// Re-send every stored option so they survive reconnection. The
    /// replay is fire-and-forget: OPTION_RES lands through the normal
    /// pending-task path once the connection starts being polled.
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()> {
        let _guard = self.broadcast_lock.lock().await;
        let options: Vec<Bytes> =
            self.options.lock().unwrap().iter().cloned().collect();
        for name in options {
            let (task, _rx) = Task::option_req();
            conn.send_with_task(
                Packet::request(PacketType::OptionReq, name),
                task,
            )
            .await
            .ok();
        }
        Ok(())
    }

    async fn handle_job_created(&self, packet: ReceivedPacket) -> Result<()> {
        let Some(Task::SubmitJob { job, completion }) =
            packet.conn.pop_pending_task()
        else {
            error!(
                conn = %packet.conn,
                packet = %packet.packet,
                "unexpected response received to a submit job request"
            );
            self.connection_lost(&packet.conn);
            return Err(GearmanError::Protocol(
                "unexpected response received to a submit job request"
                    .into(),
            ));
        };

        let handle = packet.packet.data.clone();
        job.progress().handle = Some(handle.clone());
        packet.conn.register_job(handle, job.clone());
        job.notify_changed();
        completion.send(()).ok();
        debug!(handle = ?job.handle(), "job created");
        Ok(())
    }

    async fn handle_work_complete(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        let (handle, job) = packet.related_job()?;
        let data = packet.packet.argument_rest(1);
        {
            let mut progress = job.progress();
            if !data.is_empty() {
                progress.data.push(data);
            }
            progress.complete = true;
            progress.failure = false;
            progress.connection = None;
        }
        packet.conn.remove_related_job(&handle);
        job.notify_changed();
        debug!(handle = ?handle, "job complete");
        Ok(())
    }

    async fn handle_work_fail(&self, packet: ReceivedPacket) -> Result<()> {
        let (handle, job) = packet.related_job()?;
        {
            let mut progress = job.progress();
            progress.complete = true;
            progress.failure = true;
            progress.connection = None;
        }
        packet.conn.remove_related_job(&handle);
        job.notify_changed();
        debug!(handle = ?handle, "job failed");
        Ok(())
    }

    async fn handle_work_exception(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        let (handle, job) = packet.related_job()?;
        {
            let mut progress = job.progress();
            progress.exception = Some(packet.packet.argument_rest(1));
            progress.complete = true;
            progress.failure = true;
            progress.connection = None;
        }
        packet.conn.remove_related_job(&handle);
        job.notify_changed();
        debug!(handle = ?handle, "job raised an exception");
        Ok(())
    }

    async fn handle_work_data(&self, packet: ReceivedPacket) -> Result<()> {
        let (_, job) = packet.related_job()?;
        let data = packet.packet.argument_rest(1);
        if !data.is_empty() {
            job.progress().data.push(data);
        }
        job.notify_changed();
        Ok(())
    }

    async fn handle_work_warning(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        let (_, job) = packet.related_job()?;
        let data = packet.packet.argument_rest(1);
        {
            let mut progress = job.progress();
            if !data.is_empty() {
                progress.data.push(data);
            }
            progress.warning = true;
        }
        job.notify_changed();
        Ok(())
    }

    async fn handle_work_status(&self, packet: ReceivedPacket) -> Result<()> {
        let (_, job) = packet.related_job()?;
        let numerator = packet.packet.argument(1)?;
        let denominator = packet.packet.argument(2)?;
        {
            let mut progress = job.progress();
            progress.fraction_complete =
                completion_fraction(&numerator, &denominator);
            progress.numerator = Some(numerator);
            progress.denominator = Some(denominator);
        }
        job.notify_changed();
        Ok(())
    }

    async fn handle_status_res(&self, packet: ReceivedPacket) -> Result<()> {
        let (_, job) = packet.related_job()?;
        let known = packet.packet.argument(1)?;
        let running = packet.packet.argument(2)?;
        let numerator = packet.packet.argument(3)?;
        let denominator = packet.packet.argument(4)?;
        {
            let mut progress = job.progress();
            progress.known = Some(known.as_ref() == b"1");
            progress.running = Some(running.as_ref() == b"1");
            progress.fraction_complete =
                completion_fraction(&numerator, &denominator);
            progress.numerator = Some(numerator);
            progress.denominator = Some(denominator);
        }
        job.notify_changed();
        Ok(())
    }

    async fn handle_option_res(&self, packet: ReceivedPacket) -> Result<()> {
        let Some(Task::OptionReq { completion }) =
            packet.conn.pop_pending_task()
        else {
            error!(
                conn = %packet.conn,
                packet = %packet.packet,
                "unexpected response received to an option request"
            );
            self.connection_lost(&packet.conn);
            return Err(GearmanError::Protocol(
                "unexpected response received to an option request".into(),
            ));
        };

        packet.conn.add_option(packet.packet.argument(0)?);
        completion.send(()).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::timeout;

    use super::*;
    use crate::admin::AdminRequest;
    use crate::testutil::{
        read_line, read_packet, write_raw, write_response, MockServer,
    };

    const TICK: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn job(name: &'static [u8], arguments: &'static [u8]) -> Job {
        Job::new(name, arguments, None)
    }

    async fn connected_client(server: &MockServer) -> Client {
        crate::testutil::init_logging();
        let client = Client::with_client_id("test-client");
        client.add_server(&server.host, server.port).unwrap();
        client.wait_for_server(WAIT).await.unwrap();
        client
    }

    #[test]
    fn test_submit_packet_type_matrix() {
        use Precedence::*;
        assert_eq!(submit_packet_type(false, Normal), PacketType::SubmitJob);
        assert_eq!(submit_packet_type(false, Low), PacketType::SubmitJobLow);
        assert_eq!(submit_packet_type(false, High), PacketType::SubmitJobHigh);
        assert_eq!(submit_packet_type(true, Normal), PacketType::SubmitJobBg);
        assert_eq!(submit_packet_type(true, Low), PacketType::SubmitJobLowBg);
        assert_eq!(
            submit_packet_type(true, High),
            PacketType::SubmitJobHighBg
        );
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::SubmitJob {
                    assert_eq!(
                        packet.data.as_ref(),
                        b"reverse\x00\x00hello"
                    );
                    write_response(&mut socket, PacketType::JobCreated, b"H:1")
                        .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkComplete,
                        b"H:1\x00olleh",
                    )
                    .await;
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        {
            let dispatched = dispatched.clone();
            client.set_timing_reporter(move |ptype, _duration| {
                dispatched.lock().unwrap().push(ptype);
            });
        }

        let job = job(b"reverse", b"hello");
        client
            .submit_job(&job, false, Precedence::Normal, WAIT)
            .await
            .unwrap();
        assert_eq!(job.handle().unwrap().as_ref(), b"H:1");

        timeout(WAIT, job.wait_complete()).await.unwrap();
        assert!(job.is_complete());
        assert!(!job.is_failure());
        assert_eq!(job.data(), vec![Bytes::from_static(b"olleh")]);

        // Every dispatch is reported to the timing hook.
        timeout(WAIT, async {
            while dispatched.lock().unwrap().len() < 2 {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *dispatched.lock().unwrap(),
            vec![PacketType::JobCreated, PacketType::WorkComplete]
        );

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_work_exception_then_fail() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::SubmitJob {
                    write_response(&mut socket, PacketType::JobCreated, b"H:1")
                        .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkException,
                        b"H:1\x00boom",
                    )
                    .await;
                    // The trailing WORK_FAIL references a job that the
                    // exception already retired; it must not clear the
                    // failure outcome.
                    write_response(&mut socket, PacketType::WorkFail, b"H:1")
                        .await;
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let job = job(b"reverse", b"hello");
        client
            .submit_job(&job, false, Precedence::Normal, WAIT)
            .await
            .unwrap();

        timeout(WAIT, job.wait_complete()).await.unwrap();
        assert_eq!(job.exception().unwrap().as_ref(), b"boom");
        assert!(job.is_complete());
        assert!(job.is_failure());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_work_data_and_status_stream() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::SubmitJob {
                    write_response(&mut socket, PacketType::JobCreated, b"H:1")
                        .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkData,
                        b"H:1\x00chunk1",
                    )
                    .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkWarning,
                        b"H:1\x00careful",
                    )
                    .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkStatus,
                        b"H:1\x001\x004",
                    )
                    .await;
                    write_response(
                        &mut socket,
                        PacketType::WorkComplete,
                        b"H:1\x00chunk2",
                    )
                    .await;
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let job = job(b"stream", b"x");
        client
            .submit_job(&job, false, Precedence::Normal, WAIT)
            .await
            .unwrap();

        timeout(WAIT, job.wait_complete()).await.unwrap();
        assert_eq!(
            job.data(),
            vec![
                Bytes::from_static(b"chunk1"),
                Bytes::from_static(b"careful"),
                Bytes::from_static(b"chunk2"),
            ]
        );
        assert!(job.has_warning());
        assert!(!job.is_failure());
        assert_eq!(job.fraction_complete(), Some(0.25));
        assert_eq!(job.numerator().unwrap().as_ref(), b"1");
        assert_eq!(job.denominator().unwrap().as_ref(), b"4");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_submit_and_status_query() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                match packet.ptype {
                    PacketType::SubmitJobBg => {
                        write_response(
                            &mut socket,
                            PacketType::JobCreated,
                            b"H:bg",
                        )
                        .await;
                    }
                    PacketType::GetStatus => {
                        assert_eq!(packet.data.as_ref(), b"H:bg");
                        write_response(
                            &mut socket,
                            PacketType::StatusRes,
                            b"H:bg\x001\x001\x005\x0010",
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let job = job(b"bg", b"payload");
        client
            .submit_job(&job, true, Precedence::High, WAIT)
            .await
            .unwrap();
        assert!(!job.is_complete());

        client.get_status(&job).await.unwrap();
        timeout(WAIT, async {
            while job.known().is_none() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(job.known(), Some(true));
        assert_eq!(job.running(), Some(true));
        assert_eq!(job.fraction_complete(), Some(0.5));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_error_fails_submit() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::SubmitJob {
                    write_response(
                        &mut socket,
                        PacketType::Error,
                        b"ERR_QUEUE_FULL\x00queue is full",
                    )
                    .await;
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let job = job(b"reverse", b"hello");
        let result = client
            .submit_job(&job, false, Precedence::Normal, WAIT)
            .await;
        assert!(matches!(result, Err(GearmanError::Protocol(_))));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_timeout_drops_connection() {
        let server = MockServer::start_single(|mut socket| async move {
            // Swallow everything, answer nothing.
            while read_packet(&mut socket).await.is_some() {}
        })
        .await;

        let client = connected_client(&server).await;
        let job = job(b"reverse", b"hello");
        let result = client
            .submit_job(
                &job,
                false,
                Precedence::Normal,
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(GearmanError::Protocol(_))));
        // The unresponsive server is out of the rotation.
        assert_eq!(client.pool().active_count(), 0);
        assert!(client.pool().has_inactive());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_option_applied_and_replayed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let server = {
            let seen = seen.clone();
            MockServer::start(move |mut socket| {
                let seen = seen.clone();
                async move {
                    while let Some(packet) = read_packet(&mut socket).await {
                        if packet.ptype == PacketType::OptionReq {
                            seen.lock().unwrap().push(packet.data.clone());
                            write_response(
                                &mut socket,
                                PacketType::OptionRes,
                                &packet.data,
                            )
                            .await;
                        }
                    }
                }
            })
            .await
        };

        let client = connected_client(&server).await;
        assert!(client.set_option(&b"exceptions"[..], WAIT).await);

        let conn = client.get_connection().unwrap();
        assert!(conn.has_option(b"exceptions"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Bytes::from_static(b"exceptions")]
        );

        client.shutdown().await;
    }

    // Options set while a server is down must be replayed by the
    // on-connect hook once it comes up.
    #[tokio::test]
    async fn test_option_replayed_on_connect() {
        let client = Client::with_client_id("test-client");
        assert!(client.set_option(&b"exceptions"[..], WAIT).await);

        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::OptionReq {
                    write_response(
                        &mut socket,
                        PacketType::OptionRes,
                        &packet.data,
                    )
                    .await;
                }
            }
        })
        .await;

        client.add_server(&server.host, server.port).unwrap();
        client.wait_for_server(WAIT).await.unwrap();

        let conn = client.get_connection().unwrap();
        timeout(WAIT, async {
            while !conn.has_option(b"exceptions") {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let server = MockServer::start(|mut socket| async move {
            while let Some(packet) = read_packet(&mut socket).await {
                if packet.ptype == PacketType::EchoReq {
                    write_response(
                        &mut socket,
                        PacketType::EchoRes,
                        &packet.data,
                    )
                    .await;
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let conn = client.get_connection().unwrap();
        let payload = conn.echo(&b"ping"[..], WAIT).await.unwrap();
        assert_eq!(payload.as_ref(), b"ping");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_request_roundtrip() {
        let server = MockServer::start(|mut socket| async move {
            loop {
                let Some(line) = read_line(&mut socket).await else {
                    return;
                };
                match line.as_slice() {
                    b"version\n" => write_raw(&mut socket, b"0.1\n").await,
                    b"status\n" => {
                        write_raw(&mut socket, b"reverse\t1\t0\t2\n.\n").await
                    }
                    _ => panic!("unexpected admin command"),
                }
            }
        })
        .await;

        let client = connected_client(&server).await;
        let conn = client.get_connection().unwrap();

        let version = conn
            .send_admin_request(AdminRequest::version(), WAIT)
            .await
            .unwrap();
        assert_eq!(version.as_ref(), b"0.1\n");

        let status = conn
            .send_admin_request(AdminRequest::status(), WAIT)
            .await
            .unwrap();
        assert_eq!(status.as_ref(), b"reverse\t1\t0\t2\n.\n");

        client.shutdown().await;
    }

    fn counting_server(
        counter: Arc<AtomicUsize>,
        handle: &'static [u8],
    ) -> impl Fn(tokio::net::TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
           + Send
           + Sync
           + 'static {
        move |mut socket| {
            let counter = counter.clone();
            Box::pin(async move {
                while let Some(packet) = read_packet(&mut socket).await {
                    if packet.ptype == PacketType::SubmitJob {
                        counter.fetch_add(1, Ordering::SeqCst);
                        write_response(
                            &mut socket,
                            PacketType::JobCreated,
                            handle,
                        )
                        .await;
                        write_response(
                            &mut socket,
                            PacketType::WorkComplete,
                            handle,
                        )
                        .await;
                    }
                }
            })
        }
    }

    // Round-robin fairness over two servers, then failover to the
    // survivor when one goes away.
    #[tokio::test]
    async fn test_round_robin_and_failover() {
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let server_a =
            MockServer::start(counting_server(count_a.clone(), b"H:a")).await;
        let server_b =
            MockServer::start(counting_server(count_b.clone(), b"H:b")).await;

        let client = Client::with_client_id("test-client");
        client.add_server(&server_a.host, server_a.port).unwrap();
        client.add_server(&server_b.host, server_b.port).unwrap();
        timeout(WAIT, async {
            while client.pool().active_count() < 2 {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..4 {
            let job = job(b"reverse", b"hello");
            client
                .submit_job(&job, false, Precedence::Normal, WAIT)
                .await
                .unwrap();
        }
        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);

        // Kill A; its socket closes and the poll task retires it.
        server_a.abort();
        timeout(WAIT, async {
            while client.pool().active_count() != 1 {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();
        assert!(client.pool().has_inactive());

        let before_b = count_b.load(Ordering::SeqCst);
        for _ in 0..2 {
            let job = job(b"reverse", b"hello");
            client
                .submit_job(&job, false, Precedence::Normal, WAIT)
                .await
                .unwrap();
        }
        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), before_b + 2);

        client.shutdown().await;
    }

    // A server that comes up after add_server is promoted by the
    // reconnect task's retry cadence.
    #[tokio::test]
    async fn test_reconnect_promotes_late_server() {
        // Find a free port, then leave it unbound so the first connect
        // attempts fail.
        let probe =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let client = Client::with_client_id("test-client");
        client.add_server("127.0.0.1", port).unwrap();
        assert!(client
            .wait_for_server(Duration::from_millis(300))
            .await
            .is_err());

        let _server = MockServer::start_on_port(port, |mut socket| async move {
            while read_packet(&mut socket).await.is_some() {}
        })
        .await;

        // The reconnect pass retries at a ~2s cadence.
        client.wait_for_server(Duration::from_secs(10)).await.unwrap();
        client.shutdown().await;
    }
}
