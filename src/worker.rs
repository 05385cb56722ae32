//! The worker role: declaring abilities and fetching assigned jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::conn::{Connection, RoleState, TlsConfig};
use crate::dispatch::{Dispatcher, ReceivedPacket, TimingReporter};
use crate::error::{GearmanError, Result};
use crate::pool::Pool;
use crate::types::job::{FunctionRecord, WorkerJob};
use crate::wire::{Packet, PacketType};
use crate::{poller, reconnect};

/// Replies to GRAB_JOB should be fast; a connection stuck in GRAB_WAIT
/// longer than this during `stop_waiting_for_jobs` is treated as lost.
const GRAB_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Recheck interval while waiting out GRAB_WAIT connections.
const GRAB_WAIT_POLL: Duration = Duration::from_millis(100);

/// A Gearman worker.
///
/// Registered functions are declared on every connection and re-declared
/// automatically after reconnects. Any number of tasks may block in
/// [`Worker::get_job`] concurrently; each assigned job is delivered to
/// exactly one of them. Construction spawns the instance's two background
/// tasks, so a worker must be created inside a Tokio runtime; call
/// [`Worker::shutdown`] to stop them and close every connection.
pub struct Worker {
    client_id: String,
    core: Arc<WorkerCore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker. The client id is required; it is sent to every
    /// server via SET_CLIENT_ID and shows up in administrative output.
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let (job_tx, job_rx) = flume::unbounded();
        let core = Arc::new(WorkerCore {
            client_id: Bytes::from(client_id.clone().into_bytes()),
            pool: Pool::new(wake),
            broadcast_lock: tokio::sync::Mutex::new(()),
            functions: Mutex::new(HashMap::new()),
            job_lock: tokio::sync::Mutex::new(JobWaiters {
                waiting_for_jobs: 0,
            }),
            job_tx,
            job_rx,
            timing_reporter: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        let span = info_span!("gearman_worker", client_id = %client_id);
        let role: Arc<dyn Dispatcher> = core.clone();
        let poll_task = tokio::spawn(
            poller::run(role.clone(), wake_rx, cancel.clone())
                .instrument(span.clone()),
        );
        let connect_task = tokio::spawn(
            reconnect::run(role, cancel.clone()).instrument(span),
        );

        Worker {
            client_id,
            core,
            cancel,
            tasks: Mutex::new(vec![poll_task, connect_task]),
        }
    }

    /// Compatibility alias for [`Worker::new`].
    #[deprecated(note = "worker_id is a deprecated alias; use Worker::new")]
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self::new(worker_id)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Add a server to the connection pool. Non-blocking; the background
    /// reconnect task establishes the connection and replays the
    /// registered functions on it.
    pub fn add_server(&self, host: &str, port: u16) -> Result<()> {
        self.core.pool.add_server(host, port, None).map(|_| ())
    }

    /// Add a TLS server to the connection pool.
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

    /// The next connection in round-robin rotation, for connection-level
    /// operations such as echo and admin requests.
    pub fn get_connection(&self) -> Result<Arc<Connection>> {
        self.core.pool.get_connection()
    }

    /// Register a function this worker can perform. With a timeout, the
    /// function is declared as CAN_DO_TIMEOUT; the value is the decimal
    /// seconds in bytes form.
    pub async fn register_function(
        &self,
        name: impl Into<Bytes>,
        timeout: Option<Bytes>,
    ) {
        let record = FunctionRecord {
            name: name.into(),
            timeout,
        };
        self.core
            .functions
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());

        let _guard = self.core.broadcast_lock.lock().await;
        self.core.broadcast(can_do_packet(&record)).await;
    }

    /// Withdraw a function from every server.
    pub async fn unregister_function(&self, name: impl AsRef<[u8]>) {
        let name = Bytes::copy_from_slice(name.as_ref());
        self.core.functions.lock().unwrap().remove(&name);

        let _guard = self.core.broadcast_lock.lock().await;
        self.core
            .broadcast(Packet::request(PacketType::CantDo, name))
            .await;
    }

    /// Replace the registered function set wholesale: reset abilities on
    /// every server, then declare the supplied records.
    pub async fn set_functions(&self, functions: Vec<FunctionRecord>) {
        {
            let _guard = self.core.broadcast_lock.lock().await;
            self.core
                .broadcast(Packet::request(
                    PacketType::ResetAbilities,
                    Bytes::new(),
                ))
                .await;
        }
        {
            let mut map = self.core.functions.lock().unwrap();
            map.clear();
            for record in &functions {
                map.insert(record.name.clone(), record.clone());
            }
        }
        for record in functions {
            let _guard = self.core.broadcast_lock.lock().await;
            self.core.broadcast(can_do_packet(&record)).await;
        }
    }

    /// Block until the server assigns a job.
    ///
    /// Re-entrant: many tasks may wait at once, and each assignment is
    /// delivered to exactly one of them. Fails with `Interrupted` when
    /// released by [`Worker::stop_waiting_for_jobs`] or shutdown.
    pub async fn get_job(&self) -> Result<WorkerJob> {
        self.core.get_job().await
    }

    /// Interrupt every task blocked in [`Worker::get_job`].
    pub async fn stop_waiting_for_jobs(&self) {
        self.core.stop_waiting_for_jobs().await;
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

    /// Release all job waiters, stop the background tasks, and close
    /// every connection. The worker may not be used afterwards.
    pub async fn shutdown(&self) {
        if !self.core.pool.is_running() {
            warn!("shutdown called when not currently running; ignoring");
            return;
        }
        debug!("beginning shutdown");
        {
            // get_job checks the running flag under the job guard, so
            // clearing it under the same guard leaves no window between
            // the check and the waiter count changing.
            let _guard = self.core.job_lock.lock().await;
            self.core.pool.set_running(false);
            self.core.pool.notify_all();
        }
        self.core.stop_waiting_for_jobs().await;
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

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn can_do_packet(record: &FunctionRecord) -> Packet {
    match &record.timeout {
        Some(timeout) => {
            let mut payload = BytesMut::with_capacity(
                record.name.len() + 1 + timeout.len(),
            );
            payload.put_slice(&record.name);
            payload.put_u8(0);
            payload.put_slice(timeout);
            Packet::request(PacketType::CanDoTimeout, payload.freeze())
        }
        None => Packet::request(PacketType::CanDo, record.name.clone()),
    }
}

struct JobWaiters {
    /// Number of tasks blocked in `get_job`. Goes negative when the
    /// server over-assigns, which the state machine treats the same as
    /// zero.
    waiting_for_jobs: i64,
}

struct WorkerCore {
    client_id: Bytes,
    pool: Pool,
    /// Serializes multi-connection state changes (the ability set) so the
    /// on-connect replay stays consistent with live registrations.
    broadcast_lock: tokio::sync::Mutex<()>,
    functions: Mutex<HashMap<Bytes, FunctionRecord>>,
    /// Guards the waiter count, the running flag check in `get_job`, and
    /// ordering around queue pushes.
    job_lock: tokio::sync::Mutex<JobWaiters>,
    job_tx: flume::Sender<Option<WorkerJob>>,
    job_rx: flume::Receiver<Option<WorkerJob>>,
    timing_reporter: Mutex<Option<TimingReporter>>,
}

impl WorkerCore {
    async fn get_job(&self) -> Result<WorkerJob> {
        let queued = {
            let mut waiters = self.job_lock.lock().await;
            if !self.pool.is_running() {
                return Err(GearmanError::Interrupted);
            }
            waiters.waiting_for_jobs += 1;
            debug!(
                waiting = waiters.waiting_for_jobs,
                "task waiting for a job"
            );

            let queued = self.job_rx.try_recv().ok();
            if queued.is_none() {
                self.update_state_machines(&waiters).await;
            }
            queued
        };

        let item = match queued {
            Some(item) => item,
            None => self
                .job_rx
                .recv_async()
                .await
                .map_err(|_| GearmanError::Interrupted)?,
        };

        match item {
            Some(job) => {
                debug!(handle = ?job.handle(), "received job");
                Ok(job)
            }
            None => Err(GearmanError::Interrupted),
        }
    }

    async fn stop_waiting_for_jobs(&self) {
        let mut waiters = self.job_lock.lock().await;
        loop {
            let now = Instant::now();
            let mut ok = true;
            for conn in self.pool.snapshot_active() {
                if conn.role_state() == RoleState::GrabWait {
                    if now - conn.state_since() > GRAB_WAIT_TIMEOUT {
                        self.connection_lost(&conn);
                    } else {
                        ok = false;
                    }
                }
            }
            if ok {
                break;
            }
            // Let in-flight GRAB_JOB responses land before draining.
            drop(waiters);
            tokio::time::sleep(GRAB_WAIT_POLL).await;
            waiters = self.job_lock.lock().await;
        }

        while waiters.waiting_for_jobs > 0 {
            waiters.waiting_for_jobs -= 1;
            self.job_tx.send(None).ok();
        }
        self.update_state_machines(&waiters).await;
    }

    /// Drive the per-connection sleep/grab state machine across the
    /// whole pool. Idle connections fetch while waiters remain; every
    /// connection falls back to IDLE once no waiters are left.
    async fn update_state_machines(&self, waiters: &JobWaiters) {
        for conn in self.pool.snapshot_active() {
            if conn.role_state() == RoleState::Idle
                && waiters.waiting_for_jobs > 0
            {
                let grab = Packet::request(
                    PacketType::GrabJobUniq,
                    Bytes::new(),
                );
                if self.send_to(&conn, grab).await.is_ok() {
                    conn.change_state(RoleState::GrabWait);
                }
            }
            if conn.role_state() != RoleState::Idle
                && waiters.waiting_for_jobs < 1
            {
                conn.change_state(RoleState::Idle);
            }
        }
    }

    async fn assign_job(
        &self,
        packet: &ReceivedPacket,
        handle: Bytes,
        name: Bytes,
        arguments: Bytes,
        unique: Option<Bytes>,
    ) -> Result<()> {
        let job = WorkerJob::new(
            handle,
            name,
            arguments,
            unique,
            Arc::downgrade(&packet.conn),
        );

        let mut waiters = self.job_lock.lock().await;
        packet.conn.change_state(RoleState::Idle);
        waiters.waiting_for_jobs -= 1;
        debug!(
            waiting = waiters.waiting_for_jobs,
            "job assigned"
        );
        self.job_tx.send(Some(job)).ok();

        self.update_state_machines(&waiters).await;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for WorkerCore {
    fn pool(&self) -> &Pool {
        &self.pool
    }

    fn report_timing_stats(&self, ptype: PacketType, duration: Duration) {
        if let Some(report) = self.timing_reporter.lock().unwrap().as_ref() {
            report(ptype, duration);
        }
    }

    /// Identify this worker and replay every registered function, then
    /// move the fresh connection to IDLE so the state machine can use it.
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()> {
        let _guard = self.broadcast_lock.lock().await;
        conn.send_packet(Packet::request(
            PacketType::SetClientId,
            self.client_id.clone(),
        ))
        .await?;

        let functions: Vec<FunctionRecord> =
            self.functions.lock().unwrap().values().cloned().collect();
        for record in functions {
            conn.send_packet(can_do_packet(&record)).await?;
        }

        conn.change_state(RoleState::Idle);
        Ok(())
    }

    /// A newly active connection should fetch immediately if tasks are
    /// already waiting for jobs.
    async fn on_active(&self, _conn: &Arc<Connection>) {
        let waiters = self.job_lock.lock().await;
        if waiters.waiting_for_jobs > 0 {
            self.update_state_machines(&waiters).await;
        }
    }

    /// NOOP wakes a sleeping connection: grab a job.
    async fn handle_noop(&self, packet: ReceivedPacket) -> Result<()> {
        let _waiters = self.job_lock.lock().await;
        if packet.conn.role_state() == RoleState::Sleep {
            debug!(conn = %packet.conn, "sending GRAB_JOB_UNIQ");
            self.send_to(
                &packet.conn,
                Packet::request(PacketType::GrabJobUniq, Bytes::new()),
            )
            .await?;
            packet.conn.change_state(RoleState::GrabWait);
        } else {
            debug!(conn = %packet.conn, "received unexpected NOOP packet");
        }
        Ok(())
    }

    /// NO_JOB answers a grab that found nothing: go to sleep until the
    /// server sends NOOP.
    async fn handle_no_job(&self, packet: ReceivedPacket) -> Result<()> {
        let _waiters = self.job_lock.lock().await;
        if packet.conn.role_state() == RoleState::GrabWait {
            debug!(conn = %packet.conn, "sending PRE_SLEEP");
            self.send_to(
                &packet.conn,
                Packet::request(PacketType::PreSleep, Bytes::new()),
            )
            .await?;
            packet.conn.change_state(RoleState::Sleep);
        } else {
            debug!(conn = %packet.conn, "received unexpected NO_JOB packet");
        }
        Ok(())
    }

    async fn handle_job_assign(&self, packet: ReceivedPacket) -> Result<()> {
        let handle = packet.packet.argument(0)?;
        let name = packet.packet.argument(1)?;
        let arguments = packet.packet.argument_rest(2);
        self.assign_job(&packet, handle, name, arguments, None).await
    }

    /// JOB_ASSIGN_UNIQ carries the unique key submitted with the job; an
    /// empty key means the submitter supplied none.
    async fn handle_job_assign_uniq(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        let handle = packet.packet.argument(0)?;
        let name = packet.packet.argument(1)?;
        let unique = packet.packet.argument(2)?;
        let unique = if unique.is_empty() {
            None
        } else {
            Some(unique)
        };
        let arguments = packet.packet.argument_rest(3);
        self.assign_job(&packet, handle, name, arguments, unique).await
    }
}
