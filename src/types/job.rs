use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::conn::Connection;
use crate::error::{GearmanError, Result};
use crate::wire::{Packet, PacketType};

/// Scheduling precedence of a submitted job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Precedence {
    #[default]
    Normal,
    Low,
    High,
}

/// A function a worker declares it can perform.
///
/// If a timeout is supplied the function is registered with
/// CAN_DO_TIMEOUT; the value is the decimal number of seconds, in bytes,
/// exactly as it appears on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionRecord {
    pub name: Bytes,
    pub timeout: Option<Bytes>,
}

impl FunctionRecord {
    pub fn new(name: impl Into<Bytes>) -> Self {
        FunctionRecord {
            name: name.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(
        name: impl Into<Bytes>,
        timeout: impl Into<Bytes>,
    ) -> Self {
        FunctionRecord {
            name: name.into(),
            timeout: Some(timeout.into()),
        }
    }
}

/// A job submitted (or being submitted) to a Gearman server.
///
/// The handle is shared: clones refer to the same job, and the background
/// poll task updates its state as responses arrive. For a foreground job,
/// result chunks accumulate in `data` until one of WORK_COMPLETE,
/// WORK_FAIL, or WORK_EXCEPTION marks it complete. `failure` is only ever
/// set alongside `complete`.
#[derive(Clone, Debug)]
pub struct Job {
    inner: Arc<JobInner>,
}

#[derive(Debug)]
struct JobInner {
    name: Bytes,
    arguments: Bytes,
    unique: Option<Bytes>,
    progress: Mutex<JobProgress>,
    changed: Notify,
}

#[derive(Debug, Default)]
pub(crate) struct JobProgress {
    pub handle: Option<Bytes>,
    pub data: Vec<Bytes>,
    pub exception: Option<Bytes>,
    pub warning: bool,
    pub complete: bool,
    pub failure: bool,
    pub numerator: Option<Bytes>,
    pub denominator: Option<Bytes>,
    pub fraction_complete: Option<f64>,
    pub known: Option<bool>,
    pub running: Option<bool>,
    pub connection: Option<Weak<Connection>>,
}

impl Job {
    /// Create a job for `name` with an opaque argument blob and an
    /// optional unique key for server-side deduplication.
    pub fn new(
        name: impl Into<Bytes>,
        arguments: impl Into<Bytes>,
        unique: Option<Bytes>,
    ) -> Self {
        Job {
            inner: Arc::new(JobInner {
                name: name.into(),
                arguments: arguments.into(),
                unique,
                progress: Mutex::new(JobProgress::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &Bytes {
        &self.inner.name
    }

    pub fn arguments(&self) -> &Bytes {
        &self.inner.arguments
    }

    pub fn unique(&self) -> Option<&Bytes> {
        self.inner.unique.as_ref()
    }

    /// The server-assigned handle, if the job has been accepted.
    pub fn handle(&self) -> Option<Bytes> {
        self.progress().handle.clone()
    }

    /// The result chunks received so far. Depending on the worker, these
    /// may need to be concatenated before use.
    pub fn data(&self) -> Vec<Bytes> {
        self.progress().data.clone()
    }

    pub fn exception(&self) -> Option<Bytes> {
        self.progress().exception.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.progress().complete
    }

    pub fn is_failure(&self) -> bool {
        self.progress().failure
    }

    pub fn has_warning(&self) -> bool {
        self.progress().warning
    }

    pub fn numerator(&self) -> Option<Bytes> {
        self.progress().numerator.clone()
    }

    pub fn denominator(&self) -> Option<Bytes> {
        self.progress().denominator.clone()
    }

    /// Completion ratio from the last WORK_STATUS or STATUS_RES, if the
    /// reported denominator was numeric and non-zero.
    pub fn fraction_complete(&self) -> Option<f64> {
        self.progress().fraction_complete
    }

    /// Whether the server knows this job; set by a status query.
    pub fn known(&self) -> Option<bool> {
        self.progress().known
    }

    /// Whether the job is running; set by a status query.
    pub fn running(&self) -> Option<bool> {
        self.progress().running
    }

    /// Wait until a terminal event (complete, fail, or exception) has
    /// been recorded for this job.
    pub async fn wait_complete(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.changed.notified());
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn progress(&self) -> MutexGuard<'_, JobProgress> {
        self.inner.progress.lock().unwrap()
    }

    pub(crate) fn notify_changed(&self) {
        self.inner.changed.notify_waiters();
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.progress()
            .connection
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

/// Parse a completion fraction the way status payloads report it.
///
/// Returns None when either side is non-numeric or the denominator is
/// zero.
pub(crate) fn completion_fraction(
    numerator: &[u8],
    denominator: &[u8],
) -> Option<f64> {
    let numerator: f64 =
        std::str::from_utf8(numerator).ok()?.trim().parse().ok()?;
    let denominator: f64 =
        std::str::from_utf8(denominator).ok()?.trim().parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

/// A job the server has assigned to this worker process.
///
/// Returned by `Worker::get_job`. The send methods report progress and
/// results back to the submitting client via the connection the job
/// arrived on.
#[derive(Clone, Debug)]
pub struct WorkerJob {
    handle: Bytes,
    name: Bytes,
    arguments: Bytes,
    unique: Option<Bytes>,
    connection: Weak<Connection>,
}

impl WorkerJob {
    pub(crate) fn new(
        handle: Bytes,
        name: Bytes,
        arguments: Bytes,
        unique: Option<Bytes>,
        connection: Weak<Connection>,
    ) -> Self {
        WorkerJob {
            handle,
            name,
            arguments,
            unique,
            connection,
        }
    }

    pub fn handle(&self) -> &Bytes {
        &self.handle
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn arguments(&self) -> &Bytes {
        &self.arguments
    }

    pub fn unique(&self) -> Option<&Bytes> {
        self.unique.as_ref()
    }

    /// Send a WORK_DATA packet with a partial result.
    pub async fn send_work_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(PacketType::WorkData, Some(data.into())).await
    }

    /// Send a WORK_WARNING packet.
    pub async fn send_work_warning(
        &self,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(PacketType::WorkWarning, Some(data.into())).await
    }

    /// Report progress as a completion fraction.
    pub async fn send_work_status(
        &self,
        numerator: u64,
        denominator: u64,
    ) -> Result<()> {
        let status = format!("{numerator}\x00{denominator}");
        self.send(PacketType::WorkStatus, Some(status.into())).await
    }

    /// Report success, with the final result payload.
    pub async fn send_work_complete(
        &self,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(PacketType::WorkComplete, Some(data.into())).await
    }

    /// Report failure.
    pub async fn send_work_fail(&self) -> Result<()> {
        self.send(PacketType::WorkFail, None).await
    }

    /// Report failure with exception data.
    pub async fn send_work_exception(
        &self,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(PacketType::WorkException, Some(data.into()))
            .await
    }

    async fn send(&self, ptype: PacketType, data: Option<Bytes>) -> Result<()> {
        let conn = self.connection.upgrade().ok_or_else(|| {
            GearmanError::Connection(
                "the connection this job arrived on is gone".into(),
            )
        })?;

        let mut payload =
            BytesMut::with_capacity(self.handle.len() + 1 + 16);
        payload.put_slice(&self.handle);
        if let Some(data) = data {
            payload.put_u8(0);
            payload.put_slice(&data);
        }

        conn.send_packet(Packet::request(ptype, payload.freeze())).await
    }
}
