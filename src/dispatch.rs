//! Packet dispatch shared by the client and worker roles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::admin::AdminResponse;
use crate::conn::Connection;
use crate::error::{GearmanError, Result};
use crate::pool::Pool;
use crate::types::job::Job;
use crate::wire::{Packet, PacketType};

/// A callback fed the type and wall-clock duration of every dispatched
/// packet.
pub(crate) type TimingReporter =
    Box<dyn Fn(PacketType, Duration) + Send + Sync>;

/// A packet along with the connection it arrived on.
#[derive(Debug)]
pub(crate) struct ReceivedPacket {
    pub packet: Packet,
    pub conn: Arc<Connection>,
}

impl ReceivedPacket {
    /// Look up the in-flight job the handle in this packet refers to.
    pub(crate) fn related_job(&self) -> Result<(bytes::Bytes, Job)> {
        let handle = self.packet.argument(0)?;
        let job = self.conn.related_job(&handle).ok_or_else(|| {
            GearmanError::UnknownJob(
                String::from_utf8_lossy(&handle).into_owned(),
            )
        })?;
        Ok((handle, job))
    }
}

/// Role behavior hung off the shared connection machinery.
///
/// `dispatch` routes each inbound packet by type; roles override the
/// handlers for the types they understand and inherit a logging fallback
/// for the rest. The shared ERROR and ECHO_RES handling lives here because
/// both roles need it.
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    fn pool(&self) -> &Pool;

    /// Run by the reconnect task right after a connection is opened,
    /// before it joins the active set. An error leaves the connection
    /// inactive to be retried.
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Run right after a connection joins the active set.
    async fn on_active(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// Called once per in-flight job on a connection that was lost.
    fn handle_disconnect(&self, job: Job) {
        debug!(name = ?job.name(), "job affected by disconnect");
    }

    /// Reporting hook fed the type and wall-clock duration of every
    /// dispatch; the default does nothing, so observability can be
    /// layered on without touching the dispatch core.
    fn report_timing_stats(&self, ptype: PacketType, duration: Duration) {
        let _ = (ptype, duration);
    }

    /// Mark a connection lost and surface its jobs to the disconnect
    /// hook. The reconnect task takes it from there.
    fn connection_lost(&self, conn: &Arc<Connection>) {
        for job in self.pool().mark_lost(conn) {
            self.handle_disconnect(job);
        }
    }

    /// Send to a single connection, discarding it from the active set on
    /// failure.
    async fn send_to(
        &self,
        conn: &Arc<Connection>,
        packet: Packet,
    ) -> Result<()> {
        if let Err(error) = conn.send_packet(packet).await {
            error!(conn = %conn, %error, "error sending packet");
            self.connection_lost(conn);
            return Err(error);
        }
        Ok(())
    }

    /// Send to every active connection. A failure marks that connection
    /// lost but does not abort the broadcast.
    async fn broadcast(&self, packet: Packet) {
        for conn in self.pool().snapshot_active() {
            // Error handling is all done by send_to.
            let _ = self.send_to(&conn, packet.clone()).await;
        }
    }

    /// Route one inbound packet to its handler.
    async fn dispatch(&self, packet: ReceivedPacket) {
        debug!(conn = %packet.conn, packet = %packet.packet, "received packet");
        let ptype = packet.packet.ptype;
        let start = Instant::now();

        let result = match ptype {
            PacketType::JobCreated => self.handle_job_created(packet).await,
            PacketType::WorkComplete => {
                self.handle_work_complete(packet).await
            }
            PacketType::WorkFail => self.handle_work_fail(packet).await,
            PacketType::WorkException => {
                self.handle_work_exception(packet).await
            }
            PacketType::WorkData => self.handle_work_data(packet).await,
            PacketType::WorkWarning => self.handle_work_warning(packet).await,
            PacketType::WorkStatus => self.handle_work_status(packet).await,
            PacketType::StatusRes => self.handle_status_res(packet).await,
            PacketType::OptionRes => self.handle_option_res(packet).await,
            PacketType::JobAssign => self.handle_job_assign(packet).await,
            PacketType::JobAssignUniq => {
                self.handle_job_assign_uniq(packet).await
            }
            PacketType::NoJob => self.handle_no_job(packet).await,
            PacketType::Noop => self.handle_noop(packet).await,
            PacketType::EchoRes => self.handle_echo_res(packet).await,
            PacketType::Error => self.handle_error(packet).await,
            PacketType::Unknown(code) => {
                error!(conn = %packet.conn, code, "received unknown packet");
                Ok(())
            }
            _ => self.unhandled(packet),
        };

        if let Err(error) = result {
            error!(%error, "error handling packet");
        }
        self.report_timing_stats(ptype, start.elapsed());
    }

    async fn handle_job_created(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_complete(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_fail(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_exception(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_data(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_warning(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_work_status(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_status_res(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_option_res(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_job_assign(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_job_assign_uniq(
        &self,
        packet: ReceivedPacket,
    ) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_no_job(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    async fn handle_noop(&self, packet: ReceivedPacket) -> Result<()> {
        self.unhandled(packet)
    }

    /// Release the waiter blocked on this echo payload, if one remains.
    async fn handle_echo_res(&self, packet: ReceivedPacket) -> Result<()> {
        let payload = packet.packet.argument_rest(0);
        packet.conn.handle_echo_res(payload);
        Ok(())
    }

    /// Log the server error and unblock exactly one pending task so its
    /// caller sees a surfaced failure instead of a deadlock.
    async fn handle_error(&self, packet: ReceivedPacket) -> Result<()> {
        error!(
            conn = %packet.conn,
            code = ?packet.packet.argument(0).unwrap_or_default(),
            message = ?packet.packet.argument_rest(1),
            "received ERROR packet"
        );
        match packet.conn.pop_pending_task() {
            Some(task) => {
                task.complete();
                Ok(())
            }
            None => {
                self.connection_lost(&packet.conn);
                Err(GearmanError::Protocol(
                    "ERROR packet received with no pending task".into(),
                ))
            }
        }
    }

    fn unhandled(&self, packet: ReceivedPacket) -> Result<()> {
        error!(conn = %packet.conn, packet = %packet.packet, "received unhandled packet");
        Ok(())
    }

    /// Complete an administrative exchange by releasing its waiter.
    fn handle_admin_response(&self, response: AdminResponse) {
        debug!(
            command = ?response.pending.request.command(),
            "received admin response"
        );
        response.pending.completion.send(response.response).ok();
    }
}
