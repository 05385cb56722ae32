//! The set of server connections behind a client or worker instance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::conn::{Connection, TlsConfig};
use crate::error::{GearmanError, Result};
use crate::poller::{ConnStream, PollerMsg};
use crate::types::job::Job;

/// Active and inactive connections plus the round-robin cursor, guarded by
/// a single lock. Every mutation notifies the condition so the background
/// tasks and `wait_for_server` re-evaluate their predicates, and pokes the
/// poll task through the wake channel so active-set changes take effect on
/// the next readiness pass.
#[derive(Debug)]
pub(crate) struct Pool {
    state: Mutex<PoolState>,
    running: AtomicBool,
    cond: Notify,
    wake: mpsc::UnboundedSender<PollerMsg>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct PoolState {
    active: Vec<Arc<Connection>>,
    inactive: Vec<Arc<Connection>>,
    cursor: isize,
}

impl Pool {
    pub(crate) fn new(wake: mpsc::UnboundedSender<PollerMsg>) -> Self {
        Pool {
            state: Mutex::new(PoolState {
                active: Vec::new(),
                inactive: Vec::new(),
                cursor: -1,
            }),
            running: AtomicBool::new(true),
            cond: Notify::new(),
            wake,
            next_id: AtomicU64::new(0),
        }
    }

    /// Add a server to the pool. The new connection starts out inactive;
    /// the reconnect task picks it up from there. Duplicate host/port
    /// pairs are refused.
    pub(crate) fn add_server(
        &self,
        host: &str,
        port: u16,
        tls: Option<TlsConfig>,
    ) -> Result<Arc<Connection>> {
        debug!(host, port, "adding server");
        let conn = {
            let mut state = self.state.lock().unwrap();
            if state
                .active
                .iter()
                .chain(state.inactive.iter())
                .any(|c| c.host() == host && c.port() == port)
            {
                return Err(GearmanError::Configuration(format!(
                    "server {host}:{port} already added"
                )));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection::new(id, host, port, tls));
            state.inactive.push(conn.clone());
            conn
        };
        self.cond.notify_waiters();
        Ok(conn)
    }

    /// The next connection in round-robin rotation.
    pub(crate) fn get_connection(&self) -> Result<Arc<Connection>> {
        let mut state = self.state.lock().unwrap();
        if state.active.is_empty() {
            return Err(GearmanError::NoConnectedServers);
        }
        state.cursor += 1;
        if state.cursor >= state.active.len() as isize {
            state.cursor = 0;
        }
        Ok(state.active[state.cursor as usize].clone())
    }

    pub(crate) fn snapshot_active(&self) -> Vec<Arc<Connection>> {
        self.state.lock().unwrap().active.clone()
    }

    pub(crate) fn snapshot_inactive(&self) -> Vec<Arc<Connection>> {
        self.state.lock().unwrap().inactive.clone()
    }

    pub(crate) fn active_ids(&self) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .active
            .iter()
            .map(|c| c.id())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub(crate) fn has_inactive(&self) -> bool {
        !self.state.lock().unwrap().inactive.is_empty()
    }

    /// Promote a freshly connected connection into the active set and hand
    /// its read stream to the poll task.
    pub(crate) fn activate(&self, conn: &Arc<Connection>, stream: ConnStream) {
        {
            let mut state = self.state.lock().unwrap();
            state.inactive.retain(|c| !Arc::ptr_eq(c, conn));
            if !state.active.iter().any(|c| Arc::ptr_eq(c, conn)) {
                state.active.push(conn.clone());
            }
        }
        self.cond.notify_waiters();
        self.wake
            .send(PollerMsg::Add {
                conn: conn.clone(),
                stream,
            })
            .ok();
    }

    /// Move a faulty connection to the inactive set and return its
    /// in-flight jobs so the role can surface the disconnect. Safe to call
    /// more than once for the same connection.
    pub(crate) fn mark_lost(&self, conn: &Arc<Connection>) -> Vec<Job> {
        debug!(conn = %conn, "marking connection as disconnected");
        let jobs = conn.take_related_jobs();
        {
            let mut state = self.state.lock().unwrap();
            state.active.retain(|c| !Arc::ptr_eq(c, conn));
            if !state.inactive.iter().any(|c| Arc::ptr_eq(c, conn)) {
                state.inactive.push(conn.clone());
            }
        }
        self.cond.notify_waiters();
        self.wake.send(PollerMsg::Remove { id: conn.id() }).ok();
        jobs
    }

    /// Block until at least one active connection exists.
    pub(crate) async fn wait_for_server(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                if !self.is_running() {
                    return Err(GearmanError::Interrupted);
                }
                let mut notified = std::pin::pin!(self.cond.notified());
                notified.as_mut().enable();
                if !self.state.lock().unwrap().active.is_empty() {
                    debug!("active connection found");
                    return Ok(());
                }
                debug!("waiting for at least one active connection");
                notified.await;
            }
        })
        .await
        .map_err(|_| {
            GearmanError::Timeout("an active server connection".into())
        })?
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.cond.notified()
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_waiters();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Empty both lists, returning the connections that were active so
    /// shutdown can close them.
    pub(crate) fn drain_connections(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.lock().unwrap();
        let active = std::mem::take(&mut state.active);
        state.inactive.clear();
        active
    }
}
