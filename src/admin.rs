//! Requests on the line-based administrative sideband.
//!
//! Admin commands share the socket with binary packets; the decoder tells
//! the two apart by the first buffered byte of each unit. Responses carry
//! no correlation id, so outstanding requests are matched to responses
//! strictly in FIFO order per connection.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

/// How the server terminates the response to an admin command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminator {
    /// Response ends at a line containing only `.`: `\n.\n`, `\r\n.\r\n`,
    /// or a leading `.\n` / `.\r\n` when the dot stands alone.
    DotLine,
    /// Response is a single line ending at the first `\n`.
    FirstLine,
}

impl Terminator {
    /// Scan `data` for a complete response, returning the length of the
    /// response including the terminator.
    ///
    /// The bare-newline form is preferred over the CRLF form when both
    /// occur, matching how servers in the wild intermix them.
    pub(crate) fn find_end(self, data: &[u8]) -> Option<usize> {
        match self {
            Terminator::DotLine => {
                if let Some(idx) =
                    data.windows(3).position(|w| w == b"\n.\n")
                {
                    return Some(idx + 3);
                }
                if let Some(idx) =
                    data.windows(5).position(|w| w == b"\r\n.\r\n")
                {
                    return Some(idx + 5);
                }
                if data.starts_with(b".\n") {
                    Some(2)
                } else if data.starts_with(b".\r\n") {
                    Some(3)
                } else {
                    None
                }
            }
            Terminator::FirstLine => {
                data.iter().position(|&b| b == b'\n').map(|idx| idx + 1)
            }
        }
    }
}

/// An administrative request and the rule for framing its response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdminRequest {
    command: Bytes,
    arguments: Vec<Bytes>,
    terminator: Terminator,
}

impl AdminRequest {
    /// The `status` command: per-function queue and worker counts.
    pub fn status() -> Self {
        Self::dot_terminated("status")
    }

    /// The `show jobs` command.
    pub fn show_jobs() -> Self {
        Self::dot_terminated("show jobs")
    }

    /// The `show unique jobs` command.
    pub fn show_unique_jobs() -> Self {
        Self::dot_terminated("show unique jobs")
    }

    /// The `workers` command: one line per connected worker.
    pub fn workers() -> Self {
        Self::dot_terminated("workers")
    }

    /// The `cancel job <handle>` command. Single-line response.
    pub fn cancel_job(handle: impl Into<Bytes>) -> Self {
        AdminRequest {
            command: Bytes::from_static(b"cancel job"),
            arguments: vec![handle.into()],
            terminator: Terminator::FirstLine,
        }
    }

    /// The `version` command. Single-line response.
    pub fn version() -> Self {
        AdminRequest {
            command: Bytes::from_static(b"version"),
            arguments: Vec::new(),
            terminator: Terminator::FirstLine,
        }
    }

    fn dot_terminated(command: &'static str) -> Self {
        AdminRequest {
            command: Bytes::from_static(command.as_bytes()),
            arguments: Vec::new(),
            terminator: Terminator::DotLine,
        }
    }

    pub fn command(&self) -> &Bytes {
        &self.command
    }

    pub(crate) fn terminator(&self) -> Terminator {
        self.terminator
    }

    /// The full command line sent on the wire, newline included.
    pub(crate) fn command_line(&self) -> Bytes {
        let mut line = BytesMut::with_capacity(self.command.len() + 16);
        line.put_slice(&self.command);
        for arg in &self.arguments {
            line.put_u8(b' ');
            line.put_slice(arg);
        }
        line.put_u8(b'\n');
        line.freeze()
    }
}

/// An admin request waiting on its response, queued on a connection's
/// outstanding-admin FIFO shared with the frame decoder.
#[derive(Debug)]
pub(crate) struct PendingAdmin {
    pub request: AdminRequest,
    pub completion: oneshot::Sender<Bytes>,
}

/// A completed admin exchange, emitted by the decoder once the response
/// terminator is seen.
#[derive(Debug)]
pub(crate) struct AdminResponse {
    pub pending: PendingAdmin,
    pub response: Bytes,
}
