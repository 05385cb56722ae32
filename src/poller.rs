//! The background task that reads every active connection.
//!
//! One poll task serves all of an instance's connections: it drives each
//! connection's framed read stream, hands binary packets to the role's
//! dispatch, and completes admin exchanges. Connection loss, whether an
//! orderly close or a read error, is detected here and handed to the pool.
//!
//! Active-set changes arrive over the wake channel, so a readiness pass
//! never races against a descriptor that was closed out from under it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::conn::{Connection, GearStream};
use crate::dispatch::{Dispatcher, ReceivedPacket};
use crate::error::GearmanError;
use crate::wire::{AdminQueue, Codec, Frame};

/// The framed read side of one connection.
pub(crate) type ConnStream =
    Pin<Box<dyn Stream<Item = Result<Frame, GearmanError>> + Send>>;

/// Wake messages that mutate the polled set.
pub(crate) enum PollerMsg {
    Add {
        conn: Arc<Connection>,
        stream: ConnStream,
    },
    Remove {
        id: u64,
    },
}

/// Frame a connection's read half for polling.
pub(crate) fn conn_stream(
    read: ReadHalf<GearStream>,
    admin: AdminQueue,
) -> ConnStream {
    let framed = FramedRead::new(read, Codec::new(admin));
    // A peer performing an orderly shutdown simply ends the stream;
    // chain a final error so the poll loop observes the loss.
    Box::pin(framed.chain(tokio_stream::once(Err(
        GearmanError::Connection("connection closed by peer".into()),
    ))))
}

pub(crate) async fn run(
    role: Arc<dyn Dispatcher>,
    mut wake: mpsc::UnboundedReceiver<PollerMsg>,
    cancel: CancellationToken,
) {
    let mut streams: StreamMap<u64, ConnStream> = StreamMap::new();
    let mut conns: HashMap<u64, Arc<Connection>> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = wake.recv() => match msg {
                None => break,
                Some(PollerMsg::Add { conn, stream }) => {
                    debug!(conn = %conn, "polling new connection");
                    streams.insert(conn.id(), stream);
                    conns.insert(conn.id(), conn);
                }
                Some(PollerMsg::Remove { id }) => {
                    streams.remove(&id);
                    conns.remove(&id);
                }
            },
            Some((id, item)) = streams.next(), if !streams.is_empty() => {
                let Some(conn) = conns.get(&id).cloned() else {
                    streams.remove(&id);
                    continue;
                };
                match item {
                    Ok(Frame::Packet(packet)) => {
                        role.dispatch(ReceivedPacket { packet, conn }).await;
                    }
                    Ok(Frame::Admin(response)) => {
                        role.handle_admin_response(response);
                    }
                    Err(error) => {
                        error!(conn = %conn, %error, "error reading from connection");
                        streams.remove(&id);
                        conns.remove(&id);
                        role.connection_lost(&conn);
                    }
                }
            }
        }
    }
    debug!("poll task exiting");
}
