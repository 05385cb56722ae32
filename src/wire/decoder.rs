use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Buf;
use tokio_util::codec;

use super::packet::{Packet, HEADER_LEN};
use super::protocol::{Magic, PacketType};
use super::Frame;
use crate::admin::{AdminResponse, PendingAdmin};
use crate::error::GearmanError;

/// The outstanding-admin FIFO, shared between a connection (which pushes
/// when a command is written) and its decoder (which pops when the
/// response terminator is seen).
pub(crate) type AdminQueue = Arc<Mutex<VecDeque<PendingAdmin>>>;

/// Maximum buffer reservation for a single packet payload, to bound
/// re-allocations without trusting the peer's length field outright.
const MAX_PAYLOAD_RESERVATION: usize = 64 * 1024;

/// A decoder for the server side of a Gearman connection: binary response
/// packets interleaved with administrative text responses.
///
/// The first byte of every unit disambiguates: `0x00` opens a binary
/// packet header, anything else is admin text framed by the terminator
/// rule of the request at the head of the admin FIFO. The decoder is
/// resumable at any byte boundary; an in-progress unit is carried in
/// `state` across calls until enough bytes arrive.
#[derive(Debug)]
pub(crate) struct Decoder {
    admin: AdminQueue,
    state: State,
}

#[derive(Clone, Copy, Debug, Default)]
enum State {
    #[default]
    Dispatch,
    Binary {
        magic: Magic,
        ptype: PacketType,
        datalen: usize,
    },
    Admin,
}

impl Decoder {
    pub(crate) fn new(admin: AdminQueue) -> Self {
        Decoder {
            admin,
            state: State::default(),
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;

    type Error = GearmanError;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Dispatch => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    if src[0] != 0x00 {
                        self.state = State::Admin;
                        continue;
                    }
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    // Panic safety: the slices below are in-bounds as
                    // src.len() >= HEADER_LEN was just checked, and a
                    // 4-byte slice always converts to [u8; 4].
                    let magic =
                        Magic::from_bytes(&src[0..4]).ok_or_else(|| {
                            GearmanError::InvalidData(format!(
                                "bad packet magic {:?}",
                                &src[0..4]
                            ))
                        })?;
                    let ptype = PacketType::from_code(u32::from_be_bytes(
                        src[4..8].try_into().unwrap(),
                    ));
                    let datalen = u32::from_be_bytes(
                        src[8..12].try_into().unwrap(),
                    ) as usize;

                    src.reserve(datalen.min(MAX_PAYLOAD_RESERVATION));
                    self.state = State::Binary {
                        magic,
                        ptype,
                        datalen,
                    };
                }
                State::Binary {
                    magic,
                    ptype,
                    datalen,
                } => {
                    if src.len() < HEADER_LEN + datalen {
                        return Ok(None);
                    }

                    // Panic safety: advance and split_to are in-bounds as
                    // src.len() >= HEADER_LEN + datalen.
                    src.advance(HEADER_LEN);
                    let data = src.split_to(datalen).freeze();

                    self.state = State::Dispatch;
                    return Ok(Some(Frame::Packet(Packet {
                        magic,
                        ptype,
                        data,
                    })));
                }
                State::Admin => {
                    let terminator = {
                        let queue = self.admin.lock().unwrap();
                        match queue.front() {
                            Some(pending) => pending.request.terminator(),
                            None => {
                                return Err(GearmanError::Protocol(
                                    "administrative response received with \
                                     no outstanding admin request"
                                        .into(),
                                ))
                            }
                        }
                    };

                    let Some(end) = terminator.find_end(src) else {
                        return Ok(None);
                    };

                    // Panic safety: find_end never reports an end beyond
                    // the scanned buffer.
                    let response = src.split_to(end).freeze();
                    let Some(pending) = self.admin.lock().unwrap().pop_front()
                    else {
                        return Err(GearmanError::Protocol(
                            "admin request queue drained mid-response".into(),
                        ));
                    };

                    self.state = State::Dispatch;
                    return Ok(Some(Frame::Admin(AdminResponse {
                        pending,
                        response,
                    })));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::oneshot;
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::admin::AdminRequest;
    use crate::wire::Codec;

    fn admin_queue(requests: Vec<AdminRequest>) -> AdminQueue {
        let queue = AdminQueue::default();
        for request in requests {
            let (completion, _rx) = oneshot::channel();
            // The receiver is dropped; completion sends are ignored.
            queue.lock().unwrap().push_back(PendingAdmin {
                request,
                completion,
            });
        }
        queue
    }

    fn packet_bytes(ptype: PacketType, data: &[u8]) -> Vec<u8> {
        Packet::response(ptype, data.to_vec()).to_binary().to_vec()
    }

    #[tokio::test]
    async fn test_single_packet() {
        let stream = packet_bytes(PacketType::JobCreated, b"H:1");
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed = FramedRead::new(stream.as_slice(), codec);

        match framed.next().await.unwrap().unwrap() {
            Frame::Packet(p) => {
                assert_eq!(p.magic, Magic::Res);
                assert_eq!(p.ptype, PacketType::JobCreated);
                assert_eq!(p.data.as_ref(), b"H:1");
            }
            other => panic!("expected packet, got {other:?}"),
        }
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_packets_per_read() {
        let mut stream = packet_bytes(PacketType::JobCreated, b"H:1");
        stream.extend(packet_bytes(
            PacketType::WorkComplete,
            b"H:1\x00ol\x00leh",
        ));
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed = FramedRead::new(stream.as_slice(), codec);

        let Frame::Packet(first) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected packet");
        };
        assert_eq!(first.ptype, PacketType::JobCreated);

        let Frame::Packet(second) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected packet");
        };
        assert_eq!(second.ptype, PacketType::WorkComplete);
        // NUL bytes inside the payload survive framing.
        assert_eq!(second.data.as_ref(), b"H:1\x00ol\x00leh");

        assert!(framed.next().await.is_none());
    }

    // Partial delivery: the packet arrives one header, then a payload
    // split across two reads.
    #[tokio::test]
    async fn test_partial_reads() {
        let stream = packet_bytes(PacketType::EchoRes, b"ping-pong");
        let reader = tokio_test::io::Builder::new()
            .read(&stream[..HEADER_LEN])
            .read(&stream[HEADER_LEN..HEADER_LEN + 4])
            .read(&stream[HEADER_LEN + 4..])
            .build();
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed = FramedRead::new(reader, codec);

        let Frame::Packet(p) = framed.next().await.unwrap().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(p.data.as_ref(), b"ping-pong");
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_admin_and_binary_interleave() {
        let mut stream = Vec::new();
        stream.extend(b"fn1\t0\t0\t1\n.\n");
        stream.extend(packet_bytes(PacketType::Noop, b""));
        stream.extend(b"OK\n");
        let queue = admin_queue(vec![
            AdminRequest::status(),
            AdminRequest::cancel_job(&b"H:1"[..]),
        ]);
        let codec = Codec::new(queue.clone());
        let mut framed = FramedRead::new(stream.as_slice(), codec);

        let Frame::Admin(status) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected admin response");
        };
        assert_eq!(status.response.as_ref(), b"fn1\t0\t0\t1\n.\n");
        assert_eq!(
            status.pending.request.command().as_ref(),
            b"status"
        );

        let Frame::Packet(noop) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected packet");
        };
        assert_eq!(noop.ptype, PacketType::Noop);

        let Frame::Admin(cancel) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected admin response");
        };
        assert_eq!(cancel.response.as_ref(), b"OK\n");

        assert!(queue.lock().unwrap().is_empty());
        assert!(framed.next().await.is_none());
    }

    // An admin response delivered byte-by-byte must resume cleanly and
    // leave the request at the head of the FIFO until complete.
    #[tokio::test]
    async fn test_admin_partial_delivery() {
        let response = b"0.1\n";
        let mut builder = tokio_test::io::Builder::new();
        for byte in response.chunks(1) {
            builder.read(byte);
        }
        let reader = builder.build();
        let queue = admin_queue(vec![AdminRequest::version()]);
        let codec = Codec::new(queue.clone());
        let mut framed = FramedRead::new(reader, codec);

        let Frame::Admin(version) = framed.next().await.unwrap().unwrap()
        else {
            panic!("expected admin response");
        };
        assert_eq!(version.response.as_ref(), b"0.1\n");
        assert!(queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_admin_bytes() {
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed = FramedRead::new(&b"surprise\n"[..], codec);

        assert!(matches!(
            framed.next().await.unwrap(),
            Err(GearmanError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let mut stream = b"\x00BAD".to_vec();
        stream.extend([0, 0, 0, 6, 0, 0, 0, 0]);
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed = FramedRead::new(stream.as_slice(), codec);

        assert!(matches!(
            framed.next().await.unwrap(),
            Err(GearmanError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_eos_mid_packet() {
        let stream = packet_bytes(PacketType::EchoRes, b"truncated");
        let codec = Codec::new(admin_queue(vec![]));
        let mut framed =
            FramedRead::new(&stream[..stream.len() - 2], codec);

        // The codec reports leftover bytes at end of stream as an error.
        assert!(framed.next().await.unwrap().is_err());
    }
}
