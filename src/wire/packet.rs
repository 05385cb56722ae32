use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::{Magic, PacketType};
use crate::error::{GearmanError, Result};

/// Size of the fixed `magic ‖ type ‖ length` packet header.
pub const HEADER_LEN: usize = 12;

/// A single binary protocol packet.
///
/// Payload arguments are NUL-separated; the final argument of a packet may
/// itself contain NULs and is always read with [`Packet::argument_rest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub magic: Magic,
    pub ptype: PacketType,
    pub data: Bytes,
}

impl Packet {
    /// Build an outbound request packet.
    pub fn request(ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Packet {
            magic: Magic::Req,
            ptype,
            data: data.into(),
        }
    }

    /// Build a response packet, as a server peer would send it.
    pub fn response(ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Packet {
            magic: Magic::Res,
            ptype,
            data: data.into(),
        }
    }

    /// Serialize to the 12-byte header followed by the payload.
    pub fn to_binary(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        self.put(&mut buf);
        buf.freeze()
    }

    /// Append the wire form to `dst`.
    pub(crate) fn put(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.data.len());
        dst.put_slice(self.magic.as_bytes());
        dst.put_u32(self.ptype.code());
        dst.put_u32(self.data.len() as u32);
        dst.put_slice(&self.data);
    }

    /// Get the nth NUL-separated argument from the payload.
    ///
    /// Fails with `InvalidData` when the payload has fewer arguments,
    /// which for a response packet means the server sent a malformed
    /// payload for its type.
    pub fn argument(&self, index: usize) -> Result<Bytes> {
        self.split_arguments().nth(index).ok_or_else(|| {
            GearmanError::InvalidData(format!(
                "packet {} has no argument {index}",
                self.ptype
            ))
        })
    }

    /// Get the nth argument and everything after it, NULs included.
    ///
    /// This is how the final argument of a packet must be read, since only
    /// the preceding arguments are NUL-free. Returns an empty value when
    /// the payload has fewer arguments.
    pub fn argument_rest(&self, index: usize) -> Bytes {
        let mut start = 0usize;
        for _ in 0..index {
            match self.data[start..].iter().position(|&b| b == 0) {
                Some(pos) => start += pos + 1,
                None => return Bytes::new(),
            }
        }
        self.data.slice(start..)
    }

    fn split_arguments(&self) -> impl Iterator<Item = Bytes> + '_ {
        let data = self.data.clone();
        let mut start = Some(0usize);
        std::iter::from_fn(move || {
            let s = start?;
            match data[s..].iter().position(|&b| b == 0) {
                Some(pos) => {
                    let arg = data.slice(s..s + pos);
                    start = Some(s + pos + 1);
                    Some(arg)
                }
                None => {
                    let arg = data.slice(s..);
                    start = None;
                    Some(arg)
                }
            }
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} ({} bytes)",
            self.magic,
            self.ptype,
            self.data.len()
        )
    }
}
