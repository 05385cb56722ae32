//! Wire codec for the Gearman binary protocol and its administrative
//! text sideband.

use tokio_util::codec;

use crate::admin::AdminResponse;
use crate::error::GearmanError;

pub(crate) mod decoder;
pub(crate) mod encoder;
pub mod packet;
pub mod protocol;

pub use packet::Packet;
pub use protocol::{Magic, PacketType};

pub(crate) use decoder::AdminQueue;
pub(crate) use encoder::AdminLine;

/// One framed unit read from a connection.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A binary packet.
    Packet(Packet),
    /// A completed administrative exchange.
    Admin(AdminResponse),
}

/// Combined decoder/encoder for one connection.
#[derive(Debug)]
pub(crate) struct Codec {
    d: decoder::Decoder,
    e: encoder::Encoder,
}

impl Codec {
    pub(crate) fn new(admin: AdminQueue) -> Self {
        Codec {
            d: decoder::Decoder::new(admin),
            e: encoder::Encoder::default(),
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;

    type Error = GearmanError;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl codec::Encoder<Packet> for Codec {
    type Error = GearmanError;

    fn encode(
        &mut self,
        item: Packet,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}

impl codec::Encoder<AdminLine> for Codec {
    type Error = GearmanError;

    fn encode(
        &mut self,
        item: AdminLine,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}
