use tokio_util::codec;

use super::packet::Packet;
use crate::error::GearmanError;

/// A line to be written on the administrative sideband, newline included.
#[derive(Debug)]
pub(crate) struct AdminLine(pub bytes::Bytes);

/// An encoder for the client side of a Gearman connection: binary request
/// packets and administrative command lines.
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Packet> for Encoder {
    type Error = GearmanError;

    fn encode(
        &mut self,
        item: Packet,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        item.put(dst);
        Ok(())
    }
}

impl codec::Encoder<AdminLine> for Encoder {
    type Error = GearmanError;

    fn encode(
        &mut self,
        item: AdminLine,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.0);
        Ok(())
    }
}
