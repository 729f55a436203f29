use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{CodecError, Packet};

/// Datagram codec: one buffer holds exactly one message.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> MessageCodec {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split();
        Packet::from_bytes(&datagram).map(Some)
    }
}

impl<'a> Encoder<&'a Packet> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: &'a Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.extend_from_slice(&packet.to_bytes()?);
        Ok(())
    }
}
