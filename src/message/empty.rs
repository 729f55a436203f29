use std::net::SocketAddr;

use super::header::{MessageClass, MessageType};
use super::packet::Packet;
use super::IsMessage;

/// A message with code 0.00: ACK, RST or a CoAP ping.
#[derive(Debug, Clone, Default)]
pub struct EmptyMessage {
    pub message: Packet,
    peer: Option<SocketAddr>,
}

impl EmptyMessage {
    pub fn new(message_type: MessageType) -> EmptyMessage {
        let mut empty = EmptyMessage::default();
        empty.message.header.code = MessageClass::Empty;
        empty.set_type(message_type);
        empty
    }

    /// Empty ACK for `packet` sent by `peer`.
    pub fn ack_for(packet: &Packet, peer: SocketAddr) -> EmptyMessage {
        Self::reply(MessageType::Acknowledgement, packet, peer)
    }

    /// RST for `packet` sent by `peer`.
    pub fn reset_for(packet: &Packet, peer: SocketAddr) -> EmptyMessage {
        Self::reply(MessageType::Reset, packet, peer)
    }

    /// An empty CON, answered with RST by any live CoAP endpoint.
    pub fn ping(peer: SocketAddr) -> EmptyMessage {
        let mut empty = EmptyMessage::new(MessageType::Confirmable);
        empty.peer = Some(peer);
        empty
    }

    pub fn from_packet(packet: Packet, peer: SocketAddr) -> EmptyMessage {
        EmptyMessage {
            message: packet,
            peer: Some(peer),
        }
    }

    fn reply(message_type: MessageType, packet: &Packet, peer: SocketAddr) -> EmptyMessage {
        let mut empty = EmptyMessage::new(message_type);
        if let Some(message_id) = packet.header.get_message_id() {
            empty.set_message_id(message_id);
        }
        empty.peer = Some(peer);
        empty
    }
}

impl IsMessage for EmptyMessage {
    fn get_message(&self) -> &Packet {
        &self.message
    }
    fn get_mut_message(&mut self) -> &mut Packet {
        &mut self.message
    }
    fn get_peer(&self) -> Option<SocketAddr> {
        self.peer
    }
    fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }
}
