use std::net::SocketAddr;

pub mod codec;
pub mod empty;
pub mod header;
pub mod options;
pub mod packet;
pub mod request;
pub mod response;

use header::{Header, MessageClass, MessageType};
use options::CoapOption;
use packet::Packet;

pub use codec::MessageCodec;
pub use empty::EmptyMessage;
pub use request::Request;
pub use response::Response;

/// Shared accessors over the packet wrapped by a request, a response or an
/// empty message.
pub trait IsMessage {
    fn get_message(&self) -> &Packet;
    fn get_mut_message(&mut self) -> &mut Packet;
    fn get_peer(&self) -> Option<SocketAddr>;
    fn set_peer(&mut self, peer: SocketAddr);

    fn get_header(&self) -> &Header {
        &self.get_message().header
    }
    fn get_mut_header(&mut self) -> &mut Header {
        &mut self.get_mut_message().header
    }

    fn get_token(&self) -> &[u8] {
        self.get_message().get_token()
    }
    fn set_token(&mut self, token: Vec<u8>) {
        self.get_mut_message().set_token(token);
    }
    fn get_message_id(&self) -> Option<u16> {
        self.get_header().get_message_id()
    }
    fn set_message_id(&mut self, message_id: u16) {
        self.get_mut_header().set_message_id(message_id);
    }
    fn get_type(&self) -> MessageType {
        self.get_header().get_type()
    }
    fn set_type(&mut self, message_type: MessageType) {
        self.get_mut_header().set_type(message_type);
    }
    fn get_code(&self) -> String {
        self.get_header().get_code()
    }
    fn set_code(&mut self, code: &str) -> bool {
        self.get_mut_header().set_code(code)
    }
    fn is_confirmable(&self) -> bool {
        self.get_type() == MessageType::Confirmable
    }

    fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.get_mut_message().add_option(tp, value);
    }
    fn get_option(&self, tp: CoapOption) -> Option<&Vec<Vec<u8>>> {
        self.get_message().get_option(tp)
    }
    fn clear_option(&mut self, tp: CoapOption) {
        self.get_mut_message().clear_option(tp);
    }

    fn get_payload(&self) -> &[u8] {
        &self.get_message().payload
    }
    fn set_payload(&mut self, payload: Vec<u8>) {
        self.get_mut_message().payload = payload;
    }
}

/// A decoded datagram, classified by its code.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Empty(EmptyMessage),
}

impl Message {
    /// Classifies a decoded packet. Reserved codes are handed back as the
    /// packet itself.
    pub fn from_packet(packet: Packet, peer: SocketAddr) -> Result<Message, Packet> {
        match packet.header.code {
            MessageClass::Empty => Ok(Message::Empty(EmptyMessage::from_packet(packet, peer))),
            MessageClass::Request(_) => Ok(Message::Request(Request::from_packet(packet, peer))),
            MessageClass::Response(_) => Ok(Message::Response(Response::from_packet(packet, peer))),
            MessageClass::Reserved(_) => Err(packet),
        }
    }

    pub fn packet(&self) -> &Packet {
        match self {
            Message::Request(request) => request.get_message(),
            Message::Response(response) => response.get_message(),
            Message::Empty(empty) => empty.get_message(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Message::Request(request) => request.get_peer(),
            Message::Response(response) => response.get_peer(),
            Message::Empty(empty) => empty.get_peer(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::header::{RequestType, ResponseType};
    use super::*;

    #[test]
    fn test_classify_packet() {
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();

        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        assert!(matches!(Message::from_packet(packet, peer), Ok(Message::Request(_))));

        let mut packet = Packet::new();
        packet.header.code = MessageClass::Response(ResponseType::Content);
        let message = Message::from_packet(packet, peer).unwrap();
        assert!(matches!(message, Message::Response(_)));
        assert_eq!(message.peer(), Some(peer));

        assert!(matches!(Message::from_packet(Packet::new(), peer), Ok(Message::Empty(_))));

        let mut packet = Packet::new();
        packet.header.code = MessageClass::Reserved(0xE0);
        assert!(Message::from_packet(packet, peer).is_err());
    }
}
