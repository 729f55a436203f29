use std::net::SocketAddr;

use super::header::MessageClass;
use super::packet::Packet;
use super::request::Request;
use super::IsMessage;

pub use super::header::ResponseType as Status;

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub message: Packet,
    peer: Option<SocketAddr>,
    duplicate: bool,
}

impl Response {
    pub fn new(status: Status) -> Response {
        let mut response = Response::default();
        response.set_status(status);
        response
    }

    /// A response addressed to the sender of `request`, carrying its token.
    ///
    /// The message type and MID are left to the exchange that sends it.
    pub fn for_request(request: &Request, status: Status) -> Response {
        let mut response = Response::new(status);
        response.set_token(request.get_token().to_vec());
        response.peer = request.get_peer();
        response
    }

    pub fn from_packet(packet: Packet, peer: SocketAddr) -> Response {
        Response {
            message: packet,
            peer: Some(peer),
            duplicate: false,
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.message.header.code = MessageClass::Response(status);
    }

    pub fn get_status(&self) -> Status {
        match self.message.header.code {
            MessageClass::Response(status) => status,
            other => Status::UnKnown(u8::from(other)),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn set_duplicate(&mut self, duplicate: bool) {
        self.duplicate = duplicate;
    }
}

impl IsMessage for Response {
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
