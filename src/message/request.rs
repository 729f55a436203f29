use std::net::SocketAddr;
use std::str;

use super::header::MessageClass;
use super::options::CoapOption;
use super::packet::Packet;
use super::IsMessage;

pub use super::header::RequestType as Method;

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub message: Packet,
    peer: Option<SocketAddr>,
    duplicate: bool,
}

impl Request {
    pub fn new() -> Request {
        Default::default()
    }

    pub fn with_method(method: Method, path: &str) -> Request {
        let mut request = Request::new();
        request.set_method(method);
        request.set_path(path);
        request
    }

    pub fn get(path: &str) -> Request {
        Request::with_method(Method::Get, path)
    }

    pub fn post(path: &str, payload: Vec<u8>) -> Request {
        let mut request = Request::with_method(Method::Post, path);
        request.message.payload = payload;
        request
    }

    pub fn put(path: &str, payload: Vec<u8>) -> Request {
        let mut request = Request::with_method(Method::Put, path);
        request.message.payload = payload;
        request
    }

    pub fn delete(path: &str) -> Request {
        Request::with_method(Method::Delete, path)
    }

    pub fn from_packet(packet: Packet, peer: SocketAddr) -> Request {
        Request {
            message: packet,
            peer: Some(peer),
            duplicate: false,
        }
    }

    pub fn set_method(&mut self, method: Method) {
        self.message.header.code = MessageClass::Request(method);
    }

    pub fn get_method(&self) -> Method {
        match self.message.header.code {
            MessageClass::Request(method) => method,
            other => Method::UnKnown(u8::from(other)),
        }
    }

    pub fn set_path(&mut self, path: &str) {
        self.clear_option(CoapOption::UriPath);

        for seg in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, seg.as_bytes().to_vec());
        }
    }

    pub fn get_path(&self) -> String {
        self.joined_option(CoapOption::UriPath, "/")
    }

    /// Replaces the Uri-Query options with the `&` separated pairs of
    /// `query`.
    pub fn set_query(&mut self, query: &str) {
        self.clear_option(CoapOption::UriQuery);

        for pair in query.split('&').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriQuery, pair.as_bytes().to_vec());
        }
    }

    pub fn get_query(&self) -> String {
        self.joined_option(CoapOption::UriQuery, "&")
    }

    pub fn set_uri_host(&mut self, host: &str) {
        self.message
            .set_option(CoapOption::UriHost, vec![host.as_bytes().to_vec()]);
    }

    /// True when the matcher has seen this request before.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn set_duplicate(&mut self, duplicate: bool) {
        self.duplicate = duplicate;
    }

    fn joined_option(&self, tp: CoapOption, separator: &str) -> String {
        match self.get_option(tp) {
            Some(options) => options
                .iter()
                .filter_map(|option| str::from_utf8(option).ok())
                .collect::<Vec<_>>()
                .join(separator),
            None => String::new(),
        }
    }
}

impl IsMessage for Request {
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
