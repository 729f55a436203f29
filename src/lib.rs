//! A message-exchange engine for the [CoAP Protocol][rfc].
//!
//! The crate turns datagrams into request/response exchanges and back. An
//! outgoing message passes a stack of layers (token assignment, blockwise
//! transfer, reliability) before the matcher registers it and it is
//! encoded; an incoming datagram is decoded, matched to its exchange and
//! passed up the same layers to the application.
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt):
//!   confirmable retransmission with exponential back-off, piggy-backed and
//!   separate responses, duplicate detection, CoAP ping
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//!   for large request and response bodies
//! - Option to provide custom transports through [`Transport`]
//!
//! # Installation
//!
//! First add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! coap-exchange = "0.1"
//! tokio = {version = "^1.32", features = ["full"]}
//! ```
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coap_exchange::{Endpoint, NetworkConfig, Request, Response, Status};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr = "127.0.0.1:5683";
//!     let server = Endpoint::bind(addr, NetworkConfig::default()).await.unwrap();
//!     println!("Server up on {}", addr);
//!
//!     server.serve(|request: Request| async move {
//!         println!("request by {:?} {}", request.get_method(), request.get_path());
//!         let mut response = Response::new(Status::Content);
//!         response.message.payload = b"OK".to_vec();
//!         Some(response)
//!     });
//!     tokio::signal::ctrl_c().await.unwrap();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coap_exchange::{Endpoint, NetworkConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let url = "coap://127.0.0.1:5683/Rust";
//!     println!("Client request: {}", url);
//!
//!     let client = Endpoint::bind("0.0.0.0:0", NetworkConfig::default()).await.unwrap();
//!     let response = client.get(url).await.unwrap();
//!     println!("Server reply: {}", String::from_utf8(response.message.payload).unwrap());
//! }
//! ```
//!
//! ## Without a socket:
//! [`CoapStack`] can be driven directly: feed it datagrams with
//! [`CoapStack::receive_data`] and drain the [`Outbox`] it returns.
//!
//! [rfc]: https://tools.ietf.org/html/rfc7252

#[cfg(test)]
extern crate quickcheck;

pub mod config;
pub mod endpoint;
pub mod exchange;
pub mod layer;
pub mod matcher;
pub mod message;
pub mod stack;
pub mod transport;

pub use self::config::{ConfigError, NetworkConfig};
pub use self::endpoint::{parse_coap_url, CoapUrl, Endpoint};
pub use self::exchange::{Direction, Exchange, Origin, PendingRequest, RequestError};
pub use self::message::header::MessageType;
pub use self::message::packet::{CodecError, Packet};
pub use self::message::request::Method;
pub use self::message::response::Status;
pub use self::message::{EmptyMessage, IsMessage, Message, Request, Response};
pub use self::stack::{CoapStack, LoggingInterceptor, MessageDeliverer, MessageInterceptor, Outbox, StackError};
pub use self::transport::Transport;
