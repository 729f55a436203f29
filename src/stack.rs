use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{ConfigError, NetworkConfig};
use crate::exchange::{Exchange, Origin, PendingRequest, RequestError};
use crate::layer::{BlockwiseLayer, Chain, Layer, ReliabilityLayer, TokenLayer};
use crate::matcher::{MatchOutcome, Matcher};
use crate::message::header::MessageType;
use crate::message::packet::Packet;
use crate::message::response::Status;
use crate::message::{EmptyMessage, IsMessage, Message, MessageCodec, Request, Response};

/// A datagram ready for the transport.
pub type Datagram = (Bytes, SocketAddr);

/// Receiving end of the outbound queue; drained by the transport.
pub type Outbox = mpsc::UnboundedReceiver<Datagram>;

/// Refusal at the stack boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum StackError {
    DestinationUnset,
    Closed,
    ExchangeComplete,
    AlreadyResponded,
    NotRemote,
    NoRuntime,
    Config(ConfigError),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StackError::DestinationUnset => write!(f, "message has no destination"),
            StackError::Closed => write!(f, "stack closed"),
            StackError::ExchangeComplete => write!(f, "exchange already complete"),
            StackError::AlreadyResponded => write!(f, "exchange already has a response"),
            StackError::NotRemote => write!(f, "exchange was not started by a peer"),
            StackError::NoRuntime => write!(f, "no tokio runtime available"),
            StackError::Config(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for StackError {}

impl From<StackError> for io::Error {
    fn from(e: StackError) -> io::Error {
        let kind = match e {
            StackError::Closed => io::ErrorKind::BrokenPipe,
            StackError::NoRuntime => io::ErrorKind::Other,
            _ => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}

/// Receives what the stack hands to the application.
pub trait MessageDeliverer: Send + Sync {
    /// A new request from a peer; answer through `exchange`.
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Request);

    /// A response to a local request, after its pending future resolved.
    fn deliver_response(&self, _exchange: Arc<Exchange>, _response: Response) {}
}

/// Observes every message at the bottom of the stack.
pub trait MessageInterceptor: Send + Sync {
    fn send_request(&self, _request: &Request) {}
    fn send_response(&self, _response: &Response) {}
    fn send_empty(&self, _empty: &EmptyMessage) {}
    fn receive_request(&self, _request: &Request) {}
    fn receive_response(&self, _response: &Response) {}
    fn receive_empty(&self, _empty: &EmptyMessage) {}
}

fn describe(packet: &Packet) -> String {
    format!(
        "{} {} MID={:?} token={:02x?} payload={}B",
        packet.header.get_type().short_name(),
        packet.header.code,
        packet.header.get_message_id(),
        packet.get_token(),
        packet.payload.len()
    )
}

/// Logs every message at debug level.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    fn log<M: IsMessage>(&self, direction: &str, message: &M) {
        debug!(
            "{} {:?} {}",
            direction,
            message.get_peer(),
            describe(message.get_message())
        );
    }
}

impl MessageInterceptor for LoggingInterceptor {
    fn send_request(&self, request: &Request) {
        self.log("-->", request)
    }
    fn send_response(&self, response: &Response) {
        self.log("-->", response)
    }
    fn send_empty(&self, empty: &EmptyMessage) {
        self.log("-->", empty)
    }
    fn receive_request(&self, request: &Request) {
        self.log("<--", request)
    }
    fn receive_response(&self, response: &Response) {
        self.log("<--", response)
    }
    fn receive_empty(&self, empty: &EmptyMessage) {
        self.log("<--", empty)
    }
}

/// Shared state behind a [`CoapStack`].
pub struct StackCore {
    layers: Vec<Box<dyn Layer>>,
    pub(crate) matcher: Matcher,
    interceptors: RwLock<Vec<Arc<dyn MessageInterceptor>>>,
    deliverer: RwLock<Option<Arc<dyn MessageDeliverer>>>,
    outbox: mpsc::UnboundedSender<Datagram>,
    pub(crate) config: NetworkConfig,
    pub(crate) default_szx: u8,
    runtime: Handle,
}

impl StackCore {
    pub(crate) fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }

    fn interceptors(&self) -> Vec<Arc<dyn MessageInterceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliverer(&self) -> Option<Arc<dyn MessageDeliverer>> {
        self.deliverer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn send_request(self: &Arc<Self>, exchange: &Arc<Exchange>, request: Request) {
        self.layers[0].send_request(&Chain::new(self, 0), exchange, request)
    }

    pub(crate) fn send_response(self: &Arc<Self>, exchange: &Arc<Exchange>, response: Response) {
        self.layers[0].send_response(&Chain::new(self, 0), exchange, response)
    }

    pub(crate) fn send_empty(self: &Arc<Self>, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        self.layers[0].send_empty(&Chain::new(self, 0), exchange, empty)
    }

    fn encode_and_queue(&self, packet: &Packet, peer: SocketAddr) -> Result<(), RequestError> {
        let mut buf = BytesMut::new();
        MessageCodec.encode(packet, &mut buf).map_err(RequestError::Encode)?;
        trace!("queue {} bytes to {}: {:02x?}", buf.len(), peer, &buf[..]);
        self.outbox.send((buf.freeze(), peer)).map_err(|_| RequestError::Closed)
    }

    pub(crate) fn transmit_request(&self, exchange: &Arc<Exchange>, mut request: Request) {
        if !self.matcher.on_send_request(exchange, &mut request) {
            debug!("not sending request of completed exchange with {}", exchange.peer());
            return;
        }
        for interceptor in self.interceptors() {
            interceptor.send_request(&request);
        }
        if let Err(e) = self.encode_and_queue(&request.message, exchange.peer()) {
            error!("cannot send request to {}: {}", exchange.peer(), e);
            self.fail_exchange(exchange, e);
        }
    }

    pub(crate) fn transmit_response(&self, exchange: &Arc<Exchange>, mut response: Response) {
        let finished = self.matcher.on_send_response(exchange, &mut response);
        for interceptor in self.interceptors() {
            interceptor.send_response(&response);
        }
        if let Err(e) = self.encode_and_queue(&response.message, exchange.peer()) {
            error!("cannot send response to {}: {}", exchange.peer(), e);
            self.complete(exchange);
            return;
        }
        if finished {
            self.complete(exchange);
        }
    }

    pub(crate) fn transmit_empty(&self, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        self.matcher.on_send_empty(exchange, &empty);
        for interceptor in self.interceptors() {
            interceptor.send_empty(&empty);
        }
        if let Err(e) = self.encode_and_queue(&empty.message, exchange.peer()) {
            error!("cannot send {} to {}: {}", empty.get_type().short_name(), exchange.peer(), e);
        }
    }

    /// Sends a message that belongs to no exchange.
    fn transmit_unbound<M: IsMessage>(&self, message: &M, peer: SocketAddr) {
        if let Err(e) = self.encode_and_queue(message.get_message(), peer) {
            error!("cannot send {} to {}: {}", describe(message.get_message()), peer, e);
        }
    }

    fn reset(&self, packet: &Packet, peer: SocketAddr) {
        let rst = EmptyMessage::reset_for(packet, peer);
        for interceptor in self.interceptors() {
            interceptor.send_empty(&rst);
        }
        self.transmit_unbound(&rst, peer);
    }

    pub(crate) fn deliver_request(&self, exchange: &Arc<Exchange>, request: Request) {
        match self.deliverer() {
            Some(deliverer) => deliverer.deliver_request(exchange.clone(), request),
            None => {
                warn!("no deliverer for request from {}", exchange.peer());
                if let Err(e) = exchange.reject() {
                    debug!("reject failed: {}", e);
                }
            }
        }
    }

    pub(crate) fn deliver_response(&self, exchange: &Arc<Exchange>, response: Response) {
        if exchange.origin() != Origin::Local {
            warn!("response for remote exchange with {} dropped", exchange.peer());
            return;
        }
        exchange.resolve(Ok(response.clone()));
        self.complete(exchange);
        if let Some(deliverer) = self.deliverer() {
            deliverer.deliver_response(exchange.clone(), response);
        }
    }

    pub(crate) fn deliver_empty(&self, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        match (empty.get_type(), exchange.origin()) {
            (MessageType::Reset, Origin::Local) => self.fail_exchange(exchange, RequestError::Rejected),
            (MessageType::Reset, Origin::Remote) => self.complete(exchange),
            (MessageType::Acknowledgement, Origin::Local) => {
                debug!("request to {} acknowledged, awaiting response", exchange.peer())
            }
            (MessageType::Acknowledgement, Origin::Remote) => {
                if exchange.state().is_final() {
                    self.complete(exchange);
                }
            }
            _ => {}
        }
    }

    /// Completes `exchange` and removes it from the matcher. Idempotent.
    pub(crate) fn complete(&self, exchange: &Arc<Exchange>) {
        if !exchange.set_complete() {
            return;
        }
        let keys = exchange.release();
        self.matcher.remove_exchange(exchange, keys);
        debug!("completed {:?} exchange with {}", exchange.origin(), exchange.peer());
    }

    pub(crate) fn fail_exchange(&self, exchange: &Arc<Exchange>, error: RequestError) {
        if exchange.resolve(Err(error.clone())) {
            info!("request to {} failed: {}", exchange.peer(), error);
        }
        self.complete(exchange);
    }

    fn receive_packet(self: &Arc<Self>, packet: Packet, peer: SocketAddr) {
        let message = match Message::from_packet(packet, peer) {
            Ok(message) => message,
            Err(packet) => {
                warn!("reserved code {} from {}", packet.header.code, peer);
                if packet.header.get_type() == MessageType::Confirmable {
                    self.reset(&packet, peer);
                }
                return;
            }
        };

        let bottom = self.layers.len() - 1;
        let chain = Chain::new(self, bottom);
        let layer = &self.layers[bottom];

        match message {
            Message::Request(mut request) => {
                for interceptor in self.interceptors() {
                    interceptor.receive_request(&request);
                }
                if let Some(number) = request.message.unrecognized_critical_option() {
                    return self.reject_bad_option(&request, number, peer);
                }
                match self.matcher.on_receive_request(&mut request, &Arc::downgrade(self)) {
                    MatchOutcome::Deliver(exchange) => layer.receive_request(&chain, &exchange, request),
                    MatchOutcome::Reject => self.reset(&request.message, peer),
                    MatchOutcome::Drop => {}
                }
            }
            Message::Response(mut response) => {
                for interceptor in self.interceptors() {
                    interceptor.receive_response(&response);
                }
                if let Some(number) = response.message.unrecognized_critical_option() {
                    warn!("response from {} has unrecognized critical option {}", peer, number);
                    if response.get_type() != MessageType::Acknowledgement {
                        self.reset(&response.message, peer);
                    }
                    return;
                }
                match self.matcher.on_receive_response(&mut response) {
                    MatchOutcome::Deliver(exchange) => layer.receive_response(&chain, &exchange, response),
                    MatchOutcome::Reject => self.reset(&response.message, peer),
                    MatchOutcome::Drop => {}
                }
            }
            Message::Empty(empty) => {
                for interceptor in self.interceptors() {
                    interceptor.receive_empty(&empty);
                }
                match empty.get_type() {
                    MessageType::Confirmable => {
                        debug!("ping from {}", peer);
                        self.reset(&empty.message, peer);
                    }
                    MessageType::NonConfirmable => debug!("empty NON from {} dropped", peer),
                    _ => {
                        if let MatchOutcome::Deliver(exchange) = self.matcher.on_receive_empty(&empty) {
                            layer.receive_empty(&chain, &exchange, empty)
                        }
                    }
                }
            }
        }
    }

    fn reject_bad_option(&self, request: &Request, number: u16, peer: SocketAddr) {
        warn!("request from {} has unrecognized critical option {}", peer, number);
        if !request.is_confirmable() {
            return;
        }
        let mut response = Response::for_request(request, Status::BadOption);
        response.set_type(MessageType::Acknowledgement);
        if let Some(mid) = request.get_message_id() {
            response.set_message_id(mid);
        }
        response.set_payload(format!("Unrecognized critical option {}", number).into_bytes());
        for interceptor in self.interceptors() {
            interceptor.send_response(&response);
        }
        self.transmit_unbound(&response, peer);
    }
}

/// The message-exchange engine of one endpoint: token, blockwise and
/// reliability layers over a matcher, feeding an outbound datagram queue.
#[derive(Clone)]
pub struct CoapStack {
    core: Arc<StackCore>,
}

impl fmt::Debug for CoapStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CoapStack").field("config", &self.core.config).finish()
    }
}

impl CoapStack {
    /// Creates a stack on the current tokio runtime. Encoded datagrams are
    /// queued on the returned [`Outbox`].
    pub fn new(config: NetworkConfig) -> Result<(CoapStack, Outbox), StackError> {
        config.validate().map_err(StackError::Config)?;
        let default_szx = config.default_szx().map_err(StackError::Config)?;
        let runtime = Handle::try_current().map_err(|_| StackError::NoRuntime)?;
        let (outbox, receiver) = mpsc::unbounded_channel();

        let core = Arc::new(StackCore {
            layers: vec![
                Box::new(TokenLayer),
                Box::new(BlockwiseLayer),
                Box::new(ReliabilityLayer),
            ],
            matcher: Matcher::new(&config),
            interceptors: RwLock::new(Vec::new()),
            deliverer: RwLock::new(None),
            outbox,
            config,
            default_szx,
            runtime,
        });
        Self::spawn_sweeper(&core);

        Ok((CoapStack { core }, receiver))
    }

    fn spawn_sweeper(core: &Arc<StackCore>) {
        let stack = Arc::downgrade(core);
        let period = core.config.mark_and_sweep_interval;
        core.spawn(async move {
            let mut timer = IntervalStream::new(time::interval_at(Instant::now() + period, period));
            while timer.next().await.is_some() {
                match stack.upgrade() {
                    Some(core) => {
                        core.matcher.sweep();
                    }
                    None => break,
                }
            }
        });
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    pub fn matcher(&self) -> &Matcher {
        &self.core.matcher
    }

    pub fn set_deliverer(&self, deliverer: Arc<dyn MessageDeliverer>) {
        *self.core.deliverer.write().unwrap_or_else(PoisonError::into_inner) = Some(deliverer);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn MessageInterceptor>) {
        self.core
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Sends a request to its peer and returns a handle on its outcome.
    pub fn send_request(&self, request: Request) -> Result<PendingRequest, StackError> {
        let peer = request.get_peer().ok_or(StackError::DestinationUnset)?;
        let (sender, receiver) = oneshot::channel();
        let exchange = Exchange::new_local(request.clone(), peer, Arc::downgrade(&self.core), sender);
        self.core.send_request(&exchange, request);
        Ok(PendingRequest::new(exchange, receiver))
    }

    /// Answers the request of a remote exchange.
    pub fn send_response(&self, exchange: &Arc<Exchange>, response: Response) -> Result<(), StackError> {
        exchange.respond(response)
    }

    /// Sends an ACK or RST within an exchange.
    pub fn send_empty(&self, exchange: &Arc<Exchange>, mut empty: EmptyMessage) -> Result<(), StackError> {
        if exchange.is_complete() {
            return Err(StackError::ExchangeComplete);
        }
        empty.set_peer(exchange.peer());
        let reset = empty.get_type() == MessageType::Reset;
        self.core.send_empty(exchange, empty);
        if reset {
            self.core.complete(exchange);
        }
        Ok(())
    }

    /// Feeds one datagram received from `peer` into the stack. Undecodable
    /// datagrams are dropped.
    pub fn receive_data(&self, data: &[u8], peer: SocketAddr) {
        trace!("received {} bytes from {}: {:02x?}", data.len(), peer, data);
        match MessageCodec.decode(&mut BytesMut::from(data)) {
            Ok(Some(packet)) => self.core.receive_packet(packet, peer),
            Ok(None) => debug!("empty datagram from {}", peer),
            Err(e) => error!("dropping datagram from {}: {}", peer, e),
        }
    }

    /// Cancels a local request, releasing its timers and correlation state.
    pub fn cancel(&self, exchange: &Arc<Exchange>) {
        exchange.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::header::{MessageClass, RequestType};
    use crate::message::options::{BlockValue, CoapOption};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn decode(datagram: &Datagram) -> Packet {
        Packet::from_bytes(&datagram.0).unwrap()
    }

    async fn next_packet(outbox: &mut Outbox) -> Packet {
        decode(&outbox.recv().await.unwrap())
    }

    /// Records delivered requests and answers each with `reply`.
    struct Recorder {
        requests: Mutex<Vec<Request>>,
        reply: Option<Vec<u8>>,
    }

    impl Recorder {
        fn new(reply: Option<Vec<u8>>) -> Arc<Recorder> {
            Arc::new(Recorder {
                requests: Mutex::new(Vec::new()),
                reply,
            })
        }

        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl MessageDeliverer for Recorder {
        fn deliver_request(&self, exchange: Arc<Exchange>, request: Request) {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(payload) = &self.reply {
                let mut response = Response::for_request(&request, Status::Content);
                response.set_payload(payload.clone());
                exchange.respond(response).unwrap();
            }
        }
    }

    fn request_packet(message_type: MessageType, mid: u16, token: &[u8], payload: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.set_message_id(mid);
        packet.set_token(token.to_vec());
        packet.payload = payload.to_vec();
        packet
    }

    #[tokio::test]
    async fn test_destination_unset() {
        let (stack, _outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        assert_err!(stack.send_request(Request::get("a")));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = NetworkConfig::default().with_default_block_size(48);
        assert!(matches!(
            CoapStack::new(config),
            Err(StackError::Config(ConfigError::InvalidBlockSize(48)))
        ));
    }

    #[tokio::test]
    async fn test_piggybacked_exchange() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("hello");
        request.set_peer(server());
        let pending = assert_ok!(stack.send_request(request));

        let sent = next_packet(&mut outbox).await;
        assert_eq!(sent.header.get_type(), MessageType::Confirmable);
        assert_eq!(sent.get_token().len(), 4);

        let mut reply = Packet::new();
        reply.header.set_type(MessageType::Acknowledgement);
        reply.header.code = MessageClass::Response(Status::Content);
        reply.header.set_message_id(sent.header.get_message_id().unwrap());
        reply.set_token(sent.get_token().to_vec());
        reply.payload = b"world".to_vec();
        stack.receive_data(&reply.to_bytes().unwrap(), server());

        let response = assert_ok!(pending.wait().await);
        assert_eq!(response.get_payload(), b"world");
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_separate_response() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("slow");
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();
        let sent = next_packet(&mut outbox).await;

        let ack = EmptyMessage::ack_for(&sent, server());
        stack.receive_data(&ack.message.to_bytes().unwrap(), server());
        assert!(pending.exchange().is_acknowledged());

        let mut separate = Packet::new();
        separate.header.set_type(MessageType::Confirmable);
        separate.header.code = MessageClass::Response(Status::Content);
        separate.header.set_message_id(0x7777);
        separate.set_token(sent.get_token().to_vec());
        stack.receive_data(&separate.to_bytes().unwrap(), server());

        let ack = next_packet(&mut outbox).await;
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.get_message_id(), Some(0x7777));
        assert!(pending.wait().await.is_ok());

        // a retransmission of the separate response is acknowledged again
        stack.receive_data(&separate.to_bytes().unwrap(), server());
        let ack = next_packet(&mut outbox).await;
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.get_message_id(), Some(0x7777));
    }

    #[tokio::test]
    async fn test_reset_rejects_request() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("a");
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();
        let sent = next_packet(&mut outbox).await;

        let rst = EmptyMessage::reset_for(&sent, server());
        stack.receive_data(&rst.message.to_bytes().unwrap(), server());
        assert_eq!(pending.wait().await.unwrap_err(), RequestError::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_bound() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("void");
        request.set_peer(server());
        let start = Instant::now();
        let pending = stack.send_request(request).unwrap();
        let initial = pending.exchange().retransmission_timeout();
        assert!(initial >= Duration::from_secs(2) && initial < Duration::from_secs(3));

        let mut sent = Vec::new();
        for _ in 0..5 {
            let packet = next_packet(&mut outbox).await;
            sent.push((Instant::now() - start, packet));
        }
        let mid = sent[0].1.header.get_message_id();
        assert!(sent.iter().all(|(_, packet)| packet.header.get_message_id() == mid));

        let fourth_retry = sent[4].0;
        assert!(fourth_retry >= Duration::from_secs(30), "{:?}", fourth_retry);
        assert!(fourth_retry <= Duration::from_secs(45), "{:?}", fourth_retry);

        assert_eq!(pending.wait().await.unwrap_err(), RequestError::TimedOut);
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(62), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(93), "{:?}", elapsed);
        assert!(outbox.try_recv().is_err());
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_request_is_not_retransmitted() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("a");
        request.set_type(MessageType::NonConfirmable);
        request.set_peer(server());
        let mut pending = stack.send_request(request).unwrap();
        next_packet(&mut outbox).await;

        assert!(pending.wait_timeout(Duration::from_secs(120)).await.is_none());
        assert!(outbox.try_recv().is_err());
        pending.cancel();
        pending.cancel();
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_resends_reply() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let recorder = Recorder::new(Some(b"done".to_vec()));
        stack.set_deliverer(recorder.clone());

        let request = request_packet(MessageType::Confirmable, 0x1234, &[1, 2], b"x");
        let bytes = request.to_bytes().unwrap();
        stack.receive_data(&bytes, client());
        let first = outbox.recv().await.unwrap();
        assert_eq!(first.1, client());
        let reply = decode(&first);
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.get_message_id(), Some(0x1234));
        assert_eq!(reply.payload, b"done".to_vec());

        for _ in 0..3 {
            stack.receive_data(&bytes, client());
            let again = outbox.recv().await.unwrap();
            assert_eq!(again.0, first.0);
        }
        assert_eq!(recorder.count(), 1);
        assert_eq!(stack.matcher().dedup_entries(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_reset() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let recorder = Recorder::new(None);
        stack.set_deliverer(recorder.clone());

        let mut response = Packet::new();
        response.header.set_type(MessageType::Confirmable);
        response.header.code = MessageClass::Response(Status::Content);
        response.header.set_message_id(77);
        response.set_token(vec![0xAB]);
        stack.receive_data(&response.to_bytes().unwrap(), server());

        let rst = next_packet(&mut outbox).await;
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.get_message_id(), Some(77));
        assert_eq!(recorder.count(), 0);

        // piggy-backed responses nobody asked for are dropped silently
        response.header.set_type(MessageType::Acknowledgement);
        stack.receive_data(&response.to_bytes().unwrap(), server());
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        stack.receive_data(&[0x40, 0x00, 0x00, 0x2A], client());
        let rst = next_packet(&mut outbox).await;
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.get_message_id(), Some(42));
    }

    #[tokio::test]
    async fn test_malformed_and_reserved() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        stack.receive_data(&[0x40, 0x01], client());
        stack.receive_data(&[0x40, 0x01, 0x00, 0x01, 0xFF], client());
        assert!(outbox.try_recv().is_err());

        stack.receive_data(&[0x40, 0xE0, 0x00, 0x05], client());
        let rst = next_packet(&mut outbox).await;
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.get_message_id(), Some(5));
    }

    #[tokio::test]
    async fn test_unrecognized_critical_option() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let recorder = Recorder::new(Some(vec![]));
        stack.set_deliverer(recorder.clone());

        let mut request = request_packet(MessageType::Confirmable, 9, &[3], b"");
        request.add_option(crate::message::options::CoapOption::Unknown(9), vec![1]);
        stack.receive_data(&request.to_bytes().unwrap(), client());

        let reply = next_packet(&mut outbox).await;
        assert_eq!(reply.header.code, MessageClass::Response(Status::BadOption));
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.get_message_id(), Some(9));
        assert_eq!(reply.get_token(), &[3]);

        request.header.set_type(MessageType::NonConfirmable);
        stack.receive_data(&request.to_bytes().unwrap(), client());
        assert!(outbox.try_recv().is_err());
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_accept_then_separate_response() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let delivered: Arc<Mutex<Option<Arc<Exchange>>>> = Arc::new(Mutex::new(None));

        struct Keep(Arc<Mutex<Option<Arc<Exchange>>>>);
        impl MessageDeliverer for Keep {
            fn deliver_request(&self, exchange: Arc<Exchange>, _request: Request) {
                *self.0.lock().unwrap() = Some(exchange);
            }
        }
        stack.set_deliverer(Arc::new(Keep(delivered.clone())));

        let request = request_packet(MessageType::Confirmable, 0x0101, &[7], b"");
        stack.receive_data(&request.to_bytes().unwrap(), client());
        let exchange = delivered.lock().unwrap().take().unwrap();

        assert_ok!(exchange.accept());
        assert_ok!(exchange.accept());
        let ack = next_packet(&mut outbox).await;
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.code, MessageClass::Empty);
        assert!(outbox.try_recv().is_err());

        assert_ok!(stack.send_response(&exchange, Response::new(Status::Content)));
        let response = next_packet(&mut outbox).await;
        assert_eq!(response.header.get_type(), MessageType::Confirmable);
        assert_ne!(response.header.get_message_id(), Some(0x0101));
        assert_eq!(response.get_token(), &[7]);
        assert!(!exchange.is_complete());

        let ack = EmptyMessage::ack_for(&response, client());
        stack.receive_data(&ack.message.to_bytes().unwrap(), client());
        assert!(exchange.is_complete());
        assert!(matches!(
            exchange.respond(Response::new(Status::Content)),
            Err(StackError::ExchangeComplete)
        ));
        assert!(matches!(exchange.accept(), Err(StackError::ExchangeComplete)));
    }

    #[tokio::test]
    async fn test_short_post_is_not_split() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let recorder = Recorder::new(Some(b"fine".to_vec()));
        stack.set_deliverer(recorder.clone());

        let request = request_packet(MessageType::Confirmable, 0x0500, &[2], &[1; 20]);
        stack.receive_data(&request.to_bytes().unwrap(), client());

        let reply = next_packet(&mut outbox).await;
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.get_message_id(), Some(0x0500));
        assert_eq!(reply.header.code, MessageClass::Response(Status::Content));
        assert!(reply.get_block1().is_none() && reply.get_block2().is_none());
        assert_eq!(recorder.requests.lock().unwrap()[0].get_payload(), &[1; 20]);
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blockwise_response_push() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let body: Vec<u8> = (0..200u8).collect();
        stack.set_deliverer(Recorder::new(Some(body.clone())));

        let request = request_packet(MessageType::Confirmable, 0x2000, &[8], b"");
        stack.receive_data(&request.to_bytes().unwrap(), client());

        let mut received = Vec::new();
        let mut nums = Vec::new();
        loop {
            let block = next_packet(&mut outbox).await;
            let value = block.get_block2().unwrap();
            nums.push(value.num);
            received.extend_from_slice(&block.payload);
            if value.num == 0 {
                assert_eq!(block.header.get_type(), MessageType::Acknowledgement);
                assert_eq!(block.header.get_message_id(), Some(0x2000));
            } else {
                assert_eq!(block.header.get_type(), MessageType::Confirmable);
                let ack = EmptyMessage::ack_for(&block, client());
                stack.receive_data(&ack.message.to_bytes().unwrap(), client());
            }
            if !value.more {
                assert_eq!(block.payload.len(), 8);
                break;
            }
            assert_eq!(block.payload.len(), 32);
        }
        assert_eq!(nums, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(received, body);
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_blockwise_request_reassembly() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let recorder = Recorder::new(Some(b"ok".to_vec()));
        stack.set_deliverer(recorder.clone());

        let body: Vec<u8> = (0..100u8).collect();
        for (num, chunk) in body.chunks(32).enumerate() {
            let more = (num + 1) * 32 < body.len();
            let mut block = request_packet(MessageType::Confirmable, 0x3000 + num as u16, &[4, 4], chunk);
            block.set_block1(BlockValue::new(num as u32, more, 1).unwrap());
            stack.receive_data(&block.to_bytes().unwrap(), client());

            let reply = next_packet(&mut outbox).await;
            assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
            assert_eq!(reply.header.get_message_id(), Some(0x3000 + num as u16));
            assert_eq!(reply.get_block1(), Some(BlockValue::new(num as u32, more, 1).unwrap()));
            if more {
                assert_eq!(reply.header.code, MessageClass::Response(Status::Changed));
            } else {
                assert_eq!(reply.header.code, MessageClass::Response(Status::Content));
                assert_eq!(reply.payload, b"ok".to_vec());
            }
        }

        assert_eq!(recorder.count(), 1);
        let assembled = recorder.requests.lock().unwrap()[0].clone();
        assert_eq!(assembled.get_payload(), &body[..]);
        assert!(assembled.message.get_block1().is_none());
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_request_block() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let recorder = Recorder::new(Some(vec![]));
        stack.set_deliverer(recorder.clone());

        let mut first = request_packet(MessageType::Confirmable, 1, &[5], &[0; 32]);
        first.set_block1(BlockValue::new(0, true, 1).unwrap());
        stack.receive_data(&first.to_bytes().unwrap(), client());
        next_packet(&mut outbox).await;

        let mut skipped = request_packet(MessageType::Confirmable, 2, &[5], &[0; 32]);
        skipped.set_block1(BlockValue::new(2, true, 1).unwrap());
        stack.receive_data(&skipped.to_bytes().unwrap(), client());
        let reply = next_packet(&mut outbox).await;
        assert_eq!(reply.header.code, MessageClass::Response(Status::RequestEntityIncomplete));
        assert_eq!(reply.header.get_message_id(), Some(2));
        assert_eq!(recorder.count(), 0);

        // the transfer is gone: further blocks are orphans
        let mut orphan = request_packet(MessageType::Confirmable, 3, &[5], &[0; 32]);
        orphan.set_block1(BlockValue::new(1, true, 1).unwrap());
        stack.receive_data(&orphan.to_bytes().unwrap(), client());
        let rst = next_packet(&mut outbox).await;
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.get_message_id(), Some(3));
    }

    #[tokio::test]
    async fn test_blockwise_upload_client() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let body: Vec<u8> = (0..70u8).collect();
        let mut request = Request::post("upload", body.clone());
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();

        let mut uploaded = Vec::new();
        for num in 0..3u32 {
            let block = next_packet(&mut outbox).await;
            let value = block.get_block1().unwrap();
            assert_eq!(value.num, num);
            assert_eq!(value.more, num < 2);
            uploaded.extend_from_slice(&block.payload);

            let mut reply = Packet::new();
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.set_message_id(block.header.get_message_id().unwrap());
            reply.set_token(block.get_token().to_vec());
            reply.header.code = MessageClass::Response(Status::Changed);
            reply.set_block1(value);
            stack.receive_data(&reply.to_bytes().unwrap(), server());
        }
        assert_eq!(uploaded, body);

        let response = pending.wait().await.unwrap();
        assert_eq!(response.get_status(), Status::Changed);
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_blockwise_upload_smaller_block_size() {
        let config = NetworkConfig::default()
            .with_max_message_size(64)
            .with_default_block_size(64);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let body: Vec<u8> = (0..200u8).collect();
        let mut request = Request::post("upload", body.clone());
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();

        let first = next_packet(&mut outbox).await;
        assert_eq!(first.get_block1(), Some(BlockValue::new(0, true, 2).unwrap()));
        assert_eq!(first.payload, body[..64].to_vec());
        let mut uploaded = first.payload.clone();

        // the peer takes the 64 bytes but asks for 32 byte blocks from now on
        let mut reply = Packet::new();
        reply.header.set_type(MessageType::Acknowledgement);
        reply.header.set_message_id(first.header.get_message_id().unwrap());
        reply.set_token(first.get_token().to_vec());
        reply.header.code = MessageClass::Response(Status::Continue);
        reply.set_block1(BlockValue::new(0, true, 1).unwrap());
        stack.receive_data(&reply.to_bytes().unwrap(), server());

        let mut nums = Vec::new();
        loop {
            let block = next_packet(&mut outbox).await;
            let value = block.get_block1().unwrap();
            assert_eq!(value.size_exponent, 1);
            if nums.is_empty() {
                assert_eq!(value.num, 2);
                assert_eq!(block.payload[0], 64);
            }
            nums.push(value.num);
            uploaded.extend_from_slice(&block.payload);

            let mut reply = Packet::new();
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.set_message_id(block.header.get_message_id().unwrap());
            reply.set_token(block.get_token().to_vec());
            let status = if value.more { Status::Continue } else { Status::Changed };
            reply.header.code = MessageClass::Response(status);
            reply.set_block1(value);
            stack.receive_data(&reply.to_bytes().unwrap(), server());
            if !value.more {
                break;
            }
        }
        assert_eq!(nums, vec![2, 3, 4, 5, 6]);
        assert_eq!(uploaded, body);

        let response = pending.wait().await.unwrap();
        assert_eq!(response.get_status(), Status::Changed);
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_requested_block_size() {
        let config = NetworkConfig::default()
            .with_max_message_size(64)
            .with_default_block_size(64);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let body: Vec<u8> = (0..100u8).collect();
        stack.set_deliverer(Recorder::new(Some(body.clone())));

        let mut request = request_packet(MessageType::Confirmable, 0x5000, &[6], b"");
        request.set_block2(BlockValue::new(0, false, 0).unwrap());
        stack.receive_data(&request.to_bytes().unwrap(), client());

        let first = next_packet(&mut outbox).await;
        assert_eq!(first.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(first.header.get_message_id(), Some(0x5000));
        assert_eq!(
            first.get_block2(),
            Some(BlockValue {
                num: 0,
                more: true,
                size_exponent: 0
            })
        );
        assert_eq!(first.payload.len(), 16);

        let mut received = first.payload.clone();
        loop {
            let block = next_packet(&mut outbox).await;
            let value = block.get_block2().unwrap();
            assert_eq!(value.size_exponent, 0);
            received.extend_from_slice(&block.payload);
            let ack = EmptyMessage::ack_for(&block, client());
            stack.receive_data(&ack.message.to_bytes().unwrap(), client());
            if !value.more {
                assert_eq!(value.num, 6);
                assert_eq!(block.payload.len(), 4);
                break;
            }
            assert_eq!(block.payload.len(), 16);
        }
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn test_request_body_too_large() {
        let config = NetworkConfig::default()
            .with_max_message_size(32)
            .with_default_block_size(32)
            .with_max_resource_body_size(64);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let recorder = Recorder::new(Some(b"ok".to_vec()));
        stack.set_deliverer(recorder.clone());

        for num in 0..2u32 {
            let mut block = request_packet(MessageType::Confirmable, 0x6000 + num as u16, &[9], &[1; 32]);
            block.set_block1(BlockValue::new(num, true, 1).unwrap());
            stack.receive_data(&block.to_bytes().unwrap(), client());
            let reply = next_packet(&mut outbox).await;
            assert_eq!(reply.header.code, MessageClass::Response(Status::Changed));
        }

        let mut block = request_packet(MessageType::Confirmable, 0x6002, &[9], &[1; 32]);
        block.set_block1(BlockValue::new(2, true, 1).unwrap());
        stack.receive_data(&block.to_bytes().unwrap(), client());
        let reply = next_packet(&mut outbox).await;
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.get_message_id(), Some(0x6002));
        assert_eq!(reply.header.code, MessageClass::Response(Status::RequestEntityTooLarge));
        assert_eq!(reply.get_option_uint(CoapOption::Size1), Some(64));
        assert_eq!(recorder.count(), 0);
        assert_eq!(stack.matcher().live_exchanges(), 0);

        // an announced Size1 above the limit is refused on the first block
        let mut block = request_packet(MessageType::Confirmable, 0x6100, &[10], &[1; 32]);
        block.set_block1(BlockValue::new(0, true, 1).unwrap());
        block.set_option_uint(CoapOption::Size1, 1000);
        stack.receive_data(&block.to_bytes().unwrap(), client());
        let reply = next_packet(&mut outbox).await;
        assert_eq!(reply.header.code, MessageClass::Response(Status::RequestEntityTooLarge));
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_response_body_too_large() {
        let config = NetworkConfig::default().with_max_resource_body_size(48);
        let (stack, mut outbox) = CoapStack::new(config).unwrap();
        let mut request = Request::get("big");
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();
        let sent = next_packet(&mut outbox).await;

        for num in 0..2u32 {
            let mut block = Packet::new();
            block.header.code = MessageClass::Response(Status::Content);
            block.set_token(sent.get_token().to_vec());
            block.set_block2(BlockValue::new(num, true, 1).unwrap());
            block.payload = vec![2; 32];
            if num == 0 {
                block.header.set_type(MessageType::Acknowledgement);
                block.header.set_message_id(sent.header.get_message_id().unwrap());
            } else {
                block.header.set_type(MessageType::NonConfirmable);
                block.header.set_message_id(0x7000);
            }
            stack.receive_data(&block.to_bytes().unwrap(), server());
        }

        assert!(matches!(pending.wait().await, Err(RequestError::Blockwise(_))));
        assert_eq!(stack.matcher().live_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_blockwise_download_client() {
        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let mut request = Request::get("big");
        request.set_peer(server());
        let pending = stack.send_request(request).unwrap();
        let sent = next_packet(&mut outbox).await;

        let body: Vec<u8> = (0..200u8).collect();
        for (num, chunk) in body.chunks(32).enumerate() {
            let mut block = Packet::new();
            block.header.code = MessageClass::Response(Status::Content);
            block.set_token(sent.get_token().to_vec());
            block.set_block2(BlockValue::new(num as u32, (num + 1) * 32 < body.len(), 1).unwrap());
            block.payload = chunk.to_vec();
            if num == 0 {
                block.header.set_type(MessageType::Acknowledgement);
                block.header.set_message_id(sent.header.get_message_id().unwrap());
            } else {
                block.header.set_type(MessageType::Confirmable);
                block.header.set_message_id(0x4000 + num as u16);
            }
            stack.receive_data(&block.to_bytes().unwrap(), server());
            if num > 0 {
                let ack = next_packet(&mut outbox).await;
                assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
                assert_eq!(ack.header.get_message_id(), Some(0x4000 + num as u16));
            }
        }

        let response = pending.wait().await.unwrap();
        assert_eq!(response.get_payload(), &body[..]);
    }

    #[tokio::test]
    async fn test_interceptor_sees_traffic() {
        #[derive(Default)]
        struct Counter(Mutex<(usize, usize)>);
        impl MessageInterceptor for Counter {
            fn send_request(&self, _request: &Request) {
                self.0.lock().unwrap().0 += 1;
            }
            fn receive_empty(&self, _empty: &EmptyMessage) {
                self.0.lock().unwrap().1 += 1;
            }
        }

        let (stack, mut outbox) = CoapStack::new(NetworkConfig::default()).unwrap();
        let counter = Arc::new(Counter::default());
        stack.add_interceptor(counter.clone());
        stack.add_interceptor(Arc::new(LoggingInterceptor));

        let mut request = Request::get("a");
        request.set_peer(server());
        let _pending = stack.send_request(request).unwrap();
        let sent = next_packet(&mut outbox).await;
        let ack = EmptyMessage::ack_for(&sent, server());
        stack.receive_data(&ack.message.to_bytes().unwrap(), server());

        assert_eq!(*counter.0.lock().unwrap(), (1, 1));
    }
}
