use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::debug;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time;

use crate::matcher::MatcherKey;
use crate::message::header::MessageType;
use crate::message::packet::CodecError;
use crate::message::{EmptyMessage, IsMessage, Request, Response};
use crate::stack::{StackCore, StackError};

/// Which side started the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// This endpoint sent the request.
    Local,
    /// A peer sent the request.
    Remote,
}

/// Direction of a blockwise body within an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Progress of one blockwise body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockwiseStatus {
    /// Next block number to send or expect.
    pub num: u32,
    pub szx: u8,
    pub payload: Vec<u8>,
    pub complete: bool,
}

impl BlockwiseStatus {
    pub fn new(szx: u8, payload: Vec<u8>) -> BlockwiseStatus {
        BlockwiseStatus {
            num: 0,
            szx,
            payload,
            complete: false,
        }
    }

    pub fn block_size(&self) -> usize {
        1 << (self.szx + 4)
    }
}

/// Terminal failure of a locally originated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    TimedOut,
    Rejected,
    Canceled,
    Blockwise(String),
    Encode(CodecError),
    Closed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::TimedOut => write!(f, "request timed out"),
            RequestError::Rejected => write!(f, "request rejected by peer"),
            RequestError::Canceled => write!(f, "request canceled"),
            RequestError::Blockwise(reason) => write!(f, "blockwise transfer failed: {}", reason),
            RequestError::Encode(e) => write!(f, "request could not be encoded: {}", e),
            RequestError::Closed => write!(f, "stack closed"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<RequestError> for io::Error {
    fn from(e: RequestError) -> io::Error {
        let kind = match e {
            RequestError::TimedOut => io::ErrorKind::TimedOut,
            RequestError::Rejected => io::ErrorKind::ConnectionRefused,
            RequestError::Canceled => io::ErrorKind::Interrupted,
            RequestError::Blockwise(_) => io::ErrorKind::InvalidData,
            RequestError::Encode(_) => io::ErrorKind::InvalidInput,
            RequestError::Closed => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, e)
    }
}

/// Which of the current wire messages the retransmission timer resends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Request,
    Response,
}

#[derive(Debug, Default)]
pub(crate) struct Retransmission {
    pub handle: Option<JoinHandle<()>>,
    pub failed_count: u32,
    pub timeout: Duration,
    pub target: Option<Target>,
}

#[derive(Debug, Default)]
pub(crate) struct ExchangeState {
    pub request: Option<Request>,
    pub current_request: Option<Request>,
    pub response: Option<Response>,
    pub current_response: Option<Response>,
    pub request_block: Option<BlockwiseStatus>,
    pub response_block: Option<BlockwiseStatus>,
    pub requested_szx: Option<u8>,
    pub retransmission: Retransmission,
    /// The current request was acknowledged: by an empty ACK, a
    /// piggy-backed response or, for local requests, the peer's ACK.
    pub acknowledged: bool,
    pub keys: Vec<MatcherKey>,
    pub outcome: Option<oneshot::Sender<Result<Response, RequestError>>>,
    pub permit: Option<OwnedSemaphorePermit>,
}

impl ExchangeState {
    /// True once no more response blocks or request blocks are pending.
    pub fn is_final(&self) -> bool {
        let request_done = self.request_block.as_ref().map_or(true, |s| s.complete);
        let response_done = self.response_block.as_ref().map_or(true, |s| s.complete);
        request_done && response_done
    }
}

/// State of one request/response conversation with a peer.
pub struct Exchange {
    origin: Origin,
    peer: SocketAddr,
    stack: Weak<StackCore>,
    complete: AtomicBool,
    state: Mutex<ExchangeState>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("origin", &self.origin)
            .field("peer", &self.peer)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(origin: Origin, peer: SocketAddr, stack: Weak<StackCore>) -> Arc<Exchange> {
        Arc::new(Exchange {
            origin,
            peer,
            stack,
            complete: AtomicBool::new(false),
            state: Mutex::new(ExchangeState::default()),
        })
    }

    pub(crate) fn new_local(
        request: Request,
        peer: SocketAddr,
        stack: Weak<StackCore>,
        outcome: oneshot::Sender<Result<Response, RequestError>>,
    ) -> Arc<Exchange> {
        let exchange = Exchange::new(Origin::Local, peer, stack);
        {
            let mut state = exchange.state();
            state.request = Some(request);
            state.outcome = Some(outcome);
        }
        exchange
    }

    pub(crate) fn new_remote(request: Request, peer: SocketAddr, stack: Weak<StackCore>) -> Arc<Exchange> {
        let exchange = Exchange::new(Origin::Remote, peer, stack);
        {
            let mut state = exchange.state();
            state.current_request = Some(request.clone());
            state.request = Some(request);
        }
        exchange
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn core(&self) -> Result<Arc<StackCore>, StackError> {
        self.stack.upgrade().ok_or(StackError::Closed)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Flips the completion flag; true only for the caller that completed it.
    pub(crate) fn set_complete(&self) -> bool {
        !self.complete.swap(true, Ordering::AcqRel)
    }

    /// The whole request: the one the application sent, or the reassembled
    /// one received from the peer.
    pub fn request(&self) -> Option<Request> {
        self.state().request.clone()
    }

    pub(crate) fn set_request(&self, request: Request) {
        self.state().request = Some(request);
    }

    /// The request as last seen on the wire (a single block for blockwise
    /// transfers).
    pub fn current_request(&self) -> Option<Request> {
        self.state().current_request.clone()
    }

    /// Replaces the wire-level request; a new request block resets the
    /// acknowledgement and the last reply.
    pub fn set_current_request(&self, request: Request) {
        let mut state = self.state();
        if state.current_request.as_ref().and_then(|r| r.get_message_id()) != request.get_message_id() {
            state.acknowledged = false;
            if self.origin == Origin::Remote {
                state.current_response = None;
            }
        }
        state.current_request = Some(request);
    }

    pub fn response(&self) -> Option<Response> {
        self.state().response.clone()
    }

    pub fn current_response(&self) -> Option<Response> {
        self.state().current_response.clone()
    }

    pub fn set_current_response(&self, response: Response) {
        self.state().current_response = Some(response);
    }

    pub fn block_status(&self, direction: Direction) -> Option<BlockwiseStatus> {
        let state = self.state();
        match direction {
            Direction::Request => state.request_block.clone(),
            Direction::Response => state.response_block.clone(),
        }
    }

    pub fn set_block_status(&self, direction: Direction, status: Option<BlockwiseStatus>) {
        let mut state = self.state();
        match direction {
            Direction::Request => state.request_block = status,
            Direction::Response => state.response_block = status,
        }
    }

    pub(crate) fn requested_szx(&self) -> Option<u8> {
        self.state().requested_szx
    }

    pub(crate) fn set_requested_szx(&self, szx: u8) {
        self.state().requested_szx = Some(szx);
    }

    pub(crate) fn set_acknowledged(&self) {
        self.state().acknowledged = true;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state().acknowledged
    }

    /// MID of the message this side is waiting to have acknowledged.
    pub(crate) fn in_flight_message_id(&self) -> Option<u16> {
        let state = self.state();
        match self.origin {
            Origin::Local => state.current_request.as_ref().and_then(|r| r.get_message_id()),
            Origin::Remote => state.current_response.as_ref().and_then(|r| r.get_message_id()),
        }
    }

    pub(crate) fn start_retransmission(&self, handle: JoinHandle<()>, timeout: Duration, target: Target) {
        let mut state = self.state();
        if let Some(previous) = state.retransmission.handle.replace(handle) {
            previous.abort();
        }
        state.retransmission.failed_count = 0;
        state.retransmission.timeout = timeout;
        state.retransmission.target = Some(target);
    }

    /// Stops the retransmission timer, if one is armed. Safe to call any
    /// number of times.
    pub fn stop_retransmission(&self) {
        if let Some(handle) = self.state().retransmission.handle.take() {
            handle.abort();
        }
    }

    /// Timeout of the pending wait for an acknowledgement.
    pub fn retransmission_timeout(&self) -> Duration {
        self.state().retransmission.timeout
    }

    pub fn retransmission_count(&self) -> u32 {
        self.state().retransmission.failed_count
    }

    pub(crate) fn add_key(&self, key: MatcherKey) {
        let mut state = self.state();
        if !state.keys.contains(&key) {
            state.keys.push(key);
        }
    }

    /// Holds an NSTART permit until the request resolves or the exchange completes.
    pub fn attach_permit(&self, permit: OwnedSemaphorePermit) {
        if self.is_complete() {
            return;
        }
        self.state().permit = Some(permit);
        // completion may have raced the attach
        if self.is_complete() {
            self.state().permit.take();
        }
    }

    /// Writes the outcome of a local request. Only the first outcome is kept.
    pub(crate) fn resolve(&self, outcome: Result<Response, RequestError>) -> bool {
        let (sender, permit) = {
            let mut state = self.state();
            (state.outcome.take(), state.permit.take())
        };
        // the waiter must find the NSTART slot free
        drop(permit);
        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Releases everything the exchange holds once it is complete.
    pub(crate) fn release(&self) -> Vec<MatcherKey> {
        let (handle, permit, outcome, keys) = {
            let mut state = self.state();
            (
                state.retransmission.handle.take(),
                state.permit.take(),
                state.outcome.take(),
                std::mem::take(&mut state.keys),
            )
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        drop(permit);
        if let Some(outcome) = outcome {
            let _ = outcome.send(Err(RequestError::Canceled));
        }
        keys
    }

    /// Sends an empty ACK for an unacknowledged CON request so the peer stops
    /// retransmitting while the response is prepared.
    pub fn accept(self: &Arc<Self>) -> Result<(), StackError> {
        if self.origin != Origin::Remote {
            return Err(StackError::NotRemote);
        }
        if self.is_complete() {
            return Err(StackError::ExchangeComplete);
        }
        let core = self.core()?;
        let ack = {
            let mut state = self.state();
            let request = match &state.current_request {
                Some(request) if request.is_confirmable() && !state.acknowledged => request,
                _ => return Ok(()),
            };
            let ack = EmptyMessage::ack_for(&request.message, self.peer);
            state.acknowledged = true;
            ack
        };
        debug!("accepting request from {}", self.peer);
        core.send_empty(self, ack);
        Ok(())
    }

    /// Answers the current request with RST and completes the exchange.
    pub fn reject(self: &Arc<Self>) -> Result<(), StackError> {
        if self.origin != Origin::Remote {
            return Err(StackError::NotRemote);
        }
        if self.is_complete() {
            return Err(StackError::ExchangeComplete);
        }
        let core = self.core()?;
        let rst = self
            .current_request()
            .map(|request| EmptyMessage::reset_for(&request.message, self.peer));
        if let Some(rst) = rst {
            core.send_empty(self, rst);
        }
        core.complete(self);
        Ok(())
    }

    /// Sends `response` for the request of this exchange.
    ///
    /// A CON request that has not been acknowledged yet gets the response
    /// piggy-backed on the ACK; an acknowledged one gets a separate CON
    /// response; a NON request gets a NON response.
    pub fn respond(self: &Arc<Self>, mut response: Response) -> Result<(), StackError> {
        if self.origin != Origin::Remote {
            return Err(StackError::NotRemote);
        }
        if self.is_complete() {
            return Err(StackError::ExchangeComplete);
        }
        let core = self.core()?;
        {
            let mut state = self.state();
            if state.response.is_some() {
                return Err(StackError::AlreadyResponded);
            }
            let request = state.current_request.as_ref().ok_or(StackError::ExchangeComplete)?;

            response.set_peer(self.peer);
            response.set_token(request.get_token().to_vec());
            match (request.get_type(), state.acknowledged) {
                (MessageType::Confirmable, false) => {
                    response.set_type(MessageType::Acknowledgement);
                    if let Some(message_id) = request.get_message_id() {
                        response.set_message_id(message_id);
                    }
                }
                (MessageType::Confirmable, true) => {
                    response.set_type(MessageType::Confirmable);
                    response.get_mut_header().clear_message_id();
                }
                _ => {
                    response.set_type(MessageType::NonConfirmable);
                    response.get_mut_header().clear_message_id();
                }
            }
            state.response = Some(response.clone());
        }
        core.send_response(self, response);
        Ok(())
    }

    /// Completes the exchange: stops its timers and removes it from every
    /// correlation table. Idempotent.
    pub fn mark_complete(self: &Arc<Self>) {
        match self.stack.upgrade() {
            Some(core) => core.complete(self),
            None => {
                if self.set_complete() {
                    self.release();
                }
            }
        }
    }

    /// Cancels a local request. The first outcome written wins; canceling
    /// twice is harmless.
    pub fn cancel(self: &Arc<Self>) {
        if self.resolve(Err(RequestError::Canceled)) {
            debug!("canceled request to {}", self.peer);
        }
        self.mark_complete();
    }
}

/// Handle on the outcome of a request sent through the stack.
#[derive(Debug)]
pub struct PendingRequest {
    exchange: Arc<Exchange>,
    receiver: Option<oneshot::Receiver<Result<Response, RequestError>>>,
}

impl PendingRequest {
    pub(crate) fn new(
        exchange: Arc<Exchange>,
        receiver: oneshot::Receiver<Result<Response, RequestError>>,
    ) -> PendingRequest {
        PendingRequest {
            exchange,
            receiver: Some(receiver),
        }
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Waits for the response or the terminal error of the request.
    pub async fn wait(mut self) -> Result<Response, RequestError> {
        match self.receiver.take() {
            Some(receiver) => receiver.await.unwrap_or(Err(RequestError::Closed)),
            None => Err(RequestError::Closed),
        }
    }

    /// Waits at most `duration`. `None` means the wait expired; the request
    /// is still live and can be waited on again.
    pub async fn wait_timeout(&mut self, duration: Duration) -> Option<Result<Response, RequestError>> {
        let receiver = match self.receiver.as_mut() {
            Some(receiver) => receiver,
            None => return Some(Err(RequestError::Closed)),
        };
        match time::timeout(duration, receiver).await {
            Ok(result) => {
                self.receiver = None;
                Some(result.unwrap_or(Err(RequestError::Closed)))
            }
            Err(_) => None,
        }
    }

    pub fn cancel(&self) {
        self.exchange.cancel();
    }
}
