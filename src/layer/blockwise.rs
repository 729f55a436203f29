use std::cmp;
use std::sync::Arc;

use log::{debug, warn};

use super::{Chain, Layer};
use crate::exchange::{BlockwiseStatus, Direction, Exchange, Origin, RequestError};
use crate::message::header::MessageType;
use crate::message::options::{BlockValue, CoapOption};
use crate::message::response::Status;
use crate::message::{EmptyMessage, IsMessage, Request, Response};

/// Splits bodies larger than `max_message_size` into Block1 / Block2
/// transfers and reassembles the blocks received from the peer.
#[derive(Debug, Default)]
pub struct BlockwiseLayer;

fn block_value(num: u32, more: bool, szx: u8) -> Option<BlockValue> {
    match BlockValue::new(num, more, szx) {
        Ok(block) => Some(block),
        Err(e) => {
            warn!("cannot describe block {}: {}", num, e);
            None
        }
    }
}

/// Slice of `status.payload` for block `num`, and whether more follow.
fn slice(status: &BlockwiseStatus, num: u32) -> (Vec<u8>, bool) {
    let size = status.block_size();
    let start = cmp::min(num as usize * size, status.payload.len());
    let end = cmp::min(start + size, status.payload.len());
    (status.payload[start..end].to_vec(), end < status.payload.len())
}

/// Addresses `response` as the piggy-backed or NON reply to `request`.
fn reply_to(request: &Request, response: &mut Response) {
    if let Some(peer) = request.get_peer() {
        response.set_peer(peer);
    }
    response.set_token(request.get_token().to_vec());
    if request.is_confirmable() {
        response.set_type(MessageType::Acknowledgement);
        if let Some(mid) = request.get_message_id() {
            response.set_message_id(mid);
        }
    } else {
        response.set_type(MessageType::NonConfirmable);
        response.get_mut_header().clear_message_id();
    }
}

impl BlockwiseLayer {
    /// Builds request block `num` from the whole request.
    fn request_block(template: &Request, status: &BlockwiseStatus, num: u32) -> Option<Request> {
        let (payload, more) = slice(status, num);
        let mut block = template.clone();
        block.get_mut_header().clear_message_id();
        block.set_payload(payload);
        block.message.set_block1(block_value(num, more, status.szx)?);
        if num == 0 {
            block
                .message
                .set_option_uint(CoapOption::Size1, status.payload.len() as u32);
        }
        Some(block)
    }

    /// Builds response block `num` from the whole response.
    fn response_block(template: &Response, status: &BlockwiseStatus, num: u32) -> Option<Response> {
        let (payload, more) = slice(status, num);
        let mut block = template.clone();
        block.set_payload(payload);
        block.message.set_block2(block_value(num, more, status.szx)?);
        if num == 0 {
            block
                .message
                .set_option_uint(CoapOption::Size2, status.payload.len() as u32);
        } else {
            block.message.clear_option(CoapOption::Size2);
        }
        Some(block)
    }

    /// Sends the next block of the response as a CON message.
    fn push_next_block(chain: &Chain, exchange: &Arc<Exchange>) {
        let block = {
            let mut state = exchange.state();
            let template = match &state.response {
                Some(response) => response.clone(),
                None => return,
            };
            let status = match state.response_block.as_mut() {
                Some(status) if !status.complete => status,
                _ => return,
            };
            let num = status.num;
            let block = Self::response_block(&template, status, num);
            status.num += 1;
            if status.num as usize * status.block_size() >= status.payload.len() {
                status.complete = true;
            }
            block
        };

        if let Some(mut block) = block {
            block.set_type(MessageType::Confirmable);
            block.get_mut_header().clear_message_id();
            debug!("pushing response block {:?} to {}", block.message.get_block2(), exchange.peer());
            chain.send_response(exchange, block);
        }
    }

    /// Answers an unexpected request block with 4.08 and ends the transfer.
    fn abort_transfer(chain: &Chain, exchange: &Arc<Exchange>, request: &Request) {
        exchange.set_block_status(Direction::Request, None);
        let mut response = Response::new(Status::RequestEntityIncomplete);
        reply_to(request, &mut response);
        chain.send_response(exchange, response);
    }

    /// Answers with 4.13 carrying the accepted body size in Size1.
    fn reject_oversized(chain: &Chain, exchange: &Arc<Exchange>, request: &Request) {
        let limit = chain.config().max_resource_body_size;
        warn!("request body from {} exceeds {} bytes", exchange.peer(), limit);
        exchange.set_block_status(Direction::Request, None);
        let mut response = Response::new(Status::RequestEntityTooLarge);
        response.message.set_option_uint(CoapOption::Size1, limit as u32);
        reply_to(request, &mut response);
        chain.send_response(exchange, response);
    }

    fn receive_request_block(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request, block: BlockValue) {
        let mut status = match exchange.block_status(Direction::Request) {
            Some(status) => status,
            None if block.num == 0 => BlockwiseStatus::new(block.size_exponent, Vec::new()),
            None => {
                warn!("request block {} from {} without transfer", block, exchange.peer());
                return Self::abort_transfer(chain, exchange, &request);
            }
        };

        if block.num < status.num {
            warn!("late request block {} from {}, expected {}", block, exchange.peer(), status.num);
            let mut response = Response::new(Status::Changed);
            response.message.set_block1(block);
            reply_to(&request, &mut response);
            return chain.send_response(exchange, response);
        }
        if block.num > status.num {
            warn!("request block {} from {} skips block {}", block, exchange.peer(), status.num);
            return Self::abort_transfer(chain, exchange, &request);
        }

        let limit = chain.config().max_resource_body_size;
        let announced = request.message.get_option_uint(CoapOption::Size1).unwrap_or(0) as usize;
        if status.payload.len() + request.get_payload().len() > limit || announced > limit {
            return Self::reject_oversized(chain, exchange, &request);
        }

        status.payload.extend_from_slice(request.get_payload());
        status.num += 1;
        status.szx = block.size_exponent;

        if block.more {
            debug!("request block {} from {}", block, exchange.peer());
            exchange.set_block_status(Direction::Request, Some(status));
            let mut response = Response::new(Status::Changed);
            response.message.set_block1(block);
            reply_to(&request, &mut response);
            return chain.send_response(exchange, response);
        }

        status.complete = true;
        let mut assembled = request;
        assembled.set_payload(status.payload.clone());
        assembled.clear_option(CoapOption::Block1);
        assembled.clear_option(CoapOption::Size1);
        debug!(
            "reassembled {} byte request from {} in {} blocks",
            status.payload.len(),
            exchange.peer(),
            status.num
        );
        exchange.set_block_status(Direction::Request, Some(status));
        exchange.set_request(assembled.clone());
        chain.receive_request(exchange, assembled)
    }

    /// Continues a Block1 upload after the peer confirmed a block. Returns
    /// the response when it is not an intermediate confirmation.
    fn continue_upload(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) -> Option<Response> {
        let mut status = match exchange.block_status(Direction::Request) {
            Some(status) if !status.complete => status,
            _ => return Some(response),
        };

        let confirmed = match response.message.get_block1() {
            Some(block) if block.more && response.get_status().is_success() => block,
            _ => {
                status.complete = true;
                exchange.set_block_status(Direction::Request, Some(status));
                return Some(response);
            }
        };

        // the peer may ask for smaller blocks; resume at the same byte offset
        let sent = (confirmed.num as usize + 1) * status.block_size();
        status.szx = cmp::min(status.szx, confirmed.size_exponent);
        status.num = (sent / status.block_size()) as u32;
        let template = match exchange.request() {
            Some(request) => request,
            None => return Some(response),
        };
        if status.num as usize * status.block_size() >= status.payload.len() {
            warn!("peer {} confirmed past the end of the request body", exchange.peer());
            status.complete = true;
            exchange.set_block_status(Direction::Request, Some(status));
            return Some(response);
        }

        let block = Self::request_block(&template, &status, status.num);
        exchange.set_block_status(Direction::Request, Some(status));
        match block {
            Some(block) => {
                debug!("sending request block {:?} to {}", block.message.get_block1(), exchange.peer());
                chain.send_request(exchange, block);
            }
            None => chain
                .core()
                .fail_exchange(exchange, RequestError::Blockwise("request too large".to_string())),
        }
        None
    }

    /// Collects a Block2 response. Returns the whole response once the last
    /// block arrived.
    fn collect_download(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) -> Option<Response> {
        let existing = exchange.block_status(Direction::Response).filter(|s| !s.complete);
        let block = match response.message.get_block2() {
            Some(block) if block.more || block.num > 0 || existing.is_some() => block,
            _ => return Some(response),
        };
        let mut status = existing.unwrap_or_else(|| BlockwiseStatus::new(block.size_exponent, Vec::new()));

        if block.num < status.num {
            warn!("late response block {} from {}", block, exchange.peer());
            return None;
        }
        if block.num > status.num {
            warn!("response block {} from {} skips block {}", block, exchange.peer(), status.num);
            chain.core().fail_exchange(
                exchange,
                RequestError::Blockwise(format!("expected block {}, got {}", status.num, block.num)),
            );
            return None;
        }

        let limit = chain.config().max_resource_body_size;
        if status.payload.len() + response.get_payload().len() > limit {
            warn!("response body from {} exceeds {} bytes", exchange.peer(), limit);
            chain.core().fail_exchange(
                exchange,
                RequestError::Blockwise(format!("response body exceeds {} bytes", limit)),
            );
            return None;
        }

        status.payload.extend_from_slice(response.get_payload());
        status.num += 1;
        status.szx = block.size_exponent;

        if block.more {
            debug!("response block {} from {}", block, exchange.peer());
            exchange.set_block_status(Direction::Response, Some(status));
            return None;
        }

        status.complete = true;
        let mut assembled = response;
        assembled.set_payload(status.payload.clone());
        debug!(
            "reassembled {} byte response from {} in {} blocks",
            status.payload.len(),
            exchange.peer(),
            status.num
        );
        exchange.set_block_status(Direction::Response, Some(status));
        Some(assembled)
    }
}

impl Layer for BlockwiseLayer {
    fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        exchange.set_request(request.clone());
        if request.get_payload().len() <= chain.config().max_message_size {
            return chain.send_request(exchange, request);
        }

        let status = BlockwiseStatus::new(chain.core().default_szx, request.get_payload().to_vec());
        match Self::request_block(&request, &status, 0) {
            Some(block) => {
                debug!(
                    "sending {} byte request to {} in blocks of {}",
                    status.payload.len(),
                    exchange.peer(),
                    status.block_size()
                );
                exchange.set_block_status(Direction::Request, Some(status));
                chain.send_request(exchange, block)
            }
            None => chain
                .core()
                .fail_exchange(exchange, RequestError::Blockwise("request too large".to_string())),
        }
    }

    fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, mut response: Response) {
        if let Some(status) = exchange.block_status(Direction::Request).filter(|s| s.complete) {
            if let Some(echo) = block_value(status.num.saturating_sub(1), false, status.szx) {
                response.message.set_block1(echo);
            }
        }

        let config = chain.config();
        let requested = exchange.requested_szx();
        let limit = match requested {
            Some(szx) => cmp::min(1 << (szx + 4), config.max_message_size),
            None => config.max_message_size,
        };
        if response.get_payload().len() <= limit {
            return chain.send_response(exchange, response);
        }

        let szx = requested.unwrap_or(chain.core().default_szx);
        let mut status = BlockwiseStatus::new(szx, response.get_payload().to_vec());
        let first = match Self::response_block(&response, &status, 0) {
            Some(first) => first,
            None => return chain.send_response(exchange, response),
        };
        status.num = 1;
        status.complete = status.block_size() >= status.payload.len();
        debug!(
            "sending {} byte response to {} in blocks of {}",
            status.payload.len(),
            exchange.peer(),
            status.block_size()
        );
        {
            let mut state = exchange.state();
            state.response = Some(response);
            state.response_block = Some(status);
        }

        let push_now = first.get_type() != MessageType::Confirmable;
        chain.send_response(exchange, first);
        if push_now {
            Self::push_next_block(chain, exchange);
        }
    }

    fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if let Some(block2) = request.message.get_block2() {
            if block2.num == 0 {
                exchange.set_requested_szx(block2.size_exponent);
            }
        }

        match request.message.get_block1() {
            Some(block) => self.receive_request_block(chain, exchange, request, block),
            None => chain.receive_request(exchange, request),
        }
    }

    fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        let response = match self.continue_upload(chain, exchange, response) {
            Some(response) => response,
            None => return,
        };
        if let Some(response) = self.collect_download(chain, exchange, response) {
            chain.receive_response(exchange, response)
        }
    }

    fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        if exchange.origin() == Origin::Remote && empty.get_type() == MessageType::Acknowledgement {
            let pending = exchange
                .block_status(Direction::Response)
                .map_or(false, |status| !status.complete);
            if pending {
                return Self::push_next_block(chain, exchange);
            }
        }
        chain.receive_empty(exchange, empty)
    }
}
