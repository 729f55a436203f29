use std::sync::Arc;

use log::trace;

use super::{Chain, Layer};
use crate::exchange::Exchange;
use crate::matcher::KeyToken;
use crate::message::{IsMessage, Request};

pub const TOKEN_LENGTH: usize = 4;

/// Gives every outgoing request without a token a random one that is not in
/// use with the same peer.
#[derive(Debug, Default)]
pub struct TokenLayer;

impl Layer for TokenLayer {
    fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, mut request: Request) {
        if request.get_token().is_empty() {
            let peer = exchange.peer();
            let token = loop {
                let candidate: [u8; TOKEN_LENGTH] = rand::random();
                let key = KeyToken {
                    peer,
                    token: candidate.to_vec(),
                };
                if !chain.core().matcher.token_in_use(&key) {
                    break key.token;
                }
            };
            trace!("token {:02x?} for request to {}", token, peer);
            request.set_token(token);
        }
        chain.send_request(exchange, request)
    }
}
