use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::exchange::Exchange;
use crate::message::{EmptyMessage, Request, Response};
use crate::stack::StackCore;

pub mod blockwise;
pub mod reliability;
pub mod token;

pub use blockwise::BlockwiseLayer;
pub use reliability::ReliabilityLayer;
pub use token::TokenLayer;

/// One stage of the stack. Every hook forwards unchanged unless overridden.
pub trait Layer: Send + Sync {
    fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        chain.send_request(exchange, request)
    }

    fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        chain.send_response(exchange, response)
    }

    fn send_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        chain.send_empty(exchange, empty)
    }

    fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        chain.receive_request(exchange, request)
    }

    fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        chain.receive_response(exchange, response)
    }

    fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        chain.receive_empty(exchange, empty)
    }
}

/// Cursor handed to a layer: sending continues with the layer below it,
/// receiving with the layer above it.
pub struct Chain<'a> {
    core: &'a Arc<StackCore>,
    position: usize,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(core: &'a Arc<StackCore>, position: usize) -> Chain<'a> {
        Chain { core, position }
    }

    pub(crate) fn core(&self) -> &'a Arc<StackCore> {
        self.core
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    fn below(&self) -> Option<(&'a dyn Layer, Chain<'a>)> {
        let next = self.position + 1;
        self.core
            .layers()
            .get(next)
            .map(|layer| (layer.as_ref(), Chain::new(self.core, next)))
    }

    fn above(&self) -> Option<(&'a dyn Layer, Chain<'a>)> {
        let previous = self.position.checked_sub(1)?;
        self.core
            .layers()
            .get(previous)
            .map(|layer| (layer.as_ref(), Chain::new(self.core, previous)))
    }

    pub fn send_request(&self, exchange: &Arc<Exchange>, request: Request) {
        match self.below() {
            Some((layer, chain)) => layer.send_request(&chain, exchange, request),
            None => self.core.transmit_request(exchange, request),
        }
    }

    pub fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.below() {
            Some((layer, chain)) => layer.send_response(&chain, exchange, response),
            None => self.core.transmit_response(exchange, response),
        }
    }

    pub fn send_empty(&self, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        match self.below() {
            Some((layer, chain)) => layer.send_empty(&chain, exchange, empty),
            None => self.core.transmit_empty(exchange, empty),
        }
    }

    pub fn receive_request(&self, exchange: &Arc<Exchange>, request: Request) {
        match self.above() {
            Some((layer, chain)) => layer.receive_request(&chain, exchange, request),
            None => self.core.deliver_request(exchange, request),
        }
    }

    pub fn receive_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.above() {
            Some((layer, chain)) => layer.receive_response(&chain, exchange, response),
            None => self.core.deliver_response(exchange, response),
        }
    }

    pub fn receive_empty(&self, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        match self.above() {
            Some((layer, chain)) => layer.receive_empty(&chain, exchange, empty),
            None => self.core.deliver_empty(exchange, empty),
        }
    }
}
