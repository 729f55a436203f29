use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::time;

use super::{Chain, Layer};
use crate::config::NetworkConfig;
use crate::exchange::{Exchange, Origin, RequestError, Target};
use crate::message::header::MessageType;
use crate::message::{EmptyMessage, IsMessage, Request, Response};
use crate::stack::StackCore;

/// Retransmits CON messages until they are acknowledged or rejected, and
/// acknowledges CON messages from the peer.
#[derive(Debug, Default)]
pub struct ReliabilityLayer;

/// First timeout of a CON transmission: `ACK_TIMEOUT * random(1, ACK_RANDOM_FACTOR)`.
pub fn initial_timeout(config: &NetworkConfig) -> Duration {
    let factor = if config.ack_random_factor > 1.0 {
        rand::thread_rng().gen_range(1.0..config.ack_random_factor)
    } else {
        1.0
    };
    config.ack_timeout.mul_f64(factor)
}

impl ReliabilityLayer {
    fn arm(chain: &Chain, exchange: &Arc<Exchange>, target: Target) {
        let timeout = initial_timeout(chain.config());
        let task = retransmit(
            Arc::downgrade(chain.core()),
            chain.position(),
            Arc::downgrade(exchange),
            target,
            timeout,
        );
        let handle = chain.core().spawn(task);
        exchange.start_retransmission(handle, timeout, target);
        debug!("armed retransmission to {} after {:?}", exchange.peer(), timeout);
    }

    fn resend_for_duplicate(chain: &Chain, exchange: &Arc<Exchange>, request: &Request) {
        enum Reply {
            Response(Response),
            Ack(EmptyMessage),
            Nothing,
        }

        let mid = request.get_message_id();
        let reply = {
            let state = exchange.state();
            let current_mid = state.current_request.as_ref().and_then(|r| r.get_message_id());
            match &state.current_response {
                Some(response)
                    if response.get_type() == MessageType::Acknowledgement
                        && response.get_message_id() == mid =>
                {
                    Reply::Response(response.clone())
                }
                Some(response)
                    if request.get_type() == MessageType::NonConfirmable && current_mid == mid =>
                {
                    Reply::Response(response.clone())
                }
                _ if request.is_confirmable() && state.acknowledged && current_mid == mid => {
                    Reply::Ack(EmptyMessage::ack_for(&request.message, exchange.peer()))
                }
                _ => Reply::Nothing,
            }
        };

        match reply {
            Reply::Response(response) => {
                info!("resending response to duplicate MID {:?} from {}", mid, exchange.peer());
                chain.send_response(exchange, response);
            }
            Reply::Ack(ack) => {
                info!("acknowledging duplicate MID {:?} from {} again", mid, exchange.peer());
                chain.send_empty(exchange, ack);
            }
            Reply::Nothing => debug!("ignoring duplicate MID {:?} from {}", mid, exchange.peer()),
        }
    }
}

impl Layer for ReliabilityLayer {
    fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if request.is_confirmable() {
            Self::arm(chain, exchange, Target::Request);
        }
        chain.send_request(exchange, request)
    }

    fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        match response.get_type() {
            MessageType::Confirmable => Self::arm(chain, exchange, Target::Response),
            MessageType::Acknowledgement => exchange.set_acknowledged(),
            _ => {}
        }
        chain.send_response(exchange, response)
    }

    fn send_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        if empty.get_type() == MessageType::Acknowledgement && exchange.origin() == Origin::Remote {
            exchange.set_acknowledged();
        }
        chain.send_empty(exchange, empty)
    }

    fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if request.is_duplicate() {
            Self::resend_for_duplicate(chain, exchange, &request);
            return;
        }
        chain.receive_request(exchange, request)
    }

    fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        // any response settles the request it answers
        exchange.stop_retransmission();
        match response.get_type() {
            MessageType::Acknowledgement => exchange.set_acknowledged(),
            MessageType::Confirmable => {
                if let Some(peer) = response.get_peer() {
                    chain.send_empty(exchange, EmptyMessage::ack_for(&response.message, peer));
                }
            }
            _ => {}
        }

        if response.is_duplicate() {
            debug!("dropping duplicate response MID {:?}", response.get_message_id());
            return;
        }
        chain.receive_response(exchange, response)
    }

    fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, empty: EmptyMessage) {
        let in_flight = exchange.in_flight_message_id();
        if in_flight != empty.get_message_id() {
            debug!(
                "{} MID {:?} does not match in-flight MID {:?}",
                empty.get_type().short_name(),
                empty.get_message_id(),
                in_flight
            );
            return;
        }

        exchange.stop_retransmission();
        match empty.get_type() {
            MessageType::Acknowledgement => {
                if exchange.origin() == Origin::Local {
                    exchange.set_acknowledged();
                }
            }
            MessageType::Reset => info!("peer {} reset MID {:?}", exchange.peer(), in_flight),
            _ => return,
        }
        chain.receive_empty(exchange, empty)
    }
}

async fn retransmit(
    stack: Weak<StackCore>,
    position: usize,
    exchange: Weak<Exchange>,
    target: Target,
    mut timeout: Duration,
) {
    loop {
        time::sleep(timeout).await;

        let (core, exchange) = match (stack.upgrade(), exchange.upgrade()) {
            (Some(core), Some(exchange)) => (core, exchange),
            _ => return,
        };
        if exchange.is_complete() {
            return;
        }

        let max_retransmit = core.config.max_retransmit;
        let attempt = {
            let mut state = exchange.state();
            let retransmission = &mut state.retransmission;
            if retransmission.failed_count < max_retransmit {
                timeout *= 2;
                retransmission.failed_count += 1;
                retransmission.timeout = timeout;
                Some(retransmission.failed_count)
            } else {
                None
            }
        };

        let chain = Chain::new(&core, position);
        match attempt {
            Some(attempt) => {
                debug!(
                    "retransmission {}/{} to {}",
                    attempt,
                    max_retransmit,
                    exchange.peer()
                );
                match target {
                    Target::Request => {
                        if let Some(request) = exchange.current_request() {
                            chain.send_request(&exchange, request);
                        }
                    }
                    Target::Response => {
                        if let Some(response) = exchange.current_response() {
                            chain.send_response(&exchange, response);
                        }
                    }
                }
            }
            None => {
                warn!(
                    "no acknowledgement from {} after {} retransmissions",
                    exchange.peer(),
                    max_retransmit
                );
                match exchange.origin() {
                    Origin::Local => core.fail_exchange(&exchange, RequestError::TimedOut),
                    Origin::Remote => core.complete(&exchange),
                }
                return;
            }
        }
    }
}
