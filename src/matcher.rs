use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::NetworkConfig;
use crate::exchange::Exchange;
use crate::message::header::MessageType;
use crate::message::{EmptyMessage, IsMessage, Request, Response};
use crate::stack::StackCore;

/// Correlation key for a message ID used with a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyMid {
    pub peer: SocketAddr,
    pub mid: u16,
}

/// Correlation key for a token used with a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyToken {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
}

/// A table entry an exchange is registered under, kept by the exchange so
/// that completion can remove all of them at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MatcherKey {
    Mid(KeyMid),
    Token(KeyToken),
    Ongoing(KeyToken),
}

/// Result of matching an inbound message.
#[derive(Debug)]
pub enum MatchOutcome {
    /// Hand the message to this exchange.
    Deliver(Arc<Exchange>),
    /// Answer the message with RST and drop it.
    Reject,
    /// Drop the message silently.
    Drop,
}

struct DedupEntry {
    exchange: Arc<Exchange>,
    expires: Instant,
}

/// Remembers which exchange handled a peer's MID for one exchange lifetime.
pub struct Deduplicator {
    entries: HashMap<KeyMid, DedupEntry>,
    lifetime: Duration,
}

impl Deduplicator {
    pub fn new(lifetime: Duration) -> Deduplicator {
        Deduplicator {
            entries: HashMap::new(),
            lifetime,
        }
    }

    /// Registers `exchange` under `key` unless a live entry exists, in which
    /// case the previous exchange is returned.
    pub fn find_previous(&mut self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        let now = Instant::now();
        if let Some(previous) = self.find_at(&key, now) {
            return Some(previous);
        }
        self.entries.insert(
            key,
            DedupEntry {
                exchange: exchange.clone(),
                expires: now + self.lifetime,
            },
        );
        None
    }

    pub fn find(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        self.find_at(key, Instant::now())
    }

    fn find_at(&self, key: &KeyMid, now: Instant) -> Option<Arc<Exchange>> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.exchange.clone())
    }

    /// Drops expired entries and returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Tables {
    by_mid: HashMap<KeyMid, Arc<Exchange>>,
    by_token: HashMap<KeyToken, Arc<Exchange>>,
    ongoing: HashMap<KeyToken, Arc<Exchange>>,
    dedup: Deduplicator,
    next_mid: u16,
}

/// Correlates inbound messages with exchanges and filters duplicates.
pub struct Matcher {
    tables: Mutex<Tables>,
}

impl Matcher {
    pub fn new(config: &NetworkConfig) -> Matcher {
        Matcher {
            tables: Mutex::new(Tables {
                by_mid: HashMap::new(),
                by_token: HashMap::new(),
                ongoing: HashMap::new(),
                dedup: Deduplicator::new(config.exchange_lifetime),
                next_mid: rand::random(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token_in_use(&self, key: &KeyToken) -> bool {
        self.lock().by_token.contains_key(key)
    }

    /// Assigns a MID if needed and registers the request by MID and token.
    /// Returns false when the exchange is already complete and the request
    /// must not be sent.
    pub fn on_send_request(&self, exchange: &Arc<Exchange>, request: &mut Request) -> bool {
        if exchange.is_complete() {
            return false;
        }
        let peer = exchange.peer();
        let (key_mid, key_token) = {
            let mut tables = self.lock();
            let mid = match request.get_message_id() {
                Some(mid) => mid,
                None => {
                    let mid = tables.assign_mid();
                    request.set_message_id(mid);
                    mid
                }
            };
            let key_mid = KeyMid { peer, mid };
            let key_token = KeyToken {
                peer,
                token: request.get_token().to_vec(),
            };
            tables.by_mid.insert(key_mid, exchange.clone());
            tables.by_token.insert(key_token.clone(), exchange.clone());
            (key_mid, key_token)
        };

        exchange.add_key(MatcherKey::Mid(key_mid));
        exchange.add_key(MatcherKey::Token(key_token));
        exchange.set_current_request(request.clone());
        if exchange.is_complete() {
            self.remove_exchange(exchange, exchange.release());
            return false;
        }
        true
    }

    /// Assigns a MID if needed and registers CON responses by MID. Returns
    /// true when this response ends the exchange.
    pub fn on_send_response(&self, exchange: &Arc<Exchange>, response: &mut Response) -> bool {
        let peer = exchange.peer();
        let was_complete = exchange.is_complete();
        let mid = match response.get_message_id() {
            Some(mid) => mid,
            None => {
                let mid = self.lock().assign_mid();
                response.set_message_id(mid);
                mid
            }
        };
        if was_complete {
            return false;
        }

        let confirmable = response.is_confirmable();
        if confirmable {
            let key_mid = KeyMid { peer, mid };
            self.lock().by_mid.insert(key_mid, exchange.clone());
            exchange.add_key(MatcherKey::Mid(key_mid));
        }

        let mut state = exchange.state();
        state.current_response = Some(response.clone());
        !confirmable && state.is_final()
    }

    pub fn on_send_empty(&self, exchange: &Arc<Exchange>, empty: &EmptyMessage) {
        debug!(
            "{} for MID {:?} of {:?} exchange with {}",
            empty.get_type().short_name(),
            empty.get_message_id(),
            exchange.origin(),
            exchange.peer()
        );
    }

    /// Finds or creates the exchange of an inbound request. Retransmitted
    /// requests are flagged as duplicates and matched to their first
    /// exchange.
    pub fn on_receive_request(&self, request: &mut Request, stack: &Weak<StackCore>) -> MatchOutcome {
        let (peer, mid) = match (request.get_peer(), request.get_message_id()) {
            (Some(peer), Some(mid)) => (peer, mid),
            _ => return MatchOutcome::Drop,
        };
        let key_mid = KeyMid { peer, mid };
        let key_token = KeyToken {
            peer,
            token: request.get_token().to_vec(),
        };
        let block1 = request.message.get_block1();

        let mut tables = self.lock();
        if let Some(previous) = tables.dedup.find(&key_mid) {
            drop(tables);
            info!("duplicate request MID {} from {}", mid, peer);
            request.set_duplicate(true);
            return MatchOutcome::Deliver(previous);
        }

        match block1 {
            Some(block) if block.num > 0 => {
                let exchange = match tables.ongoing.get(&key_token) {
                    Some(exchange) => exchange.clone(),
                    None => {
                        warn!("block {} from {} without ongoing transfer", block, peer);
                        return MatchOutcome::Reject;
                    }
                };
                tables.dedup.find_previous(key_mid, &exchange);
                drop(tables);
                exchange.set_current_request(request.clone());
                MatchOutcome::Deliver(exchange)
            }
            _ => {
                let exchange = Exchange::new_remote(request.clone(), peer, stack.clone());
                tables.dedup.find_previous(key_mid, &exchange);
                let replaced = if block1.map_or(false, |block| block.more) {
                    tables.ongoing.insert(key_token.clone(), exchange.clone())
                } else {
                    None
                };
                drop(tables);

                if block1.map_or(false, |block| block.more) {
                    exchange.add_key(MatcherKey::Ongoing(key_token));
                }
                if let Some(replaced) = replaced {
                    info!("blockwise request from {} restarted", peer);
                    replaced.mark_complete();
                }
                MatchOutcome::Deliver(exchange)
            }
        }
    }

    /// Matches an inbound response to the request it answers.
    pub fn on_receive_response(&self, response: &mut Response) -> MatchOutcome {
        let (peer, mid) = match (response.get_peer(), response.get_message_id()) {
            (Some(peer), Some(mid)) => (peer, mid),
            _ => return MatchOutcome::Drop,
        };
        let key_mid = KeyMid { peer, mid };
        let key_token = KeyToken {
            peer,
            token: response.get_token().to_vec(),
        };

        match response.get_type() {
            MessageType::Acknowledgement => {
                let exchange = match self.lock().by_token.get(&key_token) {
                    Some(exchange) => exchange.clone(),
                    None => {
                        debug!("unsolicited piggy-backed response MID {} from {}", mid, peer);
                        return MatchOutcome::Drop;
                    }
                };
                let expected = exchange.current_request().and_then(|r| r.get_message_id());
                if expected != Some(mid) {
                    warn!(
                        "piggy-backed response MID {} from {} does not match request MID {:?}",
                        mid, peer, expected
                    );
                    return MatchOutcome::Reject;
                }
                MatchOutcome::Deliver(exchange)
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                let mut tables = self.lock();
                if let Some(previous) = tables.dedup.find(&key_mid) {
                    drop(tables);
                    info!("duplicate response MID {} from {}", mid, peer);
                    response.set_duplicate(true);
                    return MatchOutcome::Deliver(previous);
                }
                match tables.by_token.get(&key_token).cloned() {
                    Some(exchange) => {
                        tables.dedup.find_previous(key_mid, &exchange);
                        MatchOutcome::Deliver(exchange)
                    }
                    None => {
                        drop(tables);
                        info!("unsolicited response MID {} from {}", mid, peer);
                        MatchOutcome::Reject
                    }
                }
            }
            MessageType::Reset => MatchOutcome::Drop,
        }
    }

    /// Matches an ACK or RST to the message it acknowledges.
    pub fn on_receive_empty(&self, empty: &EmptyMessage) -> MatchOutcome {
        let (peer, mid) = match (empty.get_peer(), empty.get_message_id()) {
            (Some(peer), Some(mid)) => (peer, mid),
            _ => return MatchOutcome::Drop,
        };
        match self.lock().by_mid.get(&KeyMid { peer, mid }) {
            Some(exchange) => MatchOutcome::Deliver(exchange.clone()),
            None => {
                debug!("{} MID {} from {} matches nothing", empty.get_type().short_name(), mid, peer);
                MatchOutcome::Drop
            }
        }
    }

    /// Removes `exchange` from the tables under `keys`. Entries that have
    /// since been taken over by another exchange are left alone.
    pub(crate) fn remove_exchange(&self, exchange: &Arc<Exchange>, keys: Vec<MatcherKey>) {
        let mut tables = self.lock();
        for key in keys {
            match key {
                MatcherKey::Mid(key) => {
                    if tables.by_mid.get(&key).map_or(false, |e| Arc::ptr_eq(e, exchange)) {
                        tables.by_mid.remove(&key);
                    }
                }
                MatcherKey::Token(key) => {
                    if tables.by_token.get(&key).map_or(false, |e| Arc::ptr_eq(e, exchange)) {
                        tables.by_token.remove(&key);
                    }
                }
                MatcherKey::Ongoing(key) => {
                    if tables.ongoing.get(&key).map_or(false, |e| Arc::ptr_eq(e, exchange)) {
                        tables.ongoing.remove(&key);
                    }
                }
            }
        }
    }

    /// Drops expired deduplication entries.
    pub fn sweep(&self) -> usize {
        let removed = self.lock().dedup.sweep();
        if removed > 0 {
            debug!("swept {} deduplication entries", removed);
        }
        removed
    }

    /// Exchanges currently correlated by MID, token or ongoing transfer.
    pub fn live_exchanges(&self) -> usize {
        let tables = self.lock();
        let mut live: Vec<*const Exchange> = tables
            .by_mid
            .values()
            .chain(tables.by_token.values())
            .chain(tables.ongoing.values())
            .map(Arc::as_ptr)
            .collect();
        live.sort();
        live.dedup();
        live.len()
    }

    pub fn dedup_entries(&self) -> usize {
        self.lock().dedup.len()
    }
}

impl Tables {
    fn assign_mid(&mut self) -> u16 {
        let mid = self.next_mid;
        self.next_mid = self.next_mid.wrapping_add(1);
        mid
    }
}
