use std::collections::HashMap;
use std::future::Future;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, warn};
use regex::Regex;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::NetworkConfig;
use crate::exchange::Exchange;
use crate::message::request::Method;
use crate::message::{IsMessage, Request, Response};
use crate::stack::{CoapStack, MessageDeliverer, Outbox, StackError};
use crate::transport::{Transport, COAP_MTU};

pub const DEFAULT_PORT: u16 = 5683;

/// The parts of a `coap://` URL a request is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

pub fn parse_coap_url(url: &str) -> Result<CoapUrl> {
    let url_params = match Url::parse(url) {
        Ok(url_params) => url_params,
        Err(_) => return Err(Error::new(ErrorKind::InvalidInput, "url error")),
    };

    let scheme = url_params.scheme().to_string();
    if scheme != "coap" {
        return Err(Error::new(ErrorKind::Unsupported, "unsupported scheme"));
    }

    let host = match url_params.host_str() {
        Some("") | None => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
        Some(h) => h,
    };
    let brackets = Regex::new(r"^\[(.*?)]$").map_err(|e| Error::new(ErrorKind::Other, e))?;
    let host = brackets.replace(host, "$1").to_string();

    Ok(CoapUrl {
        scheme,
        host,
        port: url_params.port().unwrap_or(DEFAULT_PORT),
        path: url_params.path().to_string(),
        query: url_params.query().map(str::to_string),
    })
}

/// Runs an async handler for every request the stack delivers.
struct HandlerDeliverer<F> {
    handler: F,
}

impl<F, Fut> MessageDeliverer for HandlerDeliverer<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Request) {
        let reply = (self.handler)(request);
        tokio::spawn(async move {
            match reply.await {
                Some(response) => {
                    if let Err(e) = exchange.respond(response) {
                        warn!("cannot respond to {}: {}", exchange.peer(), e);
                    }
                }
                None => {
                    if let Err(e) = exchange.accept() {
                        debug!("cannot accept request from {}: {}", exchange.peer(), e);
                    }
                    exchange.mark_complete();
                }
            }
        });
    }
}

/// A CoAP endpoint: a [`CoapStack`] bound to a datagram transport.
///
/// The endpoint both serves requests (see [`Endpoint::serve`]) and sends
/// them. Its receiver and sender tasks stop when it is dropped.
pub struct Endpoint {
    stack: CoapStack,
    local_addr: SocketAddr,
    nstart: Mutex<HashMap<SocketAddr, Arc<Semaphore>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Endpoint {
    /// Binds a UDP socket to `addr`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: NetworkConfig) -> Result<Endpoint> {
        let socket = UdpSocket::bind(addr).await?;
        Endpoint::from_transport(socket, config)
    }

    pub fn from_transport<T: Transport + 'static>(transport: T, config: NetworkConfig) -> Result<Endpoint> {
        let local_addr = transport.local_addr()?;
        let (stack, outbox) = CoapStack::new(config)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let receiver = tokio::spawn(Self::receive_loop(transport.clone(), stack.clone()));
        let sender = tokio::spawn(Self::send_loop(transport, outbox));
        debug!("endpoint listening on {}", local_addr);

        Ok(Endpoint {
            stack,
            local_addr,
            nstart: Mutex::new(HashMap::new()),
            tasks: vec![receiver, sender],
        })
    }

    async fn receive_loop(transport: Arc<dyn Transport>, stack: CoapStack) {
        let mut buf = vec![0u8; COAP_MTU];
        loop {
            match transport.recv_from(&mut buf).await {
                Ok((n, peer)) => stack.receive_data(&buf[..n], peer),
                // ICMP errors surface on the next read of a UDP socket
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                    warn!("transport error: {}", e)
                }
                Err(e) => {
                    error!("receiver stopped: {}", e);
                    return;
                }
            }
        }
    }

    async fn send_loop(transport: Arc<dyn Transport>, mut outbox: Outbox) {
        while let Some((datagram, peer)) = outbox.recv().await {
            if let Err(e) = transport.send_to(&datagram, peer).await {
                error!("cannot send {} bytes to {}: {}", datagram.len(), peer, e);
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stack(&self) -> &CoapStack {
        &self.stack
    }

    /// Answers every incoming request with `handler`. Returning `None`
    /// acknowledges the request without a response.
    pub fn serve<F, Fut>(&self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.stack.set_deliverer(Arc::new(HandlerDeliverer { handler }));
    }

    fn nstart_for(&self, peer: SocketAddr) -> Arc<Semaphore> {
        let nstart = self.stack.config().nstart;
        self.nstart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer)
            .or_insert_with(|| Arc::new(Semaphore::new(nstart)))
            .clone()
    }

    /// Forgets the semaphore of `peer` once no request holds or awaits it.
    fn release_nstart(&self, peer: SocketAddr, semaphore: Arc<Semaphore>) {
        let mut nstart = self.nstart.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = match nstart.get(&peer) {
            Some(tracked) => Arc::ptr_eq(tracked, &semaphore) && Arc::strong_count(&semaphore) == 2,
            None => false,
        };
        if idle {
            nstart.remove(&peer);
        }
    }

    /// Number of peers with an NSTART semaphore.
    pub fn tracked_peers(&self) -> usize {
        self.nstart.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sends `request` and waits for its response. At most `NSTART`
    /// requests are outstanding with one peer at a time.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let peer = request.get_peer().ok_or(StackError::DestinationUnset)?;
        let semaphore = self.nstart_for(peer);
        let result = self.send_gated(&semaphore, request).await;
        self.release_nstart(peer, semaphore);
        result
    }

    async fn send_gated(&self, semaphore: &Arc<Semaphore>, request: Request) -> Result<Response> {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StackError::Closed)?;
        let pending = self.stack.send_request(request)?;
        pending.exchange().attach_permit(permit);
        Ok(pending.wait().await?)
    }

    async fn resolve(&self, url: &CoapUrl) -> Result<SocketAddr> {
        let mut candidates = lookup_host((url.host.as_str(), url.port)).await?;
        candidates
            .find(|addr| addr.is_ipv4() == self.local_addr.is_ipv4())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no address for host"))
    }

    async fn request(&self, method: Method, url: &str, payload: Option<Vec<u8>>) -> Result<Response> {
        let url = parse_coap_url(url)?;
        let peer = self.resolve(&url).await?;

        let mut request = Request::with_method(method, &url.path);
        if let Some(query) = &url.query {
            request.set_query(query);
        }
        if url.host.parse::<IpAddr>().is_err() {
            request.set_uri_host(&url.host);
        }
        if let Some(payload) = payload {
            request.set_payload(payload);
        }
        request.set_peer(peer);
        self.send(request).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::Get, url, None).await
    }

    pub async fn post(&self, url: &str, data: Vec<u8>) -> Result<Response> {
        self.request(Method::Post, url, Some(data)).await
    }

    pub async fn put(&self, url: &str, data: Vec<u8>) -> Result<Response> {
        self.request(Method::Put, url, Some(data)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Method::Delete, url, None).await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
