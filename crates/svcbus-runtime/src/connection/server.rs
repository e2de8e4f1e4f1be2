//! Server side socket, admission policy and cookie allocation

use std::collections::HashSet;
use std::net::SocketAddr;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info};

use svcbus_core::{AdmissionConfig, AdmissionDefault, Cookie, SvcbusResult};

use crate::service::handler::ConnectionAcceptor;

// ----------------------------------------------------------------------------
// Admission
// ----------------------------------------------------------------------------

/// Host based admission: the blacklist wins, then the whitelist, then the
/// configured default
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    default: AdmissionDefault,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            default: config.default,
            whitelist: config.whitelist.iter().cloned().collect(),
            blacklist: config.blacklist.iter().cloned().collect(),
        }
    }

    pub fn admits(&self, host: &str) -> bool {
        if self.blacklist.contains(host) {
            return false;
        }
        if self.whitelist.contains(host) {
            return true;
        }
        self.default == AdmissionDefault::Accept
    }
}

impl ConnectionAcceptor for AdmissionPolicy {
    fn accept_connection(&self, address: &SocketAddr) -> bool {
        self.admits(&address.ip().to_string())
    }
}

// ----------------------------------------------------------------------------
// Cookie Allocation
// ----------------------------------------------------------------------------

/// Mints cookies that are unique among live peers. The counter starts at the
/// configured first cookie, skips sentinels and cookies still in use, and
/// wraps back to the first cookie.
#[derive(Debug, Clone)]
pub struct CookieAllocator {
    first: u64,
    next: u64,
    live: HashSet<Cookie>,
}

impl CookieAllocator {
    pub fn new(first: Cookie) -> Self {
        let first = if first.is_sentinel() {
            Cookie::FIRST_REMOTE.value()
        } else {
            first.value()
        };
        Self {
            first,
            next: first,
            live: HashSet::new(),
        }
    }

    /// Number of cookies the allocator can hand out at once
    pub fn capacity(&self) -> u64 {
        Cookie::ANY.value() - self.first
    }

    /// Next free cookie, or `None` when every cookie in range is live
    pub fn mint(&mut self) -> Option<Cookie> {
        if self.live.len() as u64 >= self.capacity() {
            return None;
        }

        loop {
            let candidate = Cookie::new(self.next);
            self.next = match self.next.checked_add(1) {
                Some(next) if next != Cookie::ANY.value() => next,
                _ => self.first,
            };

            if candidate.is_sentinel() || self.live.contains(&candidate) {
                continue;
            }
            self.live.insert(candidate);
            return Some(candidate);
        }
    }

    /// Return a cookie when its peer is gone
    pub fn release(&mut self, cookie: Cookie) -> bool {
        self.live.remove(&cookie)
    }

    pub fn is_live(&self, cookie: Cookie) -> bool {
        self.live.contains(&cookie)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn clear(&mut self) {
        self.live.clear();
    }
}

// ----------------------------------------------------------------------------
// Server Connection
// ----------------------------------------------------------------------------

/// Listening socket. Bound on the runtime of the thread that accepts.
pub struct ServerConnection {
    local: SocketAddr,
    incoming: TcpListenerStream,
}

impl ServerConnection {
    pub async fn bind(address: &str) -> SvcbusResult<Self> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;
        info!(%local, "Listening");
        Ok(Self {
            local,
            incoming: TcpListenerStream::new(listener),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Next inbound socket with its remote address. Cancel safe.
    pub async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match self.incoming.next().await {
            Some(Ok(stream)) => {
                let remote = stream.peer_addr()?;
                debug!(%remote, "Inbound socket");
                Ok((stream, remote))
            }
            Some(Err(e)) => Err(e),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection").field("local", &self.local).finish()
    }
}

/// Turn an accepted socket into one blocking-free std handle per I/O thread
pub fn split_accepted(stream: TcpStream) -> SvcbusResult<(std::net::TcpStream, std::net::TcpStream)> {
    let stream = stream.into_std()?;
    stream.set_nodelay(true)?;
    Ok((stream.try_clone()?, stream))
}
