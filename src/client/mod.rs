//! HTTP client and keep-alive connection pool, keyed by `(host, port, scheme)`.
//!
//! The server side of this crate (`server::server_impl`, `http::request`) never
//! needed an outbound client, so this module has no direct teacher counterpart;
//! its pool mechanics (free-list keyed by destination, eviction by age/request
//! count, a `Drop`-based return-to-pool handle) follow the donor pack's
//! `clawde-io-apps` connection pool and `fraiseql`'s pool config-struct idiom,
//! adapted from WebSocket multiplexing to plain HTTP/1.1 request-response.

mod response;

pub use response::ClientResponse;
pub(crate) use response::{build_request, read_response};

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, warn};

use crate::{http::types::Method, limits::PoolLimits, stream::SocketStream};

/// The scheme a pooled connection was opened under. Kept distinct from `port` in
/// the pool key because two backends can share a host/port and still need
/// separate connections (e.g. a reverse-proxied `https` front door terminating
/// onto the same port a `http` health check probes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Identifies a pooled backend: `host`/`port` name the TCP endpoint, `scheme`
/// distinguishes plain from TLS, and `vhost` carries the `Host` header to send
/// when it differs from `host` (e.g. connecting to a shared load balancer IP on
/// behalf of several virtual hosts). Two requests only ever share a pooled
/// connection when all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub vhost: Option<String>,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: Scheme::Http,
            vhost: None,
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    /// The name to send in the `Host` header: `vhost` when set, else `host`.
    pub(crate) fn host_header_name(&self) -> &str {
        self.vhost.as_deref().unwrap_or(&self.host)
    }
}

/// The outcome of [`ClientPool::do_request`], mirroring the donor's result-variant
/// contract rather than a single opaque I/O error: callers branch on *why* a
/// request failed (a dead pool entry is retryable with a fresh connection; a
/// malformed URL is not).
#[derive(Debug, PartialEq, Eq)]
pub enum ClientError {
    InvalidUrl,
    InvalidHost,
    ConnectFail,
    SendCloseByPeer,
    SendSocketError,
    Timeout,
    CreateSocketError,
    PoolGetConnection,
    PoolInvalidConnection,
}

struct Idle {
    stream: SocketStream,
    created: Instant,
    request_count: usize,
}

impl Idle {
    fn is_eligible(&self, limits: &PoolLimits) -> bool {
        self.created.elapsed() < limits.max_alive && self.request_count < limits.max_request
    }
}

struct PoolState {
    free: HashMap<PoolKey, VecDeque<Idle>>,
}

/// A pooled HTTP client. One instance is typically shared (behind an `Arc`) across
/// all of a gateway worker's outbound calls to backend services.
pub struct ClientPool {
    limits: PoolLimits,
    state: Mutex<PoolState>,
}

impl ClientPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(PoolState { free: HashMap::new() }),
        }
    }

    /// Pops an eligible idle connection for `key`, or opens a fresh one.
    /// `max_size` bounds only how many idle connections are *retained* on return;
    /// it never refuses to hand out a new connection when the free-list is empty
    /// or exhausted.
    pub async fn get_connection(&self, key: &PoolKey) -> Result<PooledConnection, ClientError> {
        let reused = {
            let mut state = self.state.lock().expect("client pool poisoned");
            let list = state.free.entry(key.clone()).or_default();
            loop {
                match list.pop_front() {
                    Some(idle) if idle.is_eligible(&self.limits) => break Some(idle),
                    Some(_) => continue, // stale: drop it, keep scanning
                    None => break None,
                }
            }
        };

        let (stream, created, request_count) = match reused {
            Some(idle) => {
                debug!(host = %key.host, port = key.port, scheme = key.scheme.as_str(), "reused pooled connection");
                (idle.stream, idle.created, idle.request_count)
            }
            None => {
                let tcp = TcpStream::connect((key.host.as_str(), key.port))
                    .await
                    .map_err(|_| ClientError::ConnectFail)?;
                let stream = SocketStream::from_connected(tcp).map_err(|_| ClientError::CreateSocketError)?;
                (stream, Instant::now(), 0)
            }
        };

        Ok(PooledConnection {
            pool: self,
            key: key.clone(),
            stream: Some(stream),
            created,
            request_count,
            poisoned: false,
        })
    }

    fn return_connection(&self, key: PoolKey, stream: SocketStream, created: Instant, request_count: usize) {
        let idle = Idle {
            stream,
            created,
            request_count,
        };
        if !idle.is_eligible(&self.limits) {
            return;
        }
        let mut state = self.state.lock().expect("client pool poisoned");
        let list = state.free.entry(key).or_default();
        if list.len() < self.limits.max_size {
            list.push_back(idle);
        }
    }

    /// Sends `method path` against `key`'s host, with `headers` and `body`, waiting
    /// up to `timeout_dur` for the full response. Always ensures a `Host` header is
    /// present, per the donor's "builds the request ensuring Host exists" contract.
    pub async fn do_request(
        &self,
        key: &PoolKey,
        method: Method,
        path: &str,
        mut headers: Vec<(String, String)>,
        body: &[u8],
        timeout_dur: Duration,
    ) -> Result<ClientResponse, ClientError> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(ClientError::InvalidUrl);
        }
        if key.host.is_empty() {
            return Err(ClientError::InvalidHost);
        }
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
            headers.push(("Host".to_string(), format!("{}:{}", key.host_header_name(), key.port)));
        }

        let mut conn = self.get_connection(key).await.map_err(|_| ClientError::PoolGetConnection)?;
        let stream = conn
            .stream
            .as_mut()
            .ok_or(ClientError::PoolInvalidConnection)?;

        let request_bytes = response::build_request(method, path, &headers, body);
        timeout(timeout_dur, stream.write_fix_size(&request_bytes))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::SendSocketError)?;

        let result = timeout(timeout_dur, response::read_response(stream)).await;
        match result {
            Err(_) => {
                conn.poisoned = true;
                Err(ClientError::Timeout)
            }
            Ok(Err(response::ResponseReadError::PeerClosed)) => {
                conn.poisoned = true;
                Err(ClientError::SendCloseByPeer)
            }
            Ok(Err(response::ResponseReadError::Io)) => {
                conn.poisoned = true;
                Err(ClientError::SendSocketError)
            }
            Ok(Err(response::ResponseReadError::Malformed(msg))) => {
                warn!(error = %msg, "malformed http response from backend");
                conn.poisoned = true;
                Err(ClientError::SendSocketError)
            }
            Ok(Ok(resp)) => {
                if resp.close {
                    conn.poisoned = true;
                }
                Ok(resp)
            }
        }
    }
}

/// A connection on loan from a [`ClientPool`]. Returned to the free-list on drop if
/// it's still eligible by the pool's age/request-count rules and wasn't marked
/// poisoned by a failed exchange; otherwise simply dropped, closing the socket.
pub struct PooledConnection<'p> {
    pool: &'p ClientPool,
    key: PoolKey,
    stream: Option<SocketStream>,
    created: Instant,
    request_count: usize,
    poisoned: bool,
}

impl PooledConnection<'_> {
    pub fn stream_mut(&mut self) -> Option<&mut SocketStream> {
        self.stream.as_mut()
    }

    /// Takes ownership of the underlying stream without returning it to the pool,
    /// for a caller that hijacks the connection for another protocol (e.g. a
    /// completed WebSocket upgrade).
    pub fn into_stream(mut self) -> Option<SocketStream> {
        self.poisoned = true;
        self.stream.take()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Some(stream) = self.stream.take() {
            self.pool
                .return_connection(self.key.clone(), stream, self.created, self.request_count + 1);
        }
    }
}
