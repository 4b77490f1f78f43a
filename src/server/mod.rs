//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Connections are persistent unless either side asks to close.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// How long in-flight requests may run after shutdown starts.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

/// The listening half of the gateway.
///
/// # Examples
///
/// ```rust,no_run
/// use dashgate::server::Server;
/// use dashgate::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    drain_timeout: Duration,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Sets how long [`run_until`](Self::run_until) waits for in-flight
    /// requests once shutdown fires. Connections still busy after that are
    /// aborted.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching each request to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending::<()>()).await
    }

    /// Accepts connections until `shutdown` resolves, then drains.
    ///
    /// Each connection runs on its own Tokio task, so a slow upstream call in
    /// one request never holds up another. On shutdown the listener stops
    /// accepting, idle keep-alive connections are closed, and requests already
    /// being handled get up to the drain timeout to finish. Their responses
    /// are sent with `Connection: close`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        info!(address = %self.local_addr, "dashgate listening");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let stop = stop_rx.clone();

            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, stop).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        drop(self.listener);
        let _ = stop_tx.send(true);
        info!(
            connections = connections.len(),
            "shutdown signal received, draining connections"
        );

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                timeout = ?self.drain_timeout,
                "drain timeout elapsed, aborting connections"
            );
            connections.shutdown().await;
        }

        Ok(())
    }
}

async fn reject(stream: &mut TcpStream, response: Response) -> Result<(), std::io::Error> {
    stream
        .write_all(&response.keep_alive(false).into_bytes())
        .await?;
    stream.flush().await
}

/// Handles a single TCP connection over its lifetime.
///
/// Reads one request per iteration until the peer closes the connection,
/// signals `Connection: close`, or `stop` flips while the connection is idle.
/// Bytes past the current request's body stay in the buffer for the next
/// iteration.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // A pipelined request may already be sitting in the buffer.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (request, body_offset) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request head too large, sending 413");
                    return reject(
                        &mut stream,
                        Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                            .body("Request entity too large"),
                    )
                    .await;
                }
                if buf.is_empty() && *stop.borrow() {
                    debug!(peer = %peer_addr, "closing idle connection for shutdown");
                    return Ok(());
                }
                let read = tokio::select! {
                    read = stream.read_buf(&mut buf) => read?,
                    _ = stop.changed(), if buf.is_empty() => {
                        debug!(peer = %peer_addr, "closing idle connection for shutdown");
                        return Ok(());
                    }
                };
                if read == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                return reject(
                    &mut stream,
                    Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}")),
                )
                .await;
            }
        };

        if request.is_chunked() {
            warn!(peer = %peer_addr, "chunked request body, sending 411");
            return reject(
                &mut stream,
                Response::new(StatusCode::LENGTH_REQUIRED).body("Content-Length required"),
            )
            .await;
        }

        let content_length = match request.content_length() {
            Ok(len) => len,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                return reject(
                    &mut stream,
                    Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}")),
                )
                .await;
            }
        };

        let total_needed = body_offset.saturating_add(content_length);
        if total_needed > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, content_length, "request too large, sending 413");
            return reject(
                &mut stream,
                Response::new(StatusCode::PAYLOAD_TOO_LARGE).body("Request entity too large"),
            )
            .await;
        }

        while buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                return Ok(());
            }
        }

        let mut consumed = buf.split_to(total_needed);
        let body = consumed.split_off(body_offset).freeze();
        let request = request.with_body(body);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await;
        let keep_alive = keep_alive && !*stop.borrow();
        let response = response.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            return Ok(());
        }
    }
}
