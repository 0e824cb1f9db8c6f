// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thin HTTP/1.1 surface for the watermark service.
//
// The boundary is deliberately minimal: we parse the request head just far
// enough to route, and hand the heavy lifting to the request handler. A
// full HTTP framework would be overhead for two routes, so the framing is
// done directly on TCP, in the same spirit as serving a binary protocol.
//
// # Routes
//
//   - GET  /pdf/{name}/watermark?text=...   stream the watermarked PDF
//       200  chunked PDF bytes (admitted inline)
//       202  JSON {"destination": "watermarked_{name}"} (deferred)
//       404  source not found
//       500  transform failure
//   - GET|HEAD /pdf/{name}                  stream the stored PDF as-is
//
// Streaming uses chunked transfer encoding: the response status must be on
// the wire before the first page is stamped, and the total length is not
// known until the document is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stempel_core::error::{Result, StempelError};
use stempel_core::types::{ServerStatus, WatermarkRequest, destination_name};

use crate::handler::{RequestHandler, WatermarkOutcome};
use crate::resolver::FileResolver;

/// Maximum bytes accepted for a request head.
/// Prevents unbounded memory consumption from misbehaving clients.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Buffer size for the in-memory pipe between the pipeline and the socket.
const STREAM_BUFFER_BYTES: usize = 64 * 1024;

/// Read buffer for forwarding body bytes to the socket.
const FORWARD_CHUNK_BYTES: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Shared state passed to connection handlers
// ---------------------------------------------------------------------------

/// State shared across all connection-handling tasks.
struct SharedState {
    /// Orchestrates admission, pipeline, and deferral per request.
    handler: Arc<RequestHandler>,
    /// Storage capability for the passthrough route.
    resolver: Arc<dyn FileResolver>,
    /// Counter of active connections.
    active_connections: Arc<AtomicU32>,
    /// Root token; per-connection tokens are children so shutdown cancels
    /// in-flight pipelines.
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// WatermarkServer
// ---------------------------------------------------------------------------

/// HTTP surface for watermark requests.
///
/// Binds a TCP listener and serves each connection in its own task. One
/// request per connection; responses close the stream.
pub struct WatermarkServer {
    /// The TCP port to listen on (0 picks an ephemeral port).
    port: u16,
    /// Port actually bound, available after [`start`](Self::start).
    bound_port: Option<u16>,
    /// Current lifecycle state of the server.
    status: ServerStatus,
    /// Notification handle used to signal a graceful shutdown.
    shutdown_signal: Arc<Notify>,
    /// Cancels in-flight request pipelines on shutdown.
    cancel: CancellationToken,
    /// Handle to the Tokio task running the accept loop.
    task_handle: Option<JoinHandle<()>>,
    /// Counter of currently active TCP connections.
    active_connections: Arc<AtomicU32>,
    handler: Arc<RequestHandler>,
    resolver: Arc<dyn FileResolver>,
}

impl WatermarkServer {
    /// Create a new server bound to the given port.
    ///
    /// The server is created in `Stopped` state. Call [`start`](Self::start)
    /// to begin accepting connections.
    pub fn new(port: u16, handler: Arc<RequestHandler>, resolver: Arc<dyn FileResolver>) -> Self {
        Self {
            port,
            bound_port: None,
            status: ServerStatus::Stopped,
            shutdown_signal: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            task_handle: None,
            active_connections: Arc::new(AtomicU32::new(0)),
            handler,
            resolver,
        }
    }

    /// Return the current server status.
    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// The port the listener is bound to, once running.
    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Return the number of currently active client connections.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Start the server: bind, then accept connections on a spawned task.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            debug!(port = self.port, "watermark server already running");
            return Ok(());
        }

        self.status = ServerStatus::Starting;

        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| StempelError::Server(format!("bind {bind_addr}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| StempelError::Server(format!("local_addr: {e}")))?;
        self.bound_port = Some(bound.port());

        info!(port = bound.port(), "watermark server listening");

        let shutdown = Arc::clone(&self.shutdown_signal);
        let shared = Arc::new(SharedState {
            handler: Arc::clone(&self.handler),
            resolver: Arc::clone(&self.resolver),
            active_connections: Arc::clone(&self.active_connections),
            cancel: self.cancel.clone(),
        });

        let handle = tokio::spawn(async move {
            accept_loop(listener, shutdown, shared).await;
        });

        self.task_handle = Some(handle);
        self.status = ServerStatus::Running;
        Ok(())
    }

    /// Gracefully stop the server.
    ///
    /// Signals the accept loop to exit, cancels in-flight pipelines, and
    /// awaits the accept task.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }

        info!("stopping watermark server");
        self.shutdown_signal.notify_one();
        self.cancel.cancel();

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| StempelError::Server(format!("task join: {e}")))?;
        }

        self.status = ServerStatus::Stopped;
        info!("watermark server stopped");
        Ok(())
    }
}

/// The main accept loop.
///
/// Runs until the shutdown signal is received. Each incoming connection is
/// handed off to [`handle_connection`] in a separate task.
async fn accept_loop(listener: TcpListener, shutdown: Arc<Notify>, shared: Arc<SharedState>) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("accept loop received shutdown signal");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "incoming connection");
                        let state = Arc::clone(&shared);
                        tokio::spawn(async move {
                            state.active_connections.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = handle_connection(stream, peer_addr, state.clone()).await {
                                warn!(peer = %peer_addr, error = %e, "connection handler error");
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// The slice of an HTTP request head this server cares about.
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    /// Path without the query string.
    path: String,
    /// Raw query string (without the leading '?'), if any.
    query: Option<String>,
}

/// Parse the request line of an HTTP/1.x head.
fn parse_request_head(head: &str) -> std::result::Result<RequestHead, String> {
    let request_line = head.lines().next().ok_or("empty request")?;
    let mut parts = request_line.split_whitespace();

    let method = parts.next().ok_or("missing method")?.to_string();
    let target = parts.next().ok_or("missing request target")?;
    let version = parts.next().ok_or("missing HTTP version")?;
    if !version.starts_with("HTTP/1.") {
        return Err(format!("unsupported version: {version}"));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    Ok(RequestHead {
        method,
        path,
        query,
    })
}

/// Look up a query parameter, percent-decoded.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(percent_decode(value));
        }
    }
    None
}

/// Minimal percent decoding: '+' becomes space, %XX becomes the byte.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' => {
                match (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    (Some(high), Some(low)) => {
                        decoded.push((high * 16 + low) as u8);
                        i += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Routes this server understands.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// `/pdf/{name}/watermark`
    Watermark { name: String },
    /// `/pdf/{name}`
    Passthrough { name: String },
    Unknown,
}

fn route(path: &str) -> Route {
    let Some(rest) = path.strip_prefix("/pdf/") else {
        return Route::Unknown;
    };
    if rest.is_empty() {
        return Route::Unknown;
    }
    match rest.strip_suffix("/watermark") {
        Some(name) if !name.is_empty() && !name.contains('/') => Route::Watermark {
            name: percent_decode(name),
        },
        Some(_) => Route::Unknown,
        None if !rest.contains('/') => Route::Passthrough {
            name: percent_decode(rest),
        },
        None => Route::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

/// Handle a single connection: read the head, route, respond, close.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<SharedState>,
) -> Result<()> {
    let head = match read_head(&mut stream).await? {
        Some(head) => head,
        None => {
            debug!(peer = %peer_addr, "connection closed before a full head arrived");
            return Ok(());
        }
    };

    let parsed = match parse_request_head(&head) {
        Ok(parsed) => parsed,
        Err(reason) => {
            warn!(peer = %peer_addr, reason, "malformed request");
            return write_simple(
                &mut stream,
                "400 Bad Request",
                "text/plain",
                b"malformed request",
            )
            .await;
        }
    };

    debug!(
        peer = %peer_addr,
        method = %parsed.method,
        path = %parsed.path,
        "request parsed"
    );

    match route(&parsed.path) {
        Route::Watermark { name } => {
            if parsed.method != "GET" {
                return write_simple(
                    &mut stream,
                    "405 Method Not Allowed",
                    "text/plain",
                    b"only GET is supported",
                )
                .await;
            }
            let Some(text) = query_param(parsed.query.as_deref(), "text") else {
                return write_simple(
                    &mut stream,
                    "400 Bad Request",
                    "text/plain",
                    b"missing 'text' query parameter",
                )
                .await;
            };
            serve_watermark(&mut stream, peer_addr, &state, name, text).await
        }
        Route::Passthrough { name } => {
            if parsed.method != "GET" && parsed.method != "HEAD" {
                return write_simple(
                    &mut stream,
                    "405 Method Not Allowed",
                    "text/plain",
                    b"only GET and HEAD are supported",
                )
                .await;
            }
            serve_passthrough(&mut stream, &state, &name, parsed.method == "HEAD").await
        }
        Route::Unknown => {
            write_simple(&mut stream, "404 Not Found", "text/plain", b"no such route").await
        }
    }
}

/// Read up to the end of the request head (CRLFCRLF), bounded by
/// [`MAX_HEAD_BYTES`]. Returns `None` on a premature close.
async fn read_head(stream: &mut TcpStream) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|e| StempelError::Server(format!("read head: {e}")))?;
        if read == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..read]);

        if buf.windows(4).any(|window| window == b"\r\n\r\n") {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(StempelError::Server("request head too large".into()));
        }
    }
}

/// Serve the watermark route.
///
/// The pipeline writes into an in-memory pipe; this task forwards those
/// bytes to the socket as chunked transfer encoding, writing the 200 header
/// lazily when the first body bytes arrive. If the handler finishes without
/// producing any bytes, the outcome decides the status line instead.
async fn serve_watermark(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    state: &Arc<SharedState>,
    name: String,
    text: String,
) -> Result<()> {
    let request = WatermarkRequest::new(name.clone(), text);
    let connection_cancel = state.cancel.child_token();

    let (sink, mut body) = tokio::io::duplex(STREAM_BUFFER_BYTES);
    let handler = Arc::clone(&state.handler);
    let pipeline_cancel = connection_cancel.clone();
    let run = tokio::spawn(async move {
        handler
            .handle(&request, Box::new(sink), pipeline_cancel)
            .await
    });

    let mut started_streaming = false;
    let mut forward = vec![0u8; FORWARD_CHUNK_BYTES];

    // Forward body bytes until the handler drops its sink (EOF).
    loop {
        let read = match body.read(&mut forward).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "body pipe failed");
                break;
            }
        };

        if !started_streaming {
            let header = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/pdf\r\n\
                 Content-Disposition: inline; filename={}\r\n\
                 Transfer-Encoding: chunked\r\n\
                 Connection: close\r\n\r\n",
                destination_name(&name)
            );
            if let Err(err) = stream.write_all(header.as_bytes()).await {
                // Client is gone: cancel the pipeline and drain.
                warn!(peer = %peer_addr, error = %err, "client disconnected before headers");
                connection_cancel.cancel();
                break;
            }
            started_streaming = true;
        }

        if let Err(err) = write_chunk(stream, &forward[..read]).await {
            warn!(peer = %peer_addr, error = %err, "client disconnected mid-stream");
            connection_cancel.cancel();
            break;
        }
    }

    // Drain whatever the pipeline still writes after a cancel, so it can
    // finish its checkpoint instead of blocking on a full pipe.
    if connection_cancel.is_cancelled() {
        let mut scratch = vec![0u8; FORWARD_CHUNK_BYTES];
        while let Ok(read) = body.read(&mut scratch).await {
            if read == 0 {
                break;
            }
        }
    }

    let outcome = run
        .await
        .map_err(|e| StempelError::Server(format!("handler task join: {e}")))?;

    match outcome {
        WatermarkOutcome::Streamed { pages } => {
            info!(peer = %peer_addr, source = %name, pages, "watermark streamed");
            if started_streaming {
                finish_chunked(stream).await?;
            }
            Ok(())
        }
        WatermarkOutcome::Deferred { destination } => {
            let payload = format!("{{\"destination\":\"{destination}\"}}");
            write_simple(stream, "202 Accepted", "application/json", payload.as_bytes()).await
        }
        WatermarkOutcome::NotFound => {
            let payload = format!("PDF file '{name}' not found.");
            write_simple(stream, "404 Not Found", "text/plain", payload.as_bytes()).await
        }
        WatermarkOutcome::Failed(err) => {
            error!(peer = %peer_addr, source = %name, error = %err, "watermark request failed");
            if started_streaming {
                // The 200 is already on the wire; a truncated chunked body
                // tells the client the transfer died.
                Ok(())
            } else {
                write_simple(
                    stream,
                    "500 Internal Server Error",
                    "text/plain",
                    b"An error occurred while processing the PDF.",
                )
                .await
            }
        }
    }
}

/// Serve a stored PDF without transformation.
async fn serve_passthrough(
    stream: &mut TcpStream,
    state: &Arc<SharedState>,
    name: &str,
    head_only: bool,
) -> Result<()> {
    let mut source = match state.resolver.open_source(name).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            let body = format!("PDF file '{name}' not found.");
            return write_simple(stream, "404 Not Found", "text/plain", body.as_bytes()).await;
        }
        Err(err) => {
            error!(name, error = %err, "passthrough open failed");
            return write_simple(
                stream,
                "500 Internal Server Error",
                "text/plain",
                b"could not open the document",
            )
            .await;
        }
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/pdf\r\n\
         Content-Disposition: inline; filename={name}\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: close\r\n\r\n"
    );
    stream
        .write_all(header.as_bytes())
        .await
        .map_err(|e| StempelError::Server(format!("write header: {e}")))?;

    if head_only {
        return Ok(());
    }

    let mut buf = vec![0u8; FORWARD_CHUNK_BYTES];
    loop {
        let read = source
            .read(&mut buf)
            .await
            .map_err(|e| StempelError::Server(format!("read source: {e}")))?;
        if read == 0 {
            break;
        }
        write_chunk(stream, &buf[..read]).await?;
    }
    finish_chunked(stream).await
}

// ---------------------------------------------------------------------------
// Response writing
// ---------------------------------------------------------------------------

/// Write a complete non-streaming response.
async fn write_simple(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .await
        .map_err(|e| StempelError::Server(format!("write response: {e}")))?;
    stream
        .write_all(body)
        .await
        .map_err(|e| StempelError::Server(format!("write body: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| StempelError::Server(format!("flush: {e}")))?;
    Ok(())
}

/// Write one chunk of a chunked transfer encoding body.
async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    let size_line = format!("{:x}\r\n", data.len());
    stream
        .write_all(size_line.as_bytes())
        .await
        .map_err(|e| StempelError::Server(format!("write chunk size: {e}")))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| StempelError::Server(format!("write chunk: {e}")))?;
    stream
        .write_all(b"\r\n")
        .await
        .map_err(|e| StempelError::Server(format!("write chunk end: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| StempelError::Server(format!("flush chunk: {e}")))?;
    Ok(())
}

/// Terminate a chunked body.
async fn finish_chunked(stream: &mut TcpStream) -> Result<()> {
    stream
        .write_all(b"0\r\n\r\n")
        .await
        .map_err(|e| StempelError::Server(format!("write final chunk: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| StempelError::Server(format!("final flush: {e}")))?;
    Ok(())
}
