use std::time::Duration;

use bytes::BytesMut;
use http::{Method, StatusCode, Version};
use n0_error::{AnyError, anyerr, stack_error};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    BUFFER_SIZE, RESPONSE_HEAD_MAX_LENGTH,
    parse::HttpRequest,
    upstream::Dialer,
    util::{ChunkEndScanner, tunnel},
};

/// Headers with meaning only on a single transport leg; never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response written to the client once a CONNECT tunnel is up.
const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: MyProxy/1.0\r\n\r\n";

/// Timeouts applied by the forwarding engine.
#[derive(Debug, Clone)]
pub struct ForwardOpts {
    /// How long a CONNECT tunnel may sit without traffic before the idle
    /// check fires. The tunnel is kept open across idle periods.
    pub tunnel_idle_timeout: Duration,
    /// Bound on a single stalled tunnel write.
    pub tunnel_write_timeout: Duration,
}

impl Default for ForwardOpts {
    fn default() -> Self {
        Self {
            tunnel_idle_timeout: Duration::from_secs(30),
            tunnel_write_timeout: Duration::from_secs(5),
        }
    }
}

/// Error raised while forwarding a single request.
#[stack_error(add_meta, derive)]
pub struct ForwardError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl ForwardError {
    /// The status to surface to the client.
    ///
    /// `None` means response bytes were already committed (or the client is
    /// gone) and no synthetic response may be written.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    fn internal(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::INTERNAL_SERVER_ERROR), source.into())
    }

    fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}

/// Drives client requests to origin servers and relays responses back.
///
/// Requests are dispatched by shape: CONNECT becomes an opaque tunnel,
/// requests that carry a body take the streaming upload path, everything else
/// is forwarded head-only. The engine never closes the client socket; that
/// stays with the caller.
#[derive(Debug, Clone)]
pub struct Forwarder {
    dialer: Dialer,
    opts: ForwardOpts,
}

impl Forwarder {
    pub fn new(dialer: Dialer, opts: ForwardOpts) -> Self {
        Self { dialer, opts }
    }

    /// Forwards one parsed request, reading from and writing to `client`.
    ///
    /// On `Err`, the caller decides whether an error response may still be
    /// written (see [`ForwardError::response_status`]).
    pub async fn forward(
        &self,
        client: &mut TcpStream,
        req: &HttpRequest,
    ) -> Result<(), ForwardError> {
        if req.method == Method::CONNECT {
            self.forward_connect(client, req).await
        } else if req.carries_body() {
            self.forward_with_body(client, req).await
        } else {
            self.forward_bodyless(client, req).await
        }
    }

    /// GET-like path: forward the reconstructed head, relay the response.
    async fn forward_bodyless(
        &self,
        client: &mut TcpStream,
        req: &HttpRequest,
    ) -> Result<(), ForwardError> {
        info!(target = %req.target, "forwarding request to {}", req.authority);
        let mut upstream = self
            .dialer
            .dial(&req.authority)
            .await
            .map_err(ForwardError::bad_gateway)?;
        let head = build_forward_request(req);
        upstream
            .write_all(&head)
            .await
            .map_err(ForwardError::internal)?;
        self.relay_response(client, upstream, req).await
    }

    /// POST-like path: validate body framing, stream the body, relay the response.
    async fn forward_with_body(
        &self,
        client: &mut TcpStream,
        req: &HttpRequest,
    ) -> Result<(), ForwardError> {
        // Framing is validated before any dial happens.
        let content_length = req.content_length().map_err(ForwardError::bad_request)?;
        let chunked = req.is_chunked();
        if content_length.is_none() && !chunked && !req.body.is_empty() {
            return Err(ForwardError::bad_request(anyerr!(
                "request body without Content-Length or chunked framing"
            )));
        }

        info!(target = %req.target, "forwarding {} request to {}", req.method, req.authority);
        let mut upstream = self
            .dialer
            .dial(&req.authority)
            .await
            .map_err(ForwardError::bad_gateway)?;

        let mut head = build_forward_request(req);
        head.extend_from_slice(&req.body);
        upstream
            .write_all(&head)
            .await
            .map_err(ForwardError::internal)?;

        // Stream whatever part of the body the parser did not buffer.
        if chunked {
            let mut scanner = ChunkEndScanner::new();
            if !scanner.feed(&req.body) {
                relay_chunked_remainder(client, &mut upstream, scanner).await?;
            }
        } else if let Some(total) = content_length {
            let sent = req.body.len() as u64;
            if sent < total {
                relay_exact(client, &mut upstream, total - sent).await?;
            }
        }

        self.relay_response(client, upstream, req).await
    }

    /// CONNECT path: dial, confirm, then shuttle opaque bytes both ways.
    async fn forward_connect(
        &self,
        client: &mut TcpStream,
        req: &HttpRequest,
    ) -> Result<(), ForwardError> {
        info!("establishing tunnel to {}", req.authority);
        let mut upstream = self
            .dialer
            .dial(&req.authority)
            .await
            .map_err(ForwardError::bad_gateway)?;
        client
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(ForwardError::io)?;
        // Client bytes that arrived behind the CONNECT head already belong
        // to the tunnel.
        if !req.body.is_empty() {
            upstream
                .write_all(&req.body)
                .await
                .map_err(ForwardError::io)?;
        }
        debug!("tunnel established");
        if let Err(err) = tunnel(
            client,
            &upstream,
            self.opts.tunnel_idle_timeout,
            self.opts.tunnel_write_timeout,
        )
        .await
        {
            debug!("tunnel closed with error: {err:#}");
        }
        debug!("tunnel closed");
        // Dropping `upstream` closes it; the client socket stays open.
        Ok(())
    }

    /// Streams the origin's response to the client and settles the upstream
    /// socket: pooled when the origin agreed to keep-alive and the response
    /// ended at a framing boundary, closed otherwise.
    async fn relay_response(
        &self,
        client: &mut TcpStream,
        mut upstream: TcpStream,
        req: &HttpRequest,
    ) -> Result<(), ForwardError> {
        let outcome = relay_response_inner(client, &mut upstream, req).await;
        match &outcome {
            Ok(summary) if summary.reusable() => {
                debug!("keeping upstream socket for {}", req.authority);
                self.dialer.pool().put(&req.authority, upstream);
            }
            // Dropping `upstream` closes it.
            _ => {}
        }
        outcome.map(|_| ())
    }
}

/// How a response relay ended.
#[derive(Debug, Default)]
struct RelaySummary {
    /// The origin advertised `Connection: keep-alive`.
    keep_alive: bool,
    /// The body ended at a framing boundary (length reached or chunked
    /// terminator), not at EOF or an error.
    complete: bool,
}

impl RelaySummary {
    fn reusable(&self) -> bool {
        self.keep_alive && self.complete
    }
}

/// Body framing advertised by a response header block.
#[derive(Debug, Clone, Copy)]
enum ResponseFraming {
    /// `Content-Length` known.
    Length(u64),
    /// Chunked transfer encoding; ends at the `0\r\n\r\n` terminator.
    Chunked,
    /// No framing information; the body runs until the origin closes.
    Unframed,
}

async fn relay_response_inner(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    req: &HttpRequest,
) -> Result<RelaySummary, ForwardError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut head = BytesMut::new();

    // Header phase: accumulate reads until the blank line, then forward the
    // whole accumulation (header section plus any body bytes that came with
    // it) to the client in a single write.
    let (framing, keep_alive, mut body_received) = loop {
        let n = upstream
            .read(&mut buf)
            .await
            .map_err(ForwardError::io)?;
        if n == 0 {
            return Err(ForwardError::io(anyerr!(
                "origin closed the connection before completing response headers"
            )));
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(header_end) = find_header_end(&head) {
            let header_block = &head[..header_end];
            let keep_alive = header_contains(header_block, b"connection: keep-alive");
            let chunked = header_contains(header_block, b"transfer-encoding: chunked");
            let content_length = response_content_length(header_block);
            let framing = if chunked {
                ResponseFraming::Chunked
            } else if let Some(len) = content_length {
                ResponseFraming::Length(len)
            } else {
                ResponseFraming::Unframed
            };
            let body_received = (head.len() - header_end - 4) as u64;
            client
                .write_all(&head)
                .await
                .map_err(ForwardError::io)?;
            break (framing, keep_alive, body_received);
        }
        if head.len() > RESPONSE_HEAD_MAX_LENGTH {
            return Err(ForwardError::io(anyerr!(
                "response header section exceeds {RESPONSE_HEAD_MAX_LENGTH} bytes"
            )));
        }
    };

    // Body phase: stream reads straight through until the framing says done.
    // The body bytes that arrived with the header block count too, so a
    // response delivered in a single read terminates here immediately.
    let mut scanner = ChunkEndScanner::new();
    let body_start = head.len() - body_received as usize;
    let mut complete = if req.method == Method::HEAD {
        // HEAD responses end at the header section no matter what
        // Content-Length announces.
        true
    } else {
        match framing {
            ResponseFraming::Length(total) => body_received >= total,
            ResponseFraming::Chunked => scanner.feed(&head[body_start..]),
            ResponseFraming::Unframed => false,
        }
    };
    while !complete {
        let n = upstream
            .read(&mut buf)
            .await
            .map_err(ForwardError::io)?;
        if n == 0 {
            if !matches!(framing, ResponseFraming::Unframed) {
                warn!("origin closed the connection before the response body completed");
            }
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(ForwardError::io)?;
        body_received += n as u64;
        complete = match framing {
            ResponseFraming::Length(total) => body_received >= total,
            ResponseFraming::Chunked => scanner.feed(&buf[..n]),
            ResponseFraming::Unframed => false,
        };
    }

    debug!(
        body_bytes = body_received,
        complete,
        keep_alive,
        "finished relaying response for {}",
        req.target
    );
    Ok(RelaySummary {
        keep_alive,
        complete,
    })
}

/// Copies chunked request body bytes from the client until the terminating
/// zero-size chunk has been forwarded.
async fn relay_chunked_remainder(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    mut scanner: ChunkEndScanner,
) -> Result<(), ForwardError> {
    debug!("reading remaining chunked request body from client");
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = client.read(&mut buf).await.map_err(ForwardError::io)?;
        if n == 0 {
            return Err(ForwardError::io(anyerr!(
                "client closed the connection inside a chunked request body"
            )));
        }
        upstream
            .write_all(&buf[..n])
            .await
            .map_err(ForwardError::io)?;
        if scanner.feed(&buf[..n]) {
            return Ok(());
        }
    }
}

/// Copies exactly `remaining` request body bytes from the client upstream.
async fn relay_exact(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    mut remaining: u64,
) -> Result<(), ForwardError> {
    debug!(remaining, "reading remaining request body from client");
    let mut buf = vec![0u8; BUFFER_SIZE];
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = client
            .read(&mut buf[..want])
            .await
            .map_err(ForwardError::io)?;
        if n == 0 {
            return Err(ForwardError::io(anyerr!(
                "client closed the connection inside the request body"
            )));
        }
        upstream
            .write_all(&buf[..n])
            .await
            .map_err(ForwardError::io)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Rebuilds the request head for the origin: the original request line, all
/// headers except hop-by-hop ones, and a single `Connection: keep-alive`.
///
/// The body is not appended here.
pub(crate) fn build_forward_request(req: &HttpRequest) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} {}\r\n", req.method, req.target, version_token(req.version)).as_bytes(),
    );
    for (name, value) in req.headers.iter() {
        if HOP_BY_HOP_HEADERS
            .iter()
            .any(|stripped| name.as_str().eq_ignore_ascii_case(stripped))
        {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    // The proxy always asks the origin for a persistent connection.
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out
}

fn version_token(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Writes a complete HTML error response to the client.
///
/// Best-effort: the client may already be gone, so failures are only logged.
pub(crate) async fn send_error_response(client: &mut TcpStream, status: StatusCode) {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<html><body><h1>{} {reason}</h1></body></html>",
        status.as_u16()
    );
    let response = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: text/html\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        status.as_u16(),
        body.len(),
    );
    if let Err(err) = client.write_all(response.as_bytes()).await {
        debug!("failed to write error response to client: {err:#}");
    }
}

/// Index of the `\r\n\r\n` separator in a response accumulation, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Case-insensitive substring search over a response header block.
fn header_contains(block: &[u8], needle: &[u8]) -> bool {
    block.len() >= needle.len()
        && block
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Extracts a `Content-Length` value from a response header block.
///
/// Unparseable values are treated as absent.
fn response_content_length(block: &[u8]) -> Option<u64> {
    let needle = b"content-length:";
    let pos = block
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))?;
    let rest = &block[pos + needle.len()..];
    let end = rest
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.trim().parse().ok()
}
