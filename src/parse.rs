use std::str::FromStr;

use bytes::Bytes;
use http::{
    HeaderValue, Method, StatusCode, Version,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::AsyncRead;

use crate::{BODY_BUFFER_MAX_LENGTH, HEADER_SECTION_MAX_LENGTH, util::Prebuffered};

/// Host and port of an origin server.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }
}

impl Authority {
    /// Parses an authority-form request target (`host:port`), as used by CONNECT.
    ///
    /// Note: the target must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Parses an absolute-form request target, defaulting the port from the scheme.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => 80,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }
}

/// A client request as handed to the forwarding engine.
#[derive(derive_more::Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target exactly as received (absolute-form, or authority-form
    /// for CONNECT).
    pub target: String,
    /// HTTP version from the request line.
    pub version: Version,
    /// Origin authority resolved from the request target.
    pub authority: Authority,
    /// Raw header map as received.
    pub headers: http::HeaderMap<HeaderValue>,
    /// Request body bytes already consumed from the client stream.
    ///
    /// May be a prefix of the full body: chunked bodies keep only what
    /// arrived with the header section, and length-delimited bodies are
    /// buffered up to a cap. For CONNECT this holds any bytes that followed
    /// the header section; they belong to the tunnel.
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
}

impl HttpRequest {
    /// Reads and parses the next request on `reader`.
    ///
    /// Returns `None` when the stream ends cleanly before any request bytes.
    /// Returns an error for malformed requests, origin-form targets, and
    /// header sections exceeding the size limit.
    pub(crate) async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Option<Self>> {
        let (header_len, mut request) = loop {
            if let Some(parsed) = Self::parse_head(reader.buffered())? {
                break parsed;
            }
            ensure_any!(
                reader.buffered().len() < HEADER_SECTION_MAX_LENGTH,
                "Request header section exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
            );
            if reader.fill().await? == 0 {
                if reader.buffered().is_empty() {
                    return Ok(None);
                }
                return Err(anyerr!("Connection closed inside request header section"));
            }
        };
        reader.discard(header_len);
        request.body = request.buffer_body(reader).await?;
        Ok(Some(request))
    }

    /// Parses a request head from a buffer; `None` when more data is needed.
    ///
    /// Returns the length of the header section and the request.
    pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                Self::from_parsed(parsed).map(|request| Some((header_len, request)))
            }
        }
    }

    fn from_parsed(parsed: httparse::Request<'_, '_>) -> Result<Self> {
        let method: Method = parsed
            .method
            .context("Missing HTTP method")?
            .parse()
            .std_context("Invalid HTTP method")?;
        let target = parsed.path.context("Missing request target")?.to_string();
        let version = match parsed.version.context("Missing HTTP version")? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = http::HeaderMap::from_iter(parsed.headers.iter().flat_map(|h| {
            let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            Some((name, value))
        }));
        let uri = Uri::from_str(&target).std_context("Invalid request target")?;
        let authority = if method == Method::CONNECT {
            Authority::from_authority_uri(&uri)?
        } else {
            // Origin-form targets have no authority and are rejected here:
            // this proxy only serves forward requests.
            Authority::from_absolute_uri(&uri)?
        };
        Ok(Self {
            method,
            target,
            version,
            authority,
            headers,
            body: Bytes::new(),
        })
    }

    /// Buffers the request body bytes the parser is responsible for.
    ///
    /// Length-delimited bodies are buffered up to a cap; the engine streams
    /// the remainder. Chunked and unframed bodies keep exactly the bytes
    /// that arrived with the header section.
    async fn buffer_body(
        &self,
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Bytes> {
        if self.method == Method::CONNECT {
            return Ok(reader.take_all());
        }
        if !self.carries_body() {
            return Ok(Bytes::new());
        }
        match self.content_length().ok().flatten() {
            Some(len) => {
                let want = len.min(BODY_BUFFER_MAX_LENGTH as u64) as usize;
                while reader.buffered().len() < want {
                    if reader.fill().await? == 0 {
                        break;
                    }
                }
                Ok(reader.take(usize::try_from(len).unwrap_or(usize::MAX)))
            }
            None => Ok(reader.take_all()),
        }
    }

    /// Parses the `Content-Length` request header if present.
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.headers.get(http::header::CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => {
                let value = value.to_str().std_context("Invalid Content-Length value")?;
                let len = value
                    .trim()
                    .parse::<u64>()
                    .std_context("Invalid Content-Length value")?;
                Ok(Some(len))
            }
        }
    }

    /// Whether the request body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether the client asked to keep its connection open after this request.
    pub(crate) fn wants_keep_alive(&self) -> bool {
        self.headers
            .get(http::header::CONNECTION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("keep-alive"))
    }

    /// Whether this request may carry a body the proxy has to relay.
    pub(crate) fn carries_body(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
            || self.headers.contains_key(http::header::CONTENT_LENGTH)
            || self.headers.contains_key(http::header::TRANSFER_ENCODING)
    }
}

/// Parsed HTTP response head.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: http::HeaderMap<HeaderValue>,
}

impl HttpResponse {
    /// Parses a response head from a buffer; `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, response)| response))
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(buf).std_context("Invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = parsed.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = parsed.reason.map(ToOwned::to_owned);
                let headers = http::HeaderMap::from_iter(parsed.headers.iter().flat_map(|h| {
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }
}
