use std::{io, net::SocketAddr, sync::Arc};

use http::{Method, StatusCode};
use n0_error::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, error_span, warn};

use crate::{
    forward::{ForwardOpts, Forwarder, send_error_response},
    parse::HttpRequest,
    pool::ConnectionPool,
    upstream::{DialOpts, Dialer},
    util::Prebuffered,
};

/// Options for a proxy server.
#[derive(Debug, Clone, Default)]
pub struct ProxyOpts {
    pub dial: DialOpts,
    pub forward: ForwardOpts,
}

/// Accepting end of the proxy.
///
/// Owns the listener, the process-wide pool of idle upstream sockets, and the
/// forwarding engine shared by all client workers. Dropping the server closes
/// every idle socket.
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    pool: Arc<ConnectionPool>,
    forwarder: Forwarder,
}

impl ProxyServer {
    /// Binds a proxy server to `addr`.
    pub async fn bind(addr: &str, opts: ProxyOpts) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, opts))
    }

    /// Wraps an already bound listener.
    pub fn new(listener: TcpListener, opts: ProxyOpts) -> Self {
        let pool = Arc::new(ConnectionPool::new());
        let forwarder = Forwarder::new(Dialer::new(pool.clone(), opts.dial), opts.forward);
        Self {
            listener,
            pool,
            forwarder,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The pool of idle upstream sockets shared by all client workers.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Accepts client connections until the listener fails or the task is
    /// dropped.
    ///
    /// Each client gets a monotonically increasing id and its own task;
    /// in-flight clients are cancelled when `run` winds down.
    pub async fn run(&self) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut client_id: u64 = 0;
        loop {
            let (stream, client_addr) = self.listener.accept().await?;
            debug!(%client_addr, client_id, "accepted client connection");
            let forwarder = self.forwarder.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(serve_client(forwarder, stream))
                    .instrument(error_span!("client", id = client_id)),
            );
            client_id += 1;
        }
    }
}

/// Serves successive requests on one client connection.
///
/// Loops while the client keeps its connection alive; CONNECT always ends the
/// loop because the stream was handed to the tunnel.
async fn serve_client(forwarder: Forwarder, stream: TcpStream) {
    let mut client = Prebuffered::new(stream);
    loop {
        let req = match HttpRequest::read(&mut client).await {
            Ok(Some(req)) => req,
            // client closed between requests
            Ok(None) => break,
            Err(err) => {
                debug!("failed to parse client request: {err:#}");
                send_error_response(client.get_mut(), StatusCode::BAD_REQUEST).await;
                break;
            }
        };
        debug!(method = %req.method, target = %req.target, "parsed request");
        let keep_alive = req.method != Method::CONNECT && req.wants_keep_alive();
        match forwarder.forward(client.get_mut(), &req).await {
            Ok(()) => {
                if !keep_alive {
                    break;
                }
            }
            Err(err) => {
                match err.response_status() {
                    Some(status) => {
                        warn!("request failed: {err:#}");
                        send_error_response(client.get_mut(), status).await;
                    }
                    // The response line is already committed (or the client
                    // is gone); nothing can be written anymore.
                    None => error!("relay failed: {err:#}"),
                }
                break;
            }
        }
    }
    debug!("client connection finished");
}
