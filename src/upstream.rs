use std::{
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use n0_error::e;
use tokio::{
    io::ReadBuf,
    net::{TcpStream, lookup_host},
    time,
};
use tracing::{debug, trace};

use crate::{error::DialError, parse::Authority, pool::ConnectionPool};

/// Options for upstream dialing.
#[derive(Debug, Clone)]
pub struct DialOpts {
    /// Bound on establishing a fresh TCP connection.
    pub connect_timeout: Duration,
}

impl Default for DialOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Establishes sockets to origin servers, consulting the idle pool first.
#[derive(Debug, Clone)]
pub struct Dialer {
    pool: Arc<ConnectionPool>,
    opts: DialOpts,
}

impl Dialer {
    pub fn new(pool: Arc<ConnectionPool>, opts: DialOpts) -> Self {
        Self { pool, opts }
    }

    /// The pool this dialer takes idle sockets from.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns a connected socket for `authority`.
    ///
    /// An idle pooled socket is reused when its liveness probe passes;
    /// otherwise a fresh connection is established with a bounded connect
    /// timeout. Resolution prefers IPv4 addresses.
    pub async fn dial(&self, authority: &Authority) -> Result<TcpStream, DialError> {
        if let Some(socket) = self.pool.get(authority) {
            if probe_idle_socket(&socket) {
                debug!(%authority, "reusing idle upstream socket");
                return Ok(socket);
            }
            // The peer is gone; dropping the socket closes it and we dial fresh.
            trace!(%authority, "idle upstream socket failed liveness probe");
        }

        let addrs: Vec<_> = lookup_host((authority.host.as_str(), authority.port))
            .await
            .map_err(|source| {
                e!(DialError::Resolve {
                    authority: authority.to_string(),
                    source
                })
            })?
            .collect();
        let addr = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or(addrs.first())
            .copied()
            .ok_or_else(|| {
                e!(DialError::NoAddress {
                    authority: authority.to_string()
                })
            })?;

        let socket = time::timeout(self.opts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                e!(DialError::Timeout {
                    authority: authority.to_string()
                })
            })?
            .map_err(|source| {
                e!(DialError::Connect {
                    authority: authority.to_string(),
                    source
                })
            })?;
        debug!(%authority, %addr, "connected to origin");
        Ok(socket)
    }
}

/// Checks whether an idle socket's peer is still there.
///
/// A one-byte non-blocking peek distinguishes the cases: would-block means
/// the connection is quietly alive, pending data means it is readable and
/// usable, and EOF or an error means the peer is gone.
fn probe_idle_socket(socket: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    let mut buf = ReadBuf::new(&mut probe);
    let mut cx = Context::from_waker(Waker::noop());
    match socket.poll_peek(&mut cx, &mut buf) {
        Poll::Pending => true,
        Poll::Ready(Ok(0)) => false,
        Poll::Ready(Ok(_)) => true,
        Poll::Ready(Err(_)) => false,
    }
}
