use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::net::TcpStream;
use tracing::debug;

use crate::parse::Authority;

/// Process-wide storage for idle keep-alive sockets to origin servers.
///
/// Keyed by `host:port`, one socket per key: inserting for an occupied key
/// closes the displaced socket. [`get`](Self::get) hands ownership out, so no
/// two workers can ever reuse the same socket. The pool never fails and never
/// probes liveness; a socket whose peer silently closed is still handed out
/// and it is the dialer's job to reject it.
///
/// All operations take the mutex for a single map operation plus at most one
/// socket close; nothing blocks on I/O under the lock. Dropping the pool
/// closes every idle socket.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, TcpStream>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the idle socket for `authority` out of the pool, if any.
    ///
    /// The caller owns the socket afterwards; a repeated `get` for the same
    /// authority returns `None` until a fresh [`put`](Self::put).
    pub fn get(&self, authority: &Authority) -> Option<TcpStream> {
        self.idle().remove(&authority.to_string())
    }

    /// Stores an idle socket for later reuse.
    ///
    /// A previously stored socket for the same authority is closed.
    pub fn put(&self, authority: &Authority, socket: TcpStream) {
        let displaced = self.idle().insert(authority.to_string(), socket);
        if displaced.is_some() {
            // dropping `displaced` closes it
            debug!(%authority, "displaced idle upstream socket");
        }
    }

    /// Discards the entry for `authority`, closing the socket if one was stored.
    pub fn remove(&self, authority: &Authority) {
        self.idle().remove(&authority.to_string());
    }

    /// Closes every idle socket.
    pub fn clear(&self) {
        self.idle().clear();
    }

    /// Whether an idle socket is currently stored for `authority`.
    pub fn contains(&self, authority: &Authority) -> bool {
        self.idle().contains_key(&authority.to_string())
    }

    /// Number of idle sockets currently stored.
    pub fn len(&self) -> usize {
        self.idle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<String, TcpStream>> {
        // A panic while holding the lock leaves the map intact, so the
        // poisoned state carries no meaning here.
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
