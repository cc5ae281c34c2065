use std::time::Duration;

use tokio::{io, net::TcpStream, time};
use tracing::trace;

pub(crate) use self::prebuffered::Prebuffered;

mod prebuffered;

/// Last chunk of a chunked-encoded body.
const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Watches a stream of body bytes for the chunked terminator `0\r\n\r\n`.
///
/// The terminator may straddle read boundaries, so a small tail window is
/// carried from one `feed` to the next.
#[derive(Debug, Default)]
pub(crate) struct ChunkEndScanner {
    window: Vec<u8>,
    found: bool,
}

impl ChunkEndScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds the next run of body bytes; returns true once the terminator has
    /// been seen in the stream so far.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.found {
            return true;
        }
        self.window.extend_from_slice(chunk);
        self.found = contains(&self.window, CHUNK_TERMINATOR);
        let keep = CHUNK_TERMINATOR.len() - 1;
        if !self.found && self.window.len() > keep {
            let excess = self.window.len() - keep;
            self.window.drain(..excess);
        }
        self.found
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Relays bytes both ways between a client and an origin socket.
///
/// Runs until either side reaches EOF, an unrecoverable socket error occurs,
/// or a single write stalls past `write_timeout`. Periods with no traffic for
/// `idle_timeout` leave the tunnel open.
pub(crate) async fn tunnel(
    client: &TcpStream,
    origin: &TcpStream,
    idle_timeout: Duration,
    write_timeout: Duration,
) -> io::Result<()> {
    let mut buf = vec![0u8; crate::BUFFER_SIZE];
    loop {
        tokio::select! {
            ready = client.readable() => {
                ready?;
                if !relay_ready(client, origin, &mut buf, write_timeout).await? {
                    break;
                }
            }
            ready = origin.readable() => {
                ready?;
                if !relay_ready(origin, client, &mut buf, write_timeout).await? {
                    break;
                }
            }
            _ = time::sleep(idle_timeout) => {
                trace!("tunnel idle, keeping it open");
            }
        }
    }
    Ok(())
}

/// Drains readable bytes from `from` into `to`.
///
/// Returns false when `from` reached EOF. Short writes are retried, waiting
/// for writability with a bounded timeout when the peer's buffer is full.
async fn relay_ready(
    from: &TcpStream,
    to: &TcpStream,
    buf: &mut [u8],
    write_timeout: Duration,
) -> io::Result<bool> {
    let read = match from.try_read(buf) {
        Ok(0) => return Ok(false),
        Ok(n) => n,
        // spurious readiness
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
        Err(err) => return Err(err),
    };
    let mut written = 0;
    while written < read {
        match to.try_write(&buf[written..read]) {
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                time::timeout(write_timeout, to.writable())
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "tunnel write stalled")
                    })??;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
