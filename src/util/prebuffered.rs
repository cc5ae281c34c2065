//! A parse buffer in front of a Tokio `AsyncRead`.
//!
//! The request parser needs to look at bytes before deciding who consumes
//! them: header bytes are parsed and discarded, body bytes are taken out as
//! owned chunks, and anything left over stays buffered for the next request
//! on the same connection.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub(crate) struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Reads once from the inner stream, appending to the buffer.
    ///
    /// Returns the number of bytes added, 0 at EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.inner.read_buf(&mut self.buf).await
    }

    /// Discards up to `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Takes up to `n` bytes from the front of the buffer.
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Takes all buffered bytes.
    pub(crate) fn take_all(&mut self) -> Bytes {
        let len = self.buf.len();
        self.take(len)
    }

    /// The underlying stream.
    ///
    /// Callers that read from it directly bypass the buffer, so they must
    /// only do so once the buffer holds nothing they care about.
    pub(crate) fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}
