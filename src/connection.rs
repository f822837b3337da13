//! Frame-level read/write over a byte stream, with partial-frame buffering.

use crate::wire::{self, Request, Response};
use crate::Result;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

/// Reads request frames from, and writes bare response tokens to, a single
/// client connection.
///
/// Reassembly of a frame split across multiple reads is handled internally:
/// bytes read but not yet forming a complete frame stay in `buffer` until
/// the next call to [`Connection::read_frames`].
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
}

impl<S: ConnectionStream> Connection<S> {
    pub fn new(socket: S) -> Self {
        Self {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Reads from the socket until at least one full request frame is
    /// available, then returns every complete frame currently buffered (in
    /// wire order — this is what lets the caller apply its DONE-first
    /// reordering across a whole batch).
    ///
    /// Returns `Ok(None)` on a clean end-of-stream (no partial frame left
    /// behind). A partial frame left dangling at EOF, or a malformed frame,
    /// is an error; the caller is expected to close the connection.
    #[tracing::instrument(skip_all)]
    pub async fn read_frames(&mut self) -> Result<Option<Vec<Request>>> {
        loop {
            let (requests, consumed) = wire::parse_requests(&self.buffer)?;
            if !requests.is_empty() {
                self.buffer.advance(consumed);
                debug!(count = requests.len(), "parsed request batch");
                return Ok(Some(requests));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection was closed mid frame",
                )));
            }
        }
    }

    /// Writes a single bare response token, tolerating partial writes.
    pub async fn write_response(&mut self, response: Response) -> Result<()> {
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Op;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn reads_a_batched_segment_as_one_call() {
        let stream = tokio_test::io::Builder::new()
            .read(b"9#1#WRIT#e9#1#DONE#e9#2#READ#e")
            .build();
        let mut conn = Connection::new(stream);

        let reqs = conn.read_frames().await.unwrap().unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].op, Op::Writ);
        assert_eq!(reqs[1].op, Op::Done);
        assert_eq!(reqs[2].op, Op::Read);
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"9#7#WR")
            .read(b"IT#a")
            .build();
        let mut conn = Connection::new(stream);

        let reqs = conn.read_frames().await.unwrap().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].target, "a");
    }

    #[tokio::test]
    async fn clean_eof_with_no_partial_frame_is_none() {
        let stream = tokio_test::io::Builder::new().build();
        let mut conn = Connection::new(stream);
        assert!(conn.read_frames().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let stream = tokio_test::io::Builder::new().read(b"9#7#WR").build();
        let mut conn = Connection::new(stream);
        assert!(conn.read_frames().await.is_err());
    }

    #[tokio::test]
    async fn writes_response_tokens() {
        let stream = tokio_test::io::Builder::new().write(b"WAIT").build();
        let mut conn = Connection::new(stream);
        conn.write_response(Response::Wait).await.unwrap();
    }
}
