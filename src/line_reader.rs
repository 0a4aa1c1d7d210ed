use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::future;
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest command line accepted, CRLF included. Fits every supported command
/// with a maximum-length tube name.
pub const MAX_LINE_LEN: usize = 224;

/// How much [`LineReader::wait_closed`] buffers before it stops reading and
/// leaves the rest to the socket.
pub const MAX_READ_AHEAD: usize = 64 * 1024;

/// A job body read by [`LineReader::read_blob`].
#[derive(Debug, Eq, PartialEq)]
pub enum Blob {
    /// The body bytes, without the trailing CRLF.
    Body(Bytes),
    /// The expected number of bytes arrived but weren't followed by a CRLF.
    /// The bytes have still been consumed.
    MissingCrlf,
}

/// Provides a facility to read CRLF-terminated lines, and the fixed-length
/// blobs that follow some of them, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    ///
    /// Once [`MAX_LINE_LEN`] bytes have arrived without a CRLF, fails with
    /// [`io::ErrorKind::InvalidData`]. The stream can't be resynchronised after
    /// that.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // We slice and dice buf here to avoid re-reading all but the last
            // byte of the part of the command we've already seen, keeping
            // O(bytes_read) behaviour.
            // Note also we need to scan from one position earlier than the
            // start of the newest bytes in case we received a \r then \n on the
            // next read.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();

                // Drop trailing b"\r\n".
                let line = line.slice(0..line.len() - 2);

                self.maybe_crlf_from = 0;

                return Ok(Some(line));
            }

            if self.buf.len() >= MAX_LINE_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "command line too long",
                ));
            }

            let n_bytes_read = match self.fill().await {
                Ok(n) => n,
                Err(e) => {
                    self.pending_error = Some(e);
                    0
                },
            };

            // Rescan from the byte before the first byte returned by this
            // read (and from 0 if buf is empty).
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);

            // If we didn't read any bytes this time around, assume we've
            // reached an end-of-stream condition. Return any pending error:
            // we wouldn't be able to parse out another line, given we just
            // read 0 bytes.
            if n_bytes_read == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads exactly `n_bytes` of data followed by a CRLF. Returns None if the
    /// stream ends first.
    ///
    /// Cancel-safe in the same way as `read_line`: partial data stays in the
    /// internal buffer.
    pub async fn read_blob(&mut self, n_bytes: usize) -> io::Result<Option<Blob>> {
        let want = n_bytes + 2;

        if let Some(missing) = want.checked_sub(self.buf.len()) {
            self.buf.reserve(missing);
        }

        while self.buf.len() < want {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }

        let blob = self.buf.split_to(want).freeze();
        self.maybe_crlf_from = 0;

        if &blob[n_bytes..] != b"\r\n" {
            return Ok(Some(Blob::MissingCrlf));
        }

        Ok(Some(Blob::Body(blob.slice(0..n_bytes))))
    }

    /// Consumes and drops exactly `n_bytes` without holding more than one
    /// read's worth in memory. Returns false if the stream ends first.
    pub async fn discard(&mut self, mut n_bytes: usize) -> io::Result<bool> {
        loop {
            let take = n_bytes.min(self.buf.len());
            self.buf.advance(take);
            n_bytes -= take;

            if n_bytes == 0 {
                break;
            }

            if self.fill().await? == 0 {
                return Ok(false);
            }
        }

        self.maybe_crlf_from = 0;

        Ok(true)
    }

    /// Reads ahead into the internal buffer until the peer closes the stream.
    /// Anything read is kept for later `read_line` calls.
    ///
    /// Intended to race against a long-running command, so that a client
    /// hanging up is noticed while its command is still pending. Cancel-safe.
    ///
    /// Stops reading once [`MAX_READ_AHEAD`] bytes are buffered and never
    /// resolves after that: a hang-up then goes unnoticed until the pending
    /// command finishes.
    pub async fn wait_closed(&mut self) -> io::Result<()> {
        while self.buf.len() < MAX_READ_AHEAD {
            if self.fill().await? == 0 {
                return Ok(());
            }
        }

        future::pending().await
    }

    /// Appends whatever the reader has available to the buffer.
    async fn fill(&mut self) -> io::Result<usize> {
        self.reader.read_buf(&mut self.buf).await
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    /// Writes each chunk separately so the reader sees fragmented reads.
    fn feed(tests: &'static [&'static [u8]]) -> LineReader<io::DuplexStream> {
        // Set the buffer large enough that our tests will never overflow it.
        // We can ensure correct fragmentation of reads by explicitly yielding
        // between each.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        server.into()
    }

    #[tokio::test]
    async fn test_read_line() {
        // When properly read, each nth line should read b"test:{n}".
        let mut lr = feed(&[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined commands
            // Simple
            b"test:4\r\ntest:5\r\n",
            // Split LF
            b"test:6\r",
            b"\ntest:7\r\n",
            // Split CRLF
            b"test:8",
            b"\r\ntest:9\r\n",
        ]);

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_blob() {
        let mut lr = feed(&[
            b"put 1 0 1 5\r\nhel",
            b"lo\r",
            b"\nput 1 0 1 4\r\na\r\nb\r\n",
            b"put 1 0 1 2\r\nabXX",
            b"reserve\r\n",
            b"put 1 0 1 9\r\nshort",
        ]);

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 1 0 1 5");
        assert_eq!(
            lr.read_blob(5).await.unwrap(),
            Some(Blob::Body(Bytes::from_static(b"hello")))
        );

        // Bodies may contain CRLF: only the length counts.
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 1 0 1 4");
        assert_eq!(
            lr.read_blob(4).await.unwrap(),
            Some(Blob::Body(Bytes::from_static(b"a\r\nb")))
        );

        // A bad terminator still consumes the body, leaving the stream in
        // sync for the next command.
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 1 0 1 2");
        assert_eq!(lr.read_blob(2).await.unwrap(), Some(Blob::MissingCrlf));
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "reserve");

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 1 0 1 9");
        assert_eq!(lr.read_blob(9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_discard() {
        let mut lr = feed(&[b"0123", b"456789\r\n", b"quit\r\n"]);

        assert!(lr.discard(12).await.unwrap());
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "quit");
        assert!(!lr.discard(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let (mut client, server) = io::duplex(4096);
        let mut lr = LineReader::from(server);

        let writer = tokio::spawn(async move {
            // Stops once the reader gives up and drops its end.
            let chunk = [b'a'; 512];
            while client.write_all(&chunk).await.is_ok() {}
        });

        let error = lr.read_line().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert!(lr.buf.len() < MAX_LINE_LEN + 4096);

        drop(lr);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_longest_line_fits() {
        let (mut client, server) = io::duplex(4096);
        let mut lr = LineReader::from(server);

        let line = "x".repeat(MAX_LINE_LEN - 2);
        client.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), line.as_str());
    }

    #[tokio::test]
    async fn test_wait_closed_stops_reading_at_limit() {
        let (mut client, server) = io::duplex(4096);
        let mut lr = LineReader::from(server);

        let writer = tokio::spawn(async move {
            let chunk = [b'a'; 1024];
            while client.write_all(&chunk).await.is_ok() {}
        });

        let waited =
            tokio::time::timeout(Duration::from_millis(200), lr.wait_closed())
                .await;
        assert!(waited.is_err(), "wait_closed resolved: {waited:?}");
        assert!(lr.buf.len() >= MAX_READ_AHEAD);
        assert!(lr.buf.len() < MAX_READ_AHEAD + 4096);
        assert!(!writer.is_finished());

        drop(lr);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_closed_keeps_pipelined_lines() {
        let mut lr = feed(&[b"delete 1\r\n", b"delete 2\r\n"]);

        lr.wait_closed().await.unwrap();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "delete 1");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "delete 2");
        assert!(lr.read_line().await.unwrap().is_none());
    }
}
