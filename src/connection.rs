//! Drives one client connection: reads commands, dispatches them to the
//! session, and writes back responses.
use anyhow::{Context, Result};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::backend::{Backend, PutOutcome};
use crate::error::{self, Error};
use crate::line_reader::{Blob, LineReader};
use crate::parser::ParsingError;
use crate::session::Session;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// What the connection loop does after a command has been handled.
#[derive(Debug, Eq, PartialEq)]
enum Outcome {
    Respond(BeanstalkResponse),
    /// Send the response, then hang up.
    RespondAndClose(BeanstalkResponse),
    /// Hang up without a response.
    Close,
}

pub struct Connection<B: Backend> {
    session: Session<B>,
    max_job_size: u32,
    cancel: CancellationToken,
}

impl<B: Backend> Connection<B> {
    pub fn new(
        session: Session<B>,
        max_job_size: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            max_job_size,
            cancel,
        }
    }

    /// Keeps taking commands and answering them until the peer hangs up,
    /// sends `quit`, a fatal error occurs, or the server shuts down.
    pub async fn run<R, W>(mut self, mut r: LineReader<R>, mut w: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = select!(
               x = r.read_line() => x,
               _ = self.cancel.cancelled() => return Ok(()),
            );
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                    debug!(%error, "rejected command, closing connection");
                    let resp = BeanstalkResponse::BadFormat;
                    return self.send(&mut w, &resp.serialise_beanstalk()).await;
                },
                Err(error) => return Err(error).context("reading command"),
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            trace!(line = bytes_to_human_str(&line), "processing command");

            let cmd: Result<BeanstalkCommand, ParsingError> =
                (&line as &[u8]).try_into();

            let (resp, close) = match cmd {
                Ok(cmd) => match self.dispatch(cmd, &mut r).await? {
                    Outcome::Respond(resp) => {
                        (resp.serialise_beanstalk(), false)
                    },
                    Outcome::RespondAndClose(resp) => {
                        (resp.serialise_beanstalk(), true)
                    },
                    Outcome::Close => return Ok(()),
                },
                Err(error) => {
                    debug!(%error, line = bytes_to_human_str(&line), "rejected command");
                    (error.serialise_beanstalk(), false)
                },
            };

            self.send(&mut w, &resp).await?;

            if close {
                return Ok(());
            }
        }
    }

    /// Writes and flushes one response, giving up quietly on shutdown.
    async fn send<W>(&self, w: &mut W, resp: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        select! {
            x = w.write_all(resp) => x.context("writing response")?,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        // Flushed per response, so pipelined requests get pipelined replies.
        select! {
            x = w.flush() => x.context("flushing response")?,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        Ok(())
    }

    async fn dispatch<R>(
        &mut self,
        cmd: BeanstalkCommand,
        r: &mut LineReader<R>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Unpin,
    {
        use BeanstalkCommand::*;
        use BeanstalkResponse as Resp;

        Ok(match cmd {
            Put {
                pri,
                delay,
                ttr,
                n_bytes,
            } => {
                if n_bytes > self.max_job_size {
                    // Skip the body and its CRLF so the next command lines up.
                    let skipped = r
                        .discard(n_bytes as usize + 2)
                        .await
                        .context("skipping oversized job")?;
                    return Ok(match skipped {
                        true => Outcome::Respond(Resp::JobTooBig),
                        false => Outcome::Close,
                    });
                }

                let data = match r
                    .read_blob(n_bytes as usize)
                    .await
                    .context("reading job body")?
                {
                    Some(Blob::Body(data)) => data,
                    Some(Blob::MissingCrlf) => {
                        debug!("job body not terminated by CRLF");
                        return Ok(Outcome::Respond(Resp::BadFormat));
                    },
                    None => return Ok(Outcome::Close),
                };

                respond(
                    self.session.put(pri, delay, ttr, data).await,
                    |outcome| match outcome {
                        PutOutcome::Inserted(id) => Resp::Inserted { id },
                        PutOutcome::Buried(id) => Resp::BuriedID { id },
                    },
                )
            },
            Use { tube } => {
                respond(self.session.use_tube(&tube), |tube| Resp::Using { tube })
            },
            Reserve => self.reserve(-1, r).await?,
            ReserveWithTimeout { timeout } => self.reserve(timeout, r).await?,
            ReserveJob { id } => respond(
                self.session.reserve_by_id(id).await,
                |job| Resp::Reserved {
                    id: job.id,
                    data: job.data,
                },
            ),
            Delete { id } => {
                respond(self.session.delete(id).await, |()| Resp::Deleted)
            },
            Release { id, pri, delay } => respond(
                self.session.release(id, pri, delay).await,
                |()| Resp::Released,
            ),
            Bury { id, pri } => {
                respond(self.session.bury(id, pri).await, |()| Resp::Buried)
            },
            Touch { id } => {
                respond(self.session.touch(id).await, |()| Resp::Touched)
            },
            Watch { tube } => respond(self.session.watch(&tube), |count| {
                Resp::Watching { count }
            }),
            Ignore { tube } => respond(self.session.ignore(&tube), |count| {
                Resp::Watching { count }
            }),
            Quit => Outcome::Close,
        })
    }

    /// Waits for a job while watching the socket, so a client hanging up
    /// abandons its reservation attempt instead of taking a job nobody will
    /// receive.
    async fn reserve<R>(
        &self,
        timeout: i64,
        r: &mut LineReader<R>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Unpin,
    {
        // A job that is already waiting beats a hang-up seen in the same poll.
        let res = select! {
            biased;
            res = self.session.reserve(timeout) => res,
            closed = r.wait_closed() => {
                closed.context("waiting for job")?;
                debug!("peer closed connection while reserving");
                return Ok(Outcome::Close);
            },
            _ = self.cancel.cancelled() => return Ok(Outcome::Close),
        };

        Ok(respond(res, |job| BeanstalkResponse::Reserved {
            id: job.id,
            data: job.data,
        }))
    }
}

/// Maps a session result onto the response for the client. Only internal
/// failures end the connection.
fn respond<T>(
    res: error::Result<T>,
    ok: impl FnOnce(T) -> BeanstalkResponse,
) -> Outcome {
    use BeanstalkResponse as Resp;

    match res {
        Ok(v) => Outcome::Respond(ok(v)),
        Err(Error::NotFound) => Outcome::Respond(Resp::NotFound),
        Err(Error::NotIgnored) => Outcome::Respond(Resp::NotIgnored),
        Err(Error::ReserveTimeout) => Outcome::Respond(Resp::TimedOut),
        Err(Error::DeadlineSoon) => Outcome::Respond(Resp::DeadlineSoon),
        Err(error @ Error::Internal(_)) => {
            error!(%error, "backend failure, closing connection");
            Outcome::RespondAndClose(Resp::InternalError)
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{self, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::line_reader::MAX_LINE_LEN;

    const MAX_JOB_SIZE: u32 = 16;

    fn start() -> (DuplexStream, JoinHandle<Result<()>>) {
        let backend = Arc::new(MemoryBackend::new());
        let (client, server) = io::duplex(64 * 1024);

        let handle = tokio::spawn(async move {
            let (r, w) = io::split(server);
            let session = Session::new(backend)?;
            Connection::new(session, MAX_JOB_SIZE, CancellationToken::new())
                .run(LineReader::from(r), w)
                .await
        });

        (client, handle)
    }

    /// Sends `req` and asserts the next bytes from the server are `expect`.
    async fn exchange(client: &mut DuplexStream, req: &[u8], expect: &[u8]) {
        client.write_all(req).await.unwrap();

        let mut got = vec![0u8; expect.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut got))
            .await
            .expect("response within 5s")
            .unwrap();

        assert_eq!(
            bytes_to_human_str(&got),
            bytes_to_human_str(expect),
            "in reply to {}",
            bytes_to_human_str(req)
        );
    }

    /// Asserts the server hangs up.
    async fn expect_closed(
        mut client: DuplexStream,
        handle: JoinHandle<Result<()>>,
    ) {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("close within 5s")
            .unwrap();
        assert!(rest.is_empty(), "unexpected trailing bytes {rest:?}");

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_put_and_reserve() {
        let (mut c, _handle) = start();

        exchange(&mut c, b"put 1 0 120 5\r\nhello\r\n", b"INSERTED 1\r\n").await;
        exchange(&mut c, b"reserve\r\n", b"RESERVED 1 5\r\nhello\r\n").await;
        exchange(&mut c, b"touch 1\r\n", b"TOUCHED\r\n").await;
        exchange(&mut c, b"release 1 3 0\r\n", b"RELEASED\r\n").await;
        exchange(&mut c, b"reserve-job 1\r\n", b"RESERVED 1 5\r\nhello\r\n")
            .await;
        exchange(&mut c, b"bury 1 0\r\n", b"BURIED\r\n").await;
        exchange(&mut c, b"reserve-job 1\r\n", b"NOT_FOUND\r\n").await;
        exchange(&mut c, b"delete 1\r\n", b"DELETED\r\n").await;
        exchange(&mut c, b"delete 1\r\n", b"NOT_FOUND\r\n").await;
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let (mut c, _handle) = start();

        exchange(
            &mut c,
            b"use jobs\r\nput 0 0 10 2\r\nhi\r\nwatch jobs\r\nignore default\r\nreserve-with-timeout 0\r\n",
            b"USING jobs\r\nINSERTED 1\r\nWATCHING 2\r\nWATCHING 1\r\nRESERVED 1 2\r\nhi\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_watch_and_ignore() {
        let (mut c, _handle) = start();

        exchange(&mut c, b"ignore default\r\n", b"NOT_IGNORED\r\n").await;
        exchange(&mut c, b"ignore foo\r\n", b"NOT_IGNORED\r\n").await;
        exchange(&mut c, b"watch foo\r\n", b"WATCHING 2\r\n").await;
        exchange(&mut c, b"ignore default\r\n", b"WATCHING 1\r\n").await;
        exchange(&mut c, b"ignore foo\r\n", b"NOT_IGNORED\r\n").await;
    }

    #[tokio::test]
    async fn test_malformed_commands_keep_connection_open() {
        let (mut c, _handle) = start();

        exchange(&mut c, b"frobnicate\r\n", b"UNKNOWN_COMMAND\r\n").await;
        exchange(&mut c, b"put 1 0\r\n", b"BAD_FORMAT\r\n").await;
        exchange(&mut c, b"delete abc\r\n", b"BAD_FORMAT\r\n").await;
        exchange(&mut c, b"release 1 2\r\n", b"BAD_FORMAT\r\n").await;

        // Blank lines are skipped without a reply.
        exchange(&mut c, b"\r\n  \r\ndelete 9\r\n", b"NOT_FOUND\r\n").await;

        // A body with the wrong terminator is rejected, and nothing is stored.
        exchange(&mut c, b"put 1 0 10 2\r\nabcd\r\n", b"BAD_FORMAT\r\n").await;
        exchange(&mut c, b"reserve-with-timeout 0\r\n", b"TIMED_OUT\r\n").await;

        exchange(&mut c, b"PUT 1 0 10 2\r\nok\r\n", b"INSERTED 1\r\n").await;
    }

    #[tokio::test]
    async fn test_job_too_big() {
        let (mut c, _handle) = start();

        let body = "x".repeat(MAX_JOB_SIZE as usize + 1);
        exchange(
            &mut c,
            format!("put 1 0 10 {}\r\n{body}\r\n", body.len()).as_bytes(),
            b"JOB_TOO_BIG\r\n",
        )
        .await;

        let body = "x".repeat(MAX_JOB_SIZE as usize);
        exchange(
            &mut c,
            format!("put 1 0 10 {}\r\n{body}\r\n", body.len()).as_bytes(),
            b"INSERTED 1\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_reserve_with_largest_timeout() {
        let (mut c, _handle) = start();

        exchange(&mut c, b"put 1 0 60 2\r\nhi\r\n", b"INSERTED 1\r\n").await;
        exchange(
            &mut c,
            b"reserve-with-timeout 9223372036854775807\r\n",
            b"RESERVED 1 2\r\nhi\r\n",
        )
        .await;
        exchange(&mut c, b"delete 1\r\n", b"DELETED\r\n").await;
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let (mut c, handle) = start();

        let line = "w".repeat(MAX_LINE_LEN);
        c.write_all(line.as_bytes()).await.unwrap();

        let mut got = vec![0u8; b"BAD_FORMAT\r\n".len()];
        timeout(Duration::from_secs(5), c.read_exact(&mut got))
            .await
            .expect("response within 5s")
            .unwrap();
        assert_eq!(got, b"BAD_FORMAT\r\n");

        expect_closed(c, handle).await;
    }

    #[tokio::test]
    async fn test_reserve_answered_before_half_close() {
        let (mut c, _handle) = start();

        c.write_all(b"put 0 0 60 1\r\nx\r\nreserve\r\n").await.unwrap();
        c.shutdown().await.unwrap();

        let mut got = Vec::new();
        timeout(Duration::from_secs(5), c.read_to_end(&mut got))
            .await
            .expect("close within 5s")
            .unwrap();
        assert_eq!(
            bytes_to_human_str(&got),
            bytes_to_human_str(b"INSERTED 1\r\nRESERVED 1 1\r\nx\r\n")
        );
    }

    #[tokio::test]
    async fn test_quit() {
        let (mut c, handle) = start();

        exchange(&mut c, b"watch foo\r\n", b"WATCHING 2\r\n").await;
        c.write_all(b"quit\r\n").await.unwrap();

        expect_closed(c, handle).await;
    }

    #[tokio::test]
    async fn test_hang_up_during_reserve() {
        let (mut c, handle) = start();

        c.write_all(b"reserve\r\n").await.unwrap();
        tokio::task::yield_now().await;
        drop(c);

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("connection task ends within 5s")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_hang_up_mid_body() {
        let (mut c, handle) = start();

        c.write_all(b"put 1 0 10 10\r\nabc").await.unwrap();
        drop(c);

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("connection task ends within 5s")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_internal_error_closes_connection() {
        assert_eq!(
            respond::<()>(Err(Error::Internal("boom".into())), |()| {
                BeanstalkResponse::Deleted
            }),
            Outcome::RespondAndClose(BeanstalkResponse::InternalError)
        );
        assert_eq!(
            respond::<()>(Err(Error::DeadlineSoon), |()| {
                BeanstalkResponse::Deleted
            }),
            Outcome::Respond(BeanstalkResponse::DeadlineSoon)
        );
    }
}
