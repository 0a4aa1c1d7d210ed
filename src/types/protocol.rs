use bytes::Bytes;

use super::serialisable::BeanstalkSerialisable;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// Places a job onto the currently `use`d tube. The command line is
    /// followed by `n_bytes` of job data and a CRLF.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Switches the tube subsequent `put`s insert into.
    ///
    /// On the wire: `use <tube>`
    Use { tube: String },
    /// Awaits a job from all the `watch`ed tubes, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead. A negative timeout waits forever.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: i64 },
    /// Reserves a job with a given ID if it exists and is ready, otherwise
    /// returning `NOT_FOUND`.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u64 },
    /// Deletes a job in the ready, delayed, reserved or buried states.
    /// Returns `DELETED` or `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Returns a reserved job to the ready queue, or to the delayed queue if
    /// `delay` is non-zero. Returns `RELEASED` or `NOT_FOUND`.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Buries a reserved job. Returns `BURIED` or `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Refreshes the Time To Run (TTR) of a reserved job. Returns `TOUCHED`
    /// or `NOT_FOUND`.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to the watchlist for this client. Always replies with
    /// `WATCHING <number of watched tubes>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses the effect of `watch` on this client. Returns `WATCHING <n>` or
    /// `NOT_IGNORED` if this would remove the last tube in the watchlist.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Requests that the server close this connection, releasing any
    /// server-side resources in doing so.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible response types to a `BeanstalkCommand`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    /// Indicates a server bug or backend failure. The connection is closed
    /// after sending it.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a bad request, typically because:
    ///
    /// * A field was missing, or an extra one was given.
    /// * A non-number was provided where a number was expected, or the number
    ///   was out of range.
    /// * The data following a `put` wasn't terminated by a CRLF.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent a bad request with an unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, indicates a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, indicates the backend refused immediate
    /// insertion and buried the job instead.
    ///
    /// On the wire: `BURIED <id>`.
    BuriedID { id: u64 },
    /// In response to a `put`, indicates the job body was larger than what the
    /// server is configured to accept.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `use`, names the tube now in use.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: String },
    /// In response to a `reserve` or `reserve-with-timeout`, indicates the
    /// client has reserved a job that will exceed its Time To Run (TTR) in the
    /// next second.
    ///
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// In response to a `reserve-with-timeout`, indicates the timeout provided
    /// expired with no job becoming available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// In response to a `reserve`, `reserve-with-timeout`, or `reserve-job`,
    /// provides the ID and data of the job that was just reserved.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: u64, data: Bytes },
    /// The job named by `reserve-job`, `delete`, `release`, `bury` or `touch`
    /// is unknown or isn't in a state that command accepts.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `delete` command, indicates the job was successfully
    /// deleted.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release` command, indicates the job was successfully
    /// released back to the ready or delayed states.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `bury`, indicates success.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// In response to a `touch`, indicates the job's TTR was refreshed.
    ///
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, indicates success and the number
    /// of tubes currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: usize },
    /// In response to an `ignore`, indicates the command failed as it would
    /// leave the client with an empty watchlist.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            BuriedID { id } => format!("BURIED {id}\r\n").into(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => [
                format!("RESERVED {id} {}\r\n", data.len()).as_bytes(),
                &data[..],
                &b"\r\n"[..],
            ]
            .concat(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialise_response() {
        use BeanstalkResponse::*;

        #[track_caller]
        fn wire(resp: BeanstalkResponse, expect: &[u8]) {
            assert_eq!(resp.serialise_beanstalk(), expect);
        }

        wire(Inserted { id: 1 }, b"INSERTED 1\r\n");
        wire(BuriedID { id: 77 }, b"BURIED 77\r\n");
        wire(
            Using {
                tube: "emails".into(),
            },
            b"USING emails\r\n",
        );
        wire(
            Reserved {
                id: 12,
                data: Bytes::from_static(b"hello"),
            },
            b"RESERVED 12 5\r\nhello\r\n",
        );
        // Payloads are opaque and may contain CRLF themselves.
        wire(
            Reserved {
                id: 3,
                data: Bytes::from_static(b"a\r\nb"),
            },
            b"RESERVED 3 4\r\na\r\nb\r\n",
        );
        wire(
            Reserved {
                id: 4,
                data: Bytes::new(),
            },
            b"RESERVED 4 0\r\n\r\n",
        );
        wire(Watching { count: 2 }, b"WATCHING 2\r\n");
        wire(NotIgnored, b"NOT_IGNORED\r\n");
        wire(TimedOut, b"TIMED_OUT\r\n");
        wire(Buried, b"BURIED\r\n");
        wire(InternalError, b"INTERNAL_ERROR\r\n");
    }
}
