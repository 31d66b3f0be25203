use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::codec::RespCodec;
use crate::command::Command;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::reply::Reply;
use crate::transport::Transport;

/// A client connection over a single byte stream.
///
/// Supports plain request/response through [`Connection::cmd`] and pipelining through
/// [`Connection::append`] followed by [`Connection::get_reply`]. Replies are handed back in the
/// order the commands were sent, which is the order the server answers them in.
///
/// A connection is not meant to be shared: callers serialize their own access.
pub struct Connection<T> {
    id: Uuid,
    stream: T,
    // Data is read from the stream into the read buffer. When a reply is parsed, the
    // corresponding data is removed from the buffer.
    buffer: BytesMut,
    write_buffer: BytesMut,
    codec: RespCodec,
    // One entry per command sent whose reply was not read yet, oldest first.
    pending: VecDeque<Pending>,
    deadline: Option<Instant>,
    state: State,
}

#[derive(Debug)]
struct Pending {
    command: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Open,
    // A reply could not be parsed or a command was only partly written. Framing is lost for
    // good.
    Broken,
    Closed,
}

impl<T: Transport> Connection<T> {
    pub fn new(stream: T) -> Connection<T> {
        Connection::with_config(stream, Config::default())
    }

    pub fn with_config(stream: T, config: Config) -> Connection<T> {
        Connection {
            id: Uuid::new_v4(),
            stream,
            buffer: BytesMut::with_capacity(config.read_buffer_capacity),
            write_buffer: BytesMut::new(),
            codec: RespCodec::new(config),
            pending: VecDeque::new(),
            deadline: None,
            state: State::Open,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// Sets the absolute point in time after which reads and writes fail with a timeout.
    /// `None` removes the deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Number of commands sent whose replies have not been read.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_broken(&self) -> bool {
        self.state == State::Broken
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Sends the command and waits for its reply.
    ///
    /// If the command cannot be written, the write error is returned and nothing is read.
    pub async fn cmd(&mut self, cmd: &Command) -> Reply {
        if let Err(err) = self.append(cmd).await {
            return Reply::Error(err);
        }
        self.get_reply().await
    }

    /// Writes the command without waiting for its reply.
    ///
    /// The reply is queued for a later [`Connection::get_reply`] only when the write
    /// succeeded, so a failed append never leaves a reply behind that will not arrive. A failed
    /// write, timeouts included, breaks the connection since request framing is lost.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn append(&mut self, cmd: &Command) -> Result<(), Error> {
        match self.state {
            State::Open => {}
            State::Broken => return Err(broken()),
            State::Closed => return Err(Error::closed()),
        }

        self.write_buffer.clear();
        self.codec.encode(cmd, &mut self.write_buffer)?;

        if let Err(err) = self
            .stream
            .write_all(&self.write_buffer, self.deadline)
            .await
        {
            // Part of the command may already be on the wire, anything written after it would
            // be read by the server as the rest of this request.
            warn!(kind = ?err.kind(), error = %err, "failed to write command, connection is broken");
            self.state = State::Broken;
            return Err(err.into());
        }

        self.pending.push_back(Pending {
            command: cmd.name().clone(),
        });
        debug!(
            command = %String::from_utf8_lossy(cmd.name()),
            pending = self.pending.len(),
            "command sent"
        );

        Ok(())
    }

    /// Reads the reply to the oldest command sent with [`Connection::append`].
    ///
    /// Asking for a reply when no command is pending is a `Misuse` error. Read errors,
    /// timeouts included, leave the command pending so the same reply can be awaited again.
    /// A parse error breaks the connection: this and every later call fail.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn get_reply(&mut self) -> Reply {
        if self.state == State::Closed {
            return Reply::Error(Error::closed());
        }

        let Some(pending) = self.pending.front() else {
            return Reply::Error(Error::new(
                ErrorKind::Misuse,
                "no pending reply, get_reply called more times than append",
            ));
        };
        let command = String::from_utf8_lossy(&pending.command).into_owned();

        if self.state == State::Broken {
            self.pending.pop_front();
            return Reply::Error(broken());
        }

        match self.read_reply().await {
            Ok(reply) => {
                self.pending.pop_front();
                debug!(%command, "reply received");
                reply
            }
            Err(err) if err.kind() == ErrorKind::Parse => {
                warn!(%command, error = %err, "failed to parse reply, connection is broken");
                self.state = State::Broken;
                self.pending.pop_front();
                Reply::Error(err)
            }
            Err(err) => {
                debug!(%command, kind = err.kind().as_ref(), error = %err, "failed to read reply");
                Reply::Error(err)
            }
        }
    }

    /// Sends every command before reading any reply, then returns one reply per command in
    /// the same order.
    ///
    /// Fails every command with `Misuse` when replies from earlier appends are still pending.
    /// If reading stops on an I/O error, the remaining slots carry that error and their
    /// replies stay pending on the connection.
    pub async fn pipeline(&mut self, cmds: &[Command]) -> Vec<Reply> {
        if !self.pending.is_empty() {
            let err = Error::new(
                ErrorKind::Misuse,
                "pipeline started while earlier replies are still pending",
            );
            return cmds.iter().map(|_| Reply::Error(err.clone())).collect();
        }

        let mut sent = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            sent.push(self.append(cmd).await);
        }

        let mut replies = Vec::with_capacity(cmds.len());
        let mut failure: Option<Error> = None;
        for result in sent {
            let reply = match result {
                Err(err) => Reply::Error(err),
                Ok(()) => match failure.clone() {
                    Some(err) => Reply::Error(err),
                    None => {
                        let reply = self.get_reply().await;
                        if let Reply::Error(ref err) = reply {
                            if matches!(err.kind(), ErrorKind::Io(_)) {
                                failure = Some(err.clone());
                            }
                        }
                        reply
                    }
                },
            };
            replies.push(reply);
        }

        replies
    }

    /// Shuts the stream down. Every later operation fails with `Closed`.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.state == State::Closed {
            return Err(Error::closed());
        }

        debug!(discarded = self.pending.len(), "closing connection");
        self.state = State::Closed;
        self.pending.clear();
        self.buffer.clear();
        self.stream.shutdown().await?;

        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, Error> {
        loop {
            if let Some(reply) = self.codec.decode(&mut self.buffer)? {
                return Ok(reply);
            }

            let n = self.stream.read_buf(&mut self.buffer, self.deadline).await?;
            trace!(bytes = n, buffered = self.buffer.len(), "read from stream");

            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )
                    .into());
                }
                // The peer went away in the middle of a reply, its terminator will never come.
                return Err(Error::parse(
                    "protocol error; stream ended in the middle of a reply",
                ));
            }
        }
    }
}

fn broken() -> Error {
    Error::parse("connection is broken by an earlier protocol or write error")
}
