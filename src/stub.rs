use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::codec::RespCodec;
use crate::command::Command;
use crate::config::Config;
use crate::error::{timed_out, Error};
use crate::reply::Reply;
use crate::transport::Transport;
use crate::BoxError;

/// Answers one request. Receives the command name followed by its arguments.
pub type Handler = Box<dyn FnMut(&[Bytes]) -> Result<Reply, BoxError> + Send>;

/// An in-memory stand-in for a server connection.
///
/// Every request written to the stub is decoded and handed to the handler right away; the
/// handler's reply is encoded into a buffer that readers drain. Handler errors are sent back
/// as error replies, just like a server rejecting a command.
///
/// Clones share the same stream, so one task can write while another one reads. The handler
/// is only ever called with the stub's lock held, which means it can keep mutable state
/// without any synchronization of its own.
#[derive(Clone)]
pub struct Stub {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    // Signalled whenever replies are produced or the stub is closed.
    readable: Notify,
}

struct State {
    handler: Handler,
    codec: RespCodec,
    // Request bytes written but not yet forming a complete command.
    incoming: BytesMut,
    // Encoded replies not yet read.
    outgoing: BytesMut,
    deadline: Option<Instant>,
    closed: bool,
}

impl Stub {
    pub fn new<F>(handler: F) -> Stub
    where
        F: FnMut(&[Bytes]) -> Result<Reply, BoxError> + Send + 'static,
    {
        Stub::with_config(handler, Config::default())
    }

    pub fn with_config<F>(handler: F, config: Config) -> Stub
    where
        F: FnMut(&[Bytes]) -> Result<Reply, BoxError> + Send + 'static,
    {
        let state = State {
            handler: Box::new(handler),
            codec: RespCodec::new(config),
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            deadline: None,
            closed: false,
        };

        Stub {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                readable: Notify::new(),
            }),
        }
    }

    /// Sets the absolute point in time after which waiting reads fail with a timeout. `None`
    /// waits forever. Applies to every clone of this stub.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.lock().deadline = deadline;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes the stream for every clone and wakes up anyone waiting on it.
    pub fn close(&self) -> io::Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(not_connected());
            }
            state.closed = true;
        }

        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Encodes the command and writes it, which runs the handler synchronously.
    pub fn encode(&self, cmd: &Command) -> Result<(), Error> {
        self.write(&cmd.to_bytes())?;
        Ok(())
    }

    /// Feeds raw request bytes. Complete requests are answered immediately; a partial request
    /// waits for the rest of its bytes.
    pub fn write(&self, src: &[u8]) -> io::Result<()> {
        let produced = {
            let mut state = self.lock();
            if state.closed {
                return Err(not_connected());
            }

            state.incoming.extend_from_slice(src);
            state.answer_requests()
        };

        if produced > 0 {
            self.shared.readable.notify_one();
        }

        Ok(())
    }

    /// Moves every buffered reply byte into `dst`, waiting until at least one is available.
    ///
    /// `deadline` takes precedence over the stub's own deadline.
    pub async fn read(&self, dst: &mut BytesMut, deadline: Option<Instant>) -> io::Result<usize> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if !state.outgoing.is_empty() {
                    let bytes = state.outgoing.split();
                    dst.extend_from_slice(&bytes);
                    return Ok(bytes.len());
                }
                if state.closed {
                    return Err(not_connected());
                }
                deadline.or(state.deadline)
            };

            wait(notified, deadline).await?;
        }
    }

    /// Reads exactly one reply, waiting until one is available or the deadline elapses.
    pub async fn decode(&self) -> Reply {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                let state = &mut *state;
                match state.codec.decode(&mut state.outgoing) {
                    Ok(Some(reply)) => return reply,
                    Ok(None) => {}
                    Err(err) => {
                        // The handler produced a reply this stub cannot read back. Its bytes
                        // would block every reply queued behind them.
                        state.outgoing.clear();
                        return Reply::Error(err);
                    }
                }
                if state.closed {
                    return Reply::Error(not_connected().into());
                }
                state.deadline
            };

            if let Err(err) = wait(notified, deadline).await {
                return Reply::Error(err.into());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking handler must not take every other user of the stub down with it.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    /// Answers every complete request in `incoming`. Returns how many replies were produced.
    fn answer_requests(&mut self) -> usize {
        let mut produced = 0;

        loop {
            let request = match self.codec.decode(&mut self.incoming) {
                Ok(Some(reply)) => Command::try_from(reply),
                Ok(None) => break,
                Err(err) => {
                    // Framing is lost, nothing after this point can be trusted.
                    self.incoming.clear();
                    Err(err)
                }
            };

            let reply = match request {
                Ok(cmd) => self.call(&cmd),
                Err(err) => Reply::Error(Error::server(format!("ERR {}", err))),
            };

            self.outgoing.extend_from_slice(&reply.serialize());
            produced += 1;
        }

        produced
    }

    fn call(&mut self, cmd: &Command) -> Reply {
        let args: Vec<Bytes> = cmd.parts().cloned().collect();

        match (self.handler)(&args) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(command = %String::from_utf8_lossy(cmd.name()), error = %err, "stub handler failed");
                Reply::Error(Error::server(err.to_string()))
            }
        }
    }
}

async fn wait(notified: std::pin::Pin<&mut Notified<'_>>, deadline: Option<Instant>) -> io::Result<()> {
    match deadline {
        Some(deadline) if deadline <= Instant::now() => Err(timed_out()),
        Some(deadline) => timeout_at(deadline, notified)
            .await
            .map_err(|_| timed_out()),
        None => {
            notified.await;
            Ok(())
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed stub connection")
}

impl Transport for Stub {
    async fn write_all(&mut self, src: &[u8], _deadline: Option<Instant>) -> io::Result<()> {
        // Writes never block, the handler answers synchronously.
        Stub::write(self, src)
    }

    async fn read_buf(&mut self, dst: &mut BytesMut, deadline: Option<Instant>) -> io::Result<usize> {
        Stub::read(self, dst, deadline).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn echo_stub() -> Stub {
        Stub::new(|args| match &args[0][..] {
            b"ECHO" => Ok(Reply::Bulk(args[1].clone())),
            _ => Err("unsupported".into()),
        })
    }

    #[tokio::test]
    async fn partial_requests_wait_for_the_rest() {
        let stub = echo_stub();
        let bytes = Command::new("ECHO").arg("hi").to_bytes();

        stub.write(&bytes[..5]).unwrap();
        stub.set_deadline(Some(Instant::now()));
        assert!(matches!(stub.decode().await, Reply::Error(ref err) if err.is_timeout()));

        stub.write(&bytes[5..]).unwrap();
        assert_eq!(stub.decode().await, Reply::Bulk(Bytes::from("hi")));
    }

    #[tokio::test]
    async fn malformed_requests_get_a_protocol_error() {
        let stub = echo_stub();

        stub.write(b"@garbage\r\n").unwrap();

        let reply = stub.decode().await;
        assert!(
            matches!(reply, Reply::Error(ref err) if err.kind() == ErrorKind::Server && err.message().starts_with("ERR protocol error")),
            "unexpected reply {:?}",
            reply
        );
    }

    #[tokio::test]
    async fn undecodable_replies_do_not_block_later_ones() {
        let config = Config {
            max_frame_size: 4,
            ..Config::default()
        };
        // Requests fit in the limit, but replies four times their argument may not.
        let stub = Stub::with_config(
            |args: &[Bytes]| Ok(Reply::Bulk(Bytes::from(args[1].repeat(4)))),
            config,
        );

        stub.encode(&Command::new("ECHO").arg("ab")).unwrap();
        let reply = stub.decode().await;
        assert!(
            matches!(reply, Reply::Error(ref err) if err.kind() == ErrorKind::Parse),
            "unexpected reply {:?}",
            reply
        );

        stub.encode(&Command::new("ECHO").arg("a")).unwrap();
        assert_eq!(stub.decode().await, Reply::Bulk(Bytes::from("aaaa")));
    }

    #[tokio::test]
    async fn read_drains_all_buffered_replies() {
        let stub = echo_stub();
        stub.encode(&Command::new("ECHO").arg("a")).unwrap();
        stub.encode(&Command::new("ECHO").arg("b")).unwrap();

        let mut buf = BytesMut::new();
        let n = stub.read(&mut buf, None).await.unwrap();

        assert_eq!(n, 14);
        assert_eq!(&buf[..], b"$1\r\na\r\n$1\r\nb\r\n");
    }

    #[tokio::test]
    async fn close_fails_further_use() {
        let stub = echo_stub();
        stub.close().unwrap();

        assert!(stub.is_closed());
        assert_eq!(
            stub.write(b"*1\r\n$4\r\nPING\r\n").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(
            matches!(stub.decode().await, Reply::Error(ref err) if err.kind() == ErrorKind::Io(io::ErrorKind::NotConnected))
        );
        assert!(stub.close().is_err());
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_reader() {
        let stub = echo_stub();
        let reader = tokio::spawn({
            let stub = stub.clone();
            async move { stub.decode().await }
        });

        tokio::task::yield_now().await;
        stub.close().unwrap();

        let reply = reader.await.unwrap();
        assert!(matches!(reply, Reply::Error(ref err) if err.kind() == ErrorKind::Io(io::ErrorKind::NotConnected)));
    }
}
