use std::io;

use strum_macros::AsRefStr;
use thiserror::Error as ThisError;

/// Classifies every failure the client can report.
///
/// Kinds are plain values so they can be compared with `==` after being moved across tasks,
/// unlike shared error instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub enum ErrorKind {
    /// Malformed or truncated wire data. Byte boundaries are no longer trustworthy.
    Parse,
    /// A well-formed error reply sent by the server.
    Server,
    /// The server is still loading its dataset into memory (`-LOADING ...`). Worth retrying
    /// after a delay.
    Loading,
    /// The underlying stream failed. `io::ErrorKind::TimedOut` means a deadline elapsed.
    Io(io::ErrorKind),
    /// The connection was closed locally.
    Closed,
    /// The caller broke the connection contract, e.g. asked for a reply that was never
    /// requested.
    Misuse,
    /// A typed accessor was used on a reply of a different shape.
    Conversion,
}

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
        }
    }

    /// Builds an error from the text of a `-` reply, recognising the well-known transient
    /// conditions by the first word of the message.
    pub fn server(message: impl Into<String>) -> Error {
        let message = message.into();
        let kind = match message.split_whitespace().next() {
            Some("LOADING") => ErrorKind::Loading,
            _ => ErrorKind::Server,
        };

        Error { kind, message }
    }

    pub fn parse(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Parse, message)
    }

    pub fn closed() -> Error {
        Error::new(ErrorKind::Closed, "use of closed connection")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Io(io::ErrorKind::TimedOut)
    }

    pub fn is_loading(&self) -> bool {
        self.kind == ErrorKind::Loading
    }

    /// True for errors that were sent by the server, as opposed to local failures.
    pub fn is_server(&self) -> bool {
        matches!(self.kind, ErrorKind::Server | ErrorKind::Loading)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new(ErrorKind::Io(err.kind()), err.to_string())
    }
}

pub(crate) fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}
