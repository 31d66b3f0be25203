pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod reply;
pub mod stub;
pub mod transport;

pub use command::Command;
pub use config::Config;
pub use connection::Connection;
pub use error::{Error, ErrorKind};
pub use reply::Reply;
pub use stub::Stub;
pub use transport::Transport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
