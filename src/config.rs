use std::env;
use std::str::FromStr;

use tracing::warn;

/// Upper bound for a single bulk string or array count, mirroring the server's own
/// `proto-max-bulk-len` default.
const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;
const DEFAULT_MAX_DEPTH: usize = 512;
const DEFAULT_READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Limits applied while decoding replies and sizing buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest bulk length or array count accepted from the wire.
    pub max_frame_size: usize,
    /// Deepest array nesting accepted from the wire.
    pub max_depth: usize,
    /// Initial capacity of a connection's read buffer.
    pub read_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
        }
    }
}

impl Config {
    /// Defaults overridden by `MAX_FRAME_SIZE` and `MAX_REPLY_DEPTH` when set.
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Some(size) = var("MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }
        if let Some(depth) = var("MAX_REPLY_DEPTH") {
            config.max_depth = depth;
        }

        config
    }
}

fn var<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, %value, "ignoring environment variable, expected a number");
            None
        }
    }
}
