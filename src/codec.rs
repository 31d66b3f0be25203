use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::config::Config;
use crate::reply::{ParseError, Reply};
use crate::Error;

/// Encodes commands and decodes replies over a byte buffer.
///
/// Decoding consumes exactly the bytes of one reply and leaves the rest of the buffer alone,
/// so pipelined replies can sit in the same buffer.
#[derive(Clone, Debug, Default)]
pub struct RespCodec {
    config: Config,
}

impl RespCodec {
    pub fn new(config: Config) -> RespCodec {
        RespCodec { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor, &self.config) {
            Ok(reply) => reply,
            Err(ParseError::Incomplete) => return Ok(None), // Not enough data to parse a reply.
            Err(err) => return Err(err.into()),
        };

        let position = cursor.position() as usize;

        // Remove the parsed reply from the buffer.
        src.advance(position);

        Ok(Some(reply))
    }
}

impl Encoder<&Command> for RespCodec {
    type Error = Error;

    fn encode(&mut self, cmd: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        cmd.write_to(dst);
        Ok(())
    }
}
