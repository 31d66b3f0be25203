// https://redis.io/docs/reference/protocol-spec

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::str;

use bytes::{Buf, Bytes};
use itertools::Itertools;
use thiserror::Error as ThisError;

use crate::config::Config;
use crate::error::{Error, ErrorKind};

static CRLF: &[u8; 2] = b"\r\n";

/// Arrays announcing more elements than this get their storage grown on demand instead of
/// reserved up front, so a hostile count cannot force a huge allocation.
const PREALLOCATE_LIMIT: usize = 1024;

#[derive(Debug, ThisError)]
pub enum ParseError {
    #[error("not enough data is available to parse an entire reply")]
    Incomplete,
    #[error("protocol error; invalid reply type {:?}", type_char(.0))]
    InvalidDataType(u8),
    #[error("protocol error; {0}")]
    Invalid(String),
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error {
        Error::parse(err.to_string())
    }
}

/// One decoded server reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Error(Error),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    /// Decodes exactly one reply starting at the cursor position.
    ///
    /// On success the cursor is left right after the reply's last byte. When the buffer ends
    /// before the reply does, `ParseError::Incomplete` is returned and the caller should retry
    /// once more bytes are available. Any other error means the data is malformed.
    pub fn parse(src: &mut Cursor<&[u8]>, config: &Config) -> Result<Reply, ParseError> {
        parse_reply(src, config, 0)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, dst: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                dst.push(u8::from(DataType::SimpleString));
                push_line(dst, s.as_bytes());
            }
            Reply::Error(err) => {
                dst.push(u8::from(DataType::SimpleError));
                push_line(dst, err.message().as_bytes());
            }
            Reply::Integer(i) => {
                dst.push(u8::from(DataType::Integer));
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Reply::Bulk(bytes) => {
                dst.push(u8::from(DataType::Bulk));
                dst.extend_from_slice(bytes.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(bytes);
                dst.extend_from_slice(CRLF);
            }
            Reply::Nil => dst.extend_from_slice(b"$-1\r\n"),
            Reply::Array(replies) => {
                dst.push(u8::from(DataType::Array));
                dst.extend_from_slice(replies.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for reply in replies {
                    reply.write_to(dst);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn into_result(self) -> Result<Reply, Error> {
        match self {
            Reply::Error(err) => Err(err),
            reply => Ok(reply),
        }
    }

    /// Bulk payload or status text as raw bytes.
    pub fn into_bytes(self) -> Result<Bytes, Error> {
        match self {
            Reply::Bulk(bytes) => Ok(bytes),
            Reply::Status(s) => Ok(Bytes::from(s)),
            Reply::Error(err) => Err(err),
            reply => Err(conversion(&reply, "bytes")),
        }
    }

    pub fn into_string(self) -> Result<String, Error> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::new(ErrorKind::Conversion, "reply is not valid UTF-8"))
    }

    /// Integer replies as-is; bulk and status replies when they hold a decimal number.
    pub fn to_int(&self) -> Result<i64, Error> {
        let text = match self {
            Reply::Integer(i) => return Ok(*i),
            Reply::Error(err) => return Err(err.clone()),
            Reply::Bulk(bytes) => str::from_utf8(bytes).ok(),
            Reply::Status(s) => Some(s.as_str()),
            reply => return Err(conversion(reply, "integer")),
        };

        text.and_then(|text| text.parse().ok())
            .ok_or_else(|| conversion(self, "integer"))
    }

    /// Array of strings. A nil element is a conversion error, not an empty string.
    pub fn into_list(self) -> Result<Vec<String>, Error> {
        match self {
            Reply::Array(replies) => replies.into_iter().map(Reply::into_string).collect(),
            Reply::Error(err) => Err(err),
            reply => Err(conversion(&reply, "list")),
        }
    }

    /// Array of alternating field and value strings, as returned by `HGETALL`.
    pub fn into_map(self) -> Result<HashMap<String, String>, Error> {
        let list = self.into_list()?;
        if list.len() % 2 != 0 {
            return Err(Error::new(
                ErrorKind::Conversion,
                "cannot convert an odd number of elements into a map",
            ));
        }

        Ok(list.into_iter().tuples().collect())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Nil => "nil",
            Reply::Array(_) => "array",
        }
    }
}

impl From<Error> for Reply {
    fn from(err: Error) -> Self {
        Reply::Error(err)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(err) => write!(f, "(error) {}", err),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(replies) => write!(f, "[{}]", replies.iter().join(", ")),
        }
    }
}

fn parse_reply(src: &mut Cursor<&[u8]>, config: &Config, depth: usize) -> Result<Reply, ParseError> {
    // The first byte of every reply identifies its type.
    let first_byte = get_byte(src)?;
    let data_type = DataType::try_from(first_byte)?;

    match data_type {
        DataType::SimpleString => {
            let line = get_line(src, config.max_frame_size)?;
            Ok(Reply::Status(utf8(line)?))
        }
        DataType::SimpleError => {
            let line = get_line(src, config.max_frame_size)?;
            Ok(Reply::Error(Error::server(utf8(line)?)))
        }
        DataType::Integer => {
            let line = get_line(src, config.max_frame_size)?;
            Ok(Reply::Integer(parse_decimal(line)?))
        }
        // $<length>\r\n<data>\r\n
        DataType::Bulk => {
            let line = get_line(src, config.max_frame_size)?;
            let Some(length) = parse_length(line, config)? else {
                return Ok(Reply::Nil);
            };

            let data = get_exact(src, length)?;
            Ok(Reply::Bulk(Bytes::copy_from_slice(data)))
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        DataType::Array => {
            let line = get_line(src, config.max_frame_size)?;
            let Some(count) = parse_length(line, config)? else {
                return Ok(Reply::Nil);
            };

            if depth >= config.max_depth {
                return Err(ParseError::Invalid(format!(
                    "arrays nested deeper than {} levels",
                    config.max_depth
                )));
            }

            let mut replies = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
            for _ in 0..count {
                replies.push(parse_reply(src, config, depth + 1)?);
            }

            Ok(Reply::Array(replies))
        }
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the rest of the current line without its `\r\n` terminator.
///
/// Lines longer than `limit` are rejected, terminated or not, so a peer that never sends `\n`
/// cannot grow the read buffer forever.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>, limit: usize) -> Result<&'a [u8], ParseError> {
    let buf: &'a [u8] = *src.get_ref();
    let start = src.position() as usize;

    let newline = buf[start..].iter().position(|&b| b == b'\n');
    if newline.unwrap_or(buf.len() - start) > limit.saturating_add(1) {
        return Err(ParseError::Invalid(format!(
            "line exceeds the limit of {} bytes",
            limit
        )));
    }
    let newline = newline
        .map(|index| start + index)
        .ok_or(ParseError::Incomplete)?;

    if newline == start || buf[newline - 1] != b'\r' {
        return Err(ParseError::Invalid("line is not terminated by CRLF".into()));
    }

    src.set_position((newline + 1) as u64);
    Ok(&buf[start..newline - 1])
}

/// Returns exactly `length` bytes followed by a mandatory `\r\n`.
fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, length: usize) -> Result<&'a [u8], ParseError> {
    let buf: &'a [u8] = *src.get_ref();
    let start = src.position() as usize;
    let end = start + length;

    if buf.len() < end + CRLF.len() {
        return Err(ParseError::Incomplete);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(ParseError::Invalid(
            "bulk string is not terminated by CRLF".into(),
        ));
    }

    src.set_position((end + CRLF.len()) as u64);
    Ok(&buf[start..end])
}

fn type_char(byte: &u8) -> char {
    char::from(*byte)
}

fn utf8(bytes: &[u8]) -> Result<String, ParseError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ParseError::Invalid("invalid UTF-8 in reply line".into()))
}

fn parse_decimal(bytes: &[u8]) -> Result<i64, ParseError> {
    // `i64::from_str` accepts a leading '+', the wire format never sends one.
    str::from_utf8(bytes)
        .ok()
        .filter(|s| !s.starts_with('+'))
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ParseError::Invalid(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// Parses a bulk length or array count. `-1` is the null marker and maps to `None`.
fn parse_length(bytes: &[u8], config: &Config) -> Result<Option<usize>, ParseError> {
    match parse_decimal(bytes)? {
        -1 => Ok(None),
        length if length < 0 => Err(ParseError::Invalid(format!("invalid length {}", length))),
        length if length as u64 > config.max_frame_size as u64 => Err(ParseError::Invalid(
            format!("length {} exceeds the limit of {}", length, config.max_frame_size),
        )),
        length => Ok(Some(length as usize)),
    }
}

fn push_line(dst: &mut Vec<u8>, line: &[u8]) {
    // Simple strings cannot carry line breaks, they would end the reply early.
    dst.extend(line.iter().map(|&b| match b {
        b'\r' | b'\n' => b' ',
        b => b,
    }));
    dst.extend_from_slice(CRLF);
}

fn conversion(reply: &Reply, target: &str) -> Error {
    Error::new(
        ErrorKind::Conversion,
        format!("cannot convert {} reply into {}", reply.type_name(), target),
    )
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    Bulk,         // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = ParseError;

    fn try_from(byte: u8) -> Result<Self, ParseError> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::Bulk),
            b'*' => Ok(Self::Array),
            _ => Err(ParseError::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::Bulk => b'$',
            DataType::Array => b'*',
        }
    }
}
