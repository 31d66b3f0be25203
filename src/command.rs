use std::str;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::reply::Reply;

static CRLF: &[u8; 2] = b"\r\n";

/// A command name and its arguments, ready to be sent as a RESP array of bulk strings.
///
/// The client never interprets the command; any name is accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Command {
        Command {
            name: name.to_arg(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Command
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(ToArg::to_arg));
        self
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Name followed by the arguments, the way they appear on the wire.
    pub fn parts(&self) -> impl Iterator<Item = &Bytes> {
        std::iter::once(&self.name).chain(self.args.iter())
    }

    /// Writes `*<count>\r\n` followed by one `$<len>\r\n<bytes>\r\n` per part.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let count = 1 + self.args.len();
        let size = self.parts().map(|part| part.len() + 16).sum::<usize>() + 16;
        dst.reserve(size);

        dst.put_u8(b'*');
        dst.put_slice(count.to_string().as_bytes());
        dst.put_slice(CRLF);

        for part in self.parts() {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(CRLF);
            dst.put_slice(part);
            dst.put_slice(CRLF);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.write_to(&mut dst);
        dst.freeze()
    }
}

impl TryFrom<Reply> for Command {
    type Error = Error;

    fn try_from(reply: Reply) -> Result<Self, Self::Error> {
        // Requests are sent as RESP arrays.
        let parts = match reply {
            Reply::Array(parts) => parts,
            reply => {
                return Err(Error::parse(format!(
                    "protocol error; expected array, got {}",
                    reply
                )))
            }
        };

        let mut parts = parts.into_iter().map(|part| match part {
            Reply::Bulk(bytes) => Ok(bytes),
            Reply::Status(s) => Ok(Bytes::from(s)),
            part => Err(Error::parse(format!(
                "protocol error; expected bulk string, got {}",
                part
            ))),
        });

        let name = parts
            .next()
            .ok_or_else(|| Error::parse("protocol error; empty command"))??;
        let args = parts.collect::<Result<Vec<_>, _>>()?;

        Ok(Command { name, args })
    }
}

/// Conversion of primitive values into a single command argument.
pub trait ToArg {
    fn to_arg(self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(self) -> Bytes {
        self
    }
}

impl ToArg for &Bytes {
    fn to_arg(self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &str {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl ToArg for &String {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &[u8] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for &[u8; N] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl ToArg for bool {
    fn to_arg(self) -> Bytes {
        Bytes::from_static(if self { b"1" } else { b"0" })
    }
}

macro_rules! impl_to_arg_display {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

impl_to_arg_display!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_get() {
        let cmd = Command::new("GET").arg("key");

        assert_eq!(&cmd.to_bytes()[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encode_without_arguments() {
        let cmd = Command::new("PING");

        assert_eq!(&cmd.to_bytes()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn encode_mixed_arguments() {
        let cmd = Command::new("SET")
            .arg("foo")
            .arg(-42)
            .arg(1.5)
            .arg(true)
            .arg(&b"\r\n\0"[..]);

        assert_eq!(
            &cmd.to_bytes()[..],
            &b"*6\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\n-42\r\n$3\r\n1.5\r\n$1\r\n1\r\n$3\r\n\r\n\0\r\n"[..]
        );
    }

    #[test]
    fn encode_appends_to_existing_buffer() {
        let mut dst = BytesMut::from(&b"prefix"[..]);
        Command::new("ECHO").arg("").write_to(&mut dst);

        assert_eq!(&dst[..], b"prefix*2\r\n$4\r\nECHO\r\n$0\r\n\r\n");
    }

    #[test]
    fn args_extend_in_order() {
        let cmd = Command::new("MGET").args(["a", "b", "c"]);

        let parts: Vec<_> = cmd.parts().cloned().collect();
        assert_eq!(
            parts,
            vec![
                Bytes::from("MGET"),
                Bytes::from("a"),
                Bytes::from("b"),
                Bytes::from("c")
            ]
        );
    }

    #[test]
    fn parse_command_from_reply() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("SET")),
            Reply::Bulk(Bytes::from("foo")),
            Reply::Status("bar".to_string()),
        ]);

        let cmd = Command::try_from(reply).unwrap();

        assert_eq!(cmd, Command::new("SET").arg("foo").arg("bar"));
        assert_eq!(cmd.name(), &Bytes::from("SET"));
        assert_eq!(cmd.arguments().len(), 2);
    }

    #[test]
    fn parse_command_rejects_other_shapes() {
        assert!(Command::try_from(Reply::Integer(1)).is_err());
        assert!(Command::try_from(Reply::Array(vec![])).is_err());
        assert!(Command::try_from(Reply::Array(vec![
            Reply::Bulk(Bytes::from("GET")),
            Reply::Integer(1),
        ]))
        .is_err());
    }
}
