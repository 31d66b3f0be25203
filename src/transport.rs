use std::future::Future;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use crate::error::timed_out;

/// The byte stream a [`Connection`](crate::Connection) talks over.
///
/// Deadlines are absolute. When one elapses the operation fails with
/// `io::ErrorKind::TimedOut` and the stream stays usable; `None` waits forever.
pub trait Transport: Send {
    /// Writes the whole buffer.
    fn write_all(
        &mut self,
        src: &[u8],
        deadline: Option<Instant>,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Appends whatever bytes are available to `dst`, waiting for at least one. Returns the
    /// number of bytes read, `0` meaning the peer closed the stream.
    fn read_buf(
        &mut self,
        dst: &mut BytesMut,
        deadline: Option<Instant>,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.map_err(|_| timed_out())?,
        None => fut.await,
    }
}

async fn write_stream<S>(stream: &mut S, src: &[u8], deadline: Option<Instant>) -> io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    with_deadline(deadline, async {
        stream.write_all(src).await?;
        stream.flush().await
    })
    .await
}

async fn read_stream<S>(
    stream: &mut S,
    dst: &mut BytesMut,
    deadline: Option<Instant>,
) -> io::Result<usize>
where
    S: AsyncRead + Unpin + Send,
{
    with_deadline(deadline, stream.read_buf(dst)).await
}

macro_rules! impl_transport {
    ($($ty:ty),*) => {
        $(
            impl Transport for $ty {
                async fn write_all(&mut self, src: &[u8], deadline: Option<Instant>) -> io::Result<()> {
                    write_stream(self, src, deadline).await
                }

                async fn read_buf(
                    &mut self,
                    dst: &mut BytesMut,
                    deadline: Option<Instant>,
                ) -> io::Result<usize> {
                    read_stream(self, dst, deadline).await
                }

                async fn shutdown(&mut self) -> io::Result<()> {
                    AsyncWriteExt::shutdown(self).await
                }
            }
        )*
    };
}

impl_transport!(TcpStream, DuplexStream);

#[cfg(unix)]
impl_transport!(tokio::net::UnixStream);
