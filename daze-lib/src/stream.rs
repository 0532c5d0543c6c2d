//! The reliable byte-stream abstraction everything relays over: a duplex
//! stream with EOF and half-close, boxed behind one trait object, plus
//! the splice helper and a datagram adapter for UDP destinations.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UdpSocket;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

impl std::fmt::Debug for dyn IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxedIo")
    }
}

pub type BoxedIo = Box<dyn IoStream>;

/// Duplex copy between two streams; relies on peer close or error to
/// finish, then attempts a graceful shutdown of both sides.
pub async fn splice<C, U>(client: &mut C, upstream: &mut U) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy_bidirectional(client, upstream).await?;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(copied)
}

/// A connected UDP socket behind the byte-stream interface. Each write
/// sends one datagram and each read receives one, so boundaries survive
/// as long as the reader supplies a large enough buffer.
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn udp_stream_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(echo_addr).await.unwrap();
        let mut stream = UdpStream::new(socket);
        stream.write_all(b"datagram").await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }

    #[tokio::test]
    async fn splice_moves_bytes_both_ways() {
        let (mut a, b) = tokio::io::duplex(64);
        let (mut c, d) = tokio::io::duplex(64);
        let relay = tokio::spawn(async move {
            let mut b = b;
            let mut d = d;
            splice(&mut b, &mut d).await
        });
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        c.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        drop(a);
        drop(c);
        let _ = relay.await.unwrap();
    }
}
