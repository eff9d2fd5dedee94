//! Accepted connections the listener can sever after the server is gone.
//!
//! axum drives every connection on its own task, so dropping the server
//! future leaves those tasks alive. Each accepted stream is tied to a
//! [`CancellationToken`]; once it is cancelled every read, write and flush
//! fails and the connection task drops the socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::serve::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Wraps a bound listener so that every accepted stream honours `token`.
pub(crate) struct Connections {
    tcp: TcpListener,
    token: CancellationToken,
}

impl Connections {
    pub(crate) const fn new(tcp: TcpListener, token: CancellationToken) -> Self {
        Self { tcp, token }
    }
}

impl Listener for Connections {
    type Io = Connection;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = Listener::accept(&mut self.tcp).await;
        (Connection::new(stream, self.token.clone()), addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Listener::local_addr(&self.tcp)
    }
}

/// A TCP stream that errors out once its token is cancelled.
pub(crate) struct Connection {
    stream: TcpStream,
    token: CancellationToken,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Connection {
    fn new(stream: TcpStream, token: CancellationToken) -> Self {
        let severed = Box::pin(token.clone().cancelled_owned());
        Self {
            stream,
            token,
            severed,
        }
    }

    /// Registers the task for wake-up on cancellation and reports whether
    /// the connection must stop.
    fn poll_severed(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.token.is_cancelled() || self.severed.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "redirect listener stopped",
            ));
        }
        Ok(())
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair(token: &CancellationToken) -> (Connection, TcpStream) {
        let mut connections = Connections::new(
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap(),
            token.clone(),
        );
        let addr = Listener::local_addr(&connections).unwrap();
        let (client, (server, _)) = tokio::join!(
            TcpStream::connect(addr),
            Listener::accept(&mut connections)
        );
        (server, client.unwrap())
    }

    #[tokio::test]
    async fn test_connection_passes_data_until_cancelled() {
        let token = CancellationToken::new();
        let (mut server, mut client) = pair(&token).await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        token.cancel();
        let err = server.write_all(b"pong").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_pending_read_wakes_on_cancel() {
        let token = CancellationToken::new();
        let (mut server, _client) = pair(&token).await;

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            server.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        token.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
