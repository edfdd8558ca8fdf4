//! Stream wrappers shared by the relay
//!
//! [`MaybeTlsStream`] is an origin connection that may or may not be TLS.
//! [`PrefixedStream`] replays bytes the front end already consumed while
//! sniffing a connection before reading from the socket again.

use bytes::{Buf, Bytes};
use futures::FutureExt;
use std::io::Error;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Origin-side connection, plain or TLS
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Whether the connection is TLS
  pub fn is_tls(&self) -> bool {
    matches!(self, MaybeTlsStream::Tls(_))
  }

  /// Whether an idle connection can still carry a request
  ///
  /// A closed, errored, or unexpectedly readable socket is not reusable.
  pub fn is_reusable(&self) -> bool {
    let mut byte = [0u8; 1];
    match self.deref().peek(&mut byte).now_or_never() {
      None => true,
      Some(Ok(_)) | Some(Err(_)) => false,
    }
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

// Deref to the TCP socket for address and peek access
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

/// Stream that first yields bytes already read from `inner`
///
/// Used when a head had to be read to route a connection but must still reach
/// the next hop unmodified.
#[derive(Debug)]
pub struct PrefixedStream<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> PrefixedStream<S> {
  /// Replay `prefix` before reading from `inner`
  pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
    Self {
      prefix: prefix.into(),
      inner,
    }
  }

  /// Bytes not yet replayed
  pub fn pending_prefix(&self) -> &[u8] {
    &self.prefix
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if !this.prefix.is_empty() {
      let n = this.prefix.len().min(buf.remaining());
      buf.put_slice(&this.prefix[..n]);
      this.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
