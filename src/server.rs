//! Accept loop and front-end dispatch
//!
//! Each accepted socket is sniffed once: a TLS record means transparent
//! interception, `CONNECT` opens a tunnel, anything else is proxied as plain
//! HTTP.

use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::flow::{find_head_end, parse_request_head, MAX_HEAD_SIZE};
use crate::relay::{write_bad_gateway, Relay, RelayContext};
use crate::route::plain_target;
use crate::socket::PrefixedStream;
use crate::upstream::Target;
use http::Method;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;
/// Largest CONNECT head accepted
const MAX_CONNECT_HEAD: usize = 16 * 1024;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] =
  b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Proxy server accepting client connections
pub struct ProxyServer {
  ctx: Arc<RelayContext>,
  limiter: Arc<Semaphore>,
  intercept_https: bool,
  shutdown_grace: Duration,
}

impl ProxyServer {
  /// Server relaying through `ctx`
  pub fn new(config: &MitmConfig, ctx: Arc<RelayContext>) -> Self {
    Self {
      ctx,
      limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
      intercept_https: config.enable_https_interception,
      shutdown_grace: Duration::from_secs(config.shutdown_grace),
    }
  }

  /// Bind `addr` and serve forever
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("MITM proxy listening on {}", listener.local_addr()?);
    self.serve(listener, std::future::pending()).await
  }

  /// Serve `listener` until `shutdown` resolves
  ///
  /// In-flight connections get `shutdown_grace` to finish before they are
  /// aborted.
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    let mut tasks = JoinSet::new();
    loop {
      while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
      }
      let permit = tokio::select! {
        _ = &mut shutdown => break,
        permit = self.limiter.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };
      let (stream, peer) = tokio::select! {
        _ = &mut shutdown => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(e) => {
            tracing::warn!("accept failed: {}", e);
            continue;
          }
        },
      };
      tracing::debug!("new connection from {}", peer);
      let ctx = self.ctx.clone();
      let intercept_https = self.intercept_https;
      tasks.spawn(async move {
        let _permit = permit;
        if let Err(e) = handle_connection(ctx, intercept_https, stream, peer).await {
          match &e {
            Error::Io(_) if !e.is_disconnect() => {
              tracing::warn!("connection from {} failed: {}", peer, e)
            }
            _ => tracing::debug!("connection from {} ended: {}", peer, e),
          }
        }
      });
    }

    drop(listener);
    tracing::info!("shutting down, waiting for {} connections", tasks.len());
    let drained = tokio::time::timeout(self.shutdown_grace, async {
      while let Some(joined) = tasks.join_next().await {
        log_join(joined);
      }
    })
    .await;
    if drained.is_err() {
      tracing::warn!("grace period over, aborting {} connections", tasks.len());
      tasks.abort_all();
      while tasks.join_next().await.is_some() {}
    }
    Ok(())
  }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    if e.is_panic() {
      tracing::error!("connection task panicked: {}", e);
    }
  }
}

async fn handle_connection(
  ctx: Arc<RelayContext>,
  intercept_https: bool,
  mut stream: TcpStream,
  peer: SocketAddr,
) -> Result<()> {
  let mut first = [0u8; 1];
  let n = match tokio::time::timeout(ctx.idle_timeout, stream.peek(&mut first)).await {
    Ok(peeked) => peeked?,
    Err(_) => return Err(Error::incomplete_flow(format!("{} sent nothing", peer))),
  };
  if n == 0 {
    return Ok(());
  }

  if first[0] == TLS_HANDSHAKE {
    if !intercept_https {
      tracing::debug!("direct TLS from {} while interception is off, closing", peer);
      return Ok(());
    }
    Relay::new(ctx).intercept_tls(stream, None).await?;
    return Ok(());
  }

  let head = tokio::time::timeout(ctx.idle_timeout, read_head(&mut stream)).await;
  let (buf, head_start, head_end) = match head {
    Ok(head) => head?,
    Err(_) => return Err(Error::incomplete_flow(format!("{} stalled in request head", peer))),
  };
  let request = match parse_request_head(&buf[head_start..head_end]) {
    Ok(request) => request,
    Err(e) => {
      reject(&mut stream).await;
      return Err(e);
    }
  };

  if request.method == Method::CONNECT {
    if head_end > MAX_CONNECT_HEAD {
      reject(&mut stream).await;
      return Err(Error::invalid_request("CONNECT headers too large"));
    }
    let target = match Target::parse(&request.target, 443) {
      Ok(target) => target,
      Err(e) => {
        reject(&mut stream).await;
        return Err(e);
      }
    };
    tracing::debug!("CONNECT {} from {}", target, peer);
    let client = PrefixedStream::new(buf[head_end..].to_vec(), stream);
    if intercept_https {
      let mut client = client;
      client.write_all(CONNECTION_ESTABLISHED).await?;
      Relay::new(ctx).intercept_tls(client, Some(target)).await?;
    } else {
      tunnel(&ctx, client, &target).await?;
    }
    return Ok(());
  }

  let target = match plain_target(&request) {
    Ok(target) => target,
    Err(e) => {
      reject(&mut stream).await;
      return Err(e);
    }
  };
  tracing::debug!("{} {} -> {} from {}", request.method, request.target, target, peer);
  Relay::new(ctx).forward_plain(stream, target, buf).await?;
  Ok(())
}

/// Read until the end of the first request head
///
/// Returns the bytes read plus where the head starts and ends. Bytes past the
/// head belong to the request body or the TLS handshake that follows.
async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, usize, usize)>
where
  S: AsyncRead + Unpin,
{
  let mut buf = Vec::with_capacity(4096);
  let mut chunk = [0u8; 4096];
  loop {
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      return Err(Error::incomplete_flow(
        "client closed before sending a request head",
      ));
    }
    buf.extend_from_slice(&chunk[..n]);
    let start = buf
      .iter()
      .position(|b| !matches!(b, b'\r' | b'\n'))
      .unwrap_or(buf.len());
    if let Some(end) = find_head_end(&buf, start) {
      if end - start > MAX_HEAD_SIZE {
        return Err(Error::invalid_request("request head too large"));
      }
      return Ok((buf, start, end));
    }
    if buf.len() - start > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("request head too large"));
    }
  }
}

/// Splice a CONNECT tunnel without looking inside
async fn tunnel<S>(ctx: &RelayContext, mut client: S, target: &Target) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut upstream = match ctx.connector.connect_tcp(target).await {
    Ok(upstream) => upstream,
    Err(e) => {
      write_bad_gateway(&mut client).await;
      return Err(e);
    }
  };
  client.write_all(CONNECTION_ESTABLISHED).await?;
  let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
  tracing::debug!("tunnel to {} closed, {}/{} bytes up/down", target, up, down);
  Ok(())
}

async fn reject<S>(stream: &mut S)
where
  S: AsyncWrite + Unpin,
{
  if let Err(e) = stream.write_all(BAD_REQUEST).await {
    tracing::debug!("could not send 400 to client: {}", e);
  }
  let _ = stream.shutdown().await;
}
