//! Origin connections: dialing, TLS, and the idle pool

use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::socket::MaybeTlsStream;
use parking_lot::Mutex;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// Host and port of an origin
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
  /// hostname or IP literal, without brackets
  pub host: String,
  /// port
  pub port: u16,
}

impl Target {
  /// New target
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
  pub fn parse(authority: &str, default_port: u16) -> Result<Self> {
    let authority = authority.trim();
    let invalid = || Error::invalid_request(format!("invalid authority {:?}", authority));
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
      let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
      match rest.strip_prefix(':') {
        Some(port) => (host, Some(port)),
        None if rest.is_empty() => (host, None),
        None => return Err(invalid()),
      }
    } else {
      match authority.rsplit_once(':') {
        // a bare IPv6 literal has several colons
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (authority, None),
      }
    };
    if host.is_empty() {
      return Err(invalid());
    }
    let port = match port {
      Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
      None => default_port,
    };
    Ok(Self::new(host, port))
  }

  /// `host:port`, bracketing IPv6 literals
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.authority())
  }
}

/// Identity of a reusable origin connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
  /// origin
  pub target: Target,
  /// TLS server name, `None` for plain connections
  pub server_name: Option<String>,
}

impl PoolKey {
  /// Key for a connection to `target`, TLS when `server_name` is set
  pub fn new(target: &Target, server_name: Option<&str>) -> Self {
    Self {
      target: target.clone(),
      server_name: server_name.map(|s| s.to_ascii_lowercase()),
    }
  }
}

struct Idle {
  stream: MaybeTlsStream,
  since: Instant,
}

/// Idle origin connections awaiting reuse
pub struct ConnectionPool {
  idle: Mutex<HashMap<PoolKey, Vec<Idle>>>,
  max_idle_per_host: usize,
  idle_timeout: Duration,
}

impl ConnectionPool {
  /// Empty pool
  pub fn new(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
    Self {
      idle: Mutex::new(HashMap::new()),
      max_idle_per_host,
      idle_timeout,
    }
  }

  /// Take the most recently released live connection for `key`
  pub fn checkout(&self, key: &PoolKey) -> Option<MaybeTlsStream> {
    let mut idle = self.idle.lock();
    let list = idle.get_mut(key)?;
    let now = Instant::now();
    let mut found = None;
    while let Some(entry) = list.pop() {
      if now.duration_since(entry.since) > self.idle_timeout {
        continue;
      }
      if entry.stream.is_reusable() {
        found = Some(entry.stream);
        break;
      }
    }
    if list.is_empty() {
      idle.remove(key);
    }
    found
  }

  /// Return a connection for reuse, dropping the oldest past the limit
  ///
  /// Expired connections for every origin are closed on the way in, so hosts
  /// that are never visited again do not keep sockets open.
  pub fn release(&self, key: PoolKey, stream: MaybeTlsStream) {
    if self.max_idle_per_host == 0 {
      return;
    }
    let now = Instant::now();
    let mut idle = self.idle.lock();
    idle.retain(|_, list| {
      list.retain(|entry| now.duration_since(entry.since) <= self.idle_timeout);
      !list.is_empty()
    });
    let list = idle.entry(key).or_default();
    list.push(Idle { stream, since: now });
    if list.len() > self.max_idle_per_host {
      let excess = list.len() - self.max_idle_per_host;
      list.drain(..excess);
    }
  }

  /// Idle connections held for `key`
  pub fn idle_count(&self, key: &PoolKey) -> usize {
    self.idle.lock().get(key).map_or(0, Vec::len)
  }
}

/// Accepts any origin certificate
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Client TLS settings for origin connections
fn client_tls_config(insecure: bool) -> Result<Arc<ClientConfig>> {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let builder = ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions()?;
  let mut config = if insecure {
    tracing::warn!("origin certificate verification is disabled");
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
      tracing::debug!("skipping native certificate source: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!("loaded {} native roots ({} ignored)", added, ignored);
    if added == 0 {
      tracing::warn!("no trusted roots found, origin TLS connections will fail");
    }
    builder
      .with_root_certificates(roots)
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Dials origins and keeps idle connections for reuse
pub struct UpstreamConnector {
  connect_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
  pool: ConnectionPool,
}

impl UpstreamConnector {
  /// Connector configured from proxy settings
  pub fn new(config: &MitmConfig) -> Result<Self> {
    Ok(Self {
      connect_timeout: config.dial_timeout(),
      nodelay: true,
      keepalive: true,
      tls: TlsConnector::from(client_tls_config(config.upstream_insecure)?),
      pool: ConnectionPool::new(
        config.pool_max_idle_per_host,
        Duration::from_secs(config.pool_idle_timeout),
      ),
    })
  }

  /// Idle pool
  pub fn pool(&self) -> &ConnectionPool {
    &self.pool
  }

  /// Open a TCP connection, trying each resolved address in turn
  pub async fn connect_tcp(&self, target: &Target) -> Result<TcpStream> {
    let dial = async {
      let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
      for addr in tokio::net::lookup_host((target.host.as_str(), target.port)).await? {
        match self.connect_with_addr(addr).await {
          Ok(stream) => return Ok(stream),
          Err(e) => {
            tracing::debug!("connect to {} ({}) failed: {}", target, addr, e);
            last_error = e;
          }
        }
      }
      Err::<TcpStream, io::Error>(last_error)
    };
    match tokio::time::timeout(self.connect_timeout, dial).await {
      Ok(Ok(stream)) => Ok(stream),
      Ok(Err(e)) => Err(Error::upstream_connect(target.authority(), e)),
      Err(_) => Err(Error::upstream_connect(
        target.authority(),
        io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
      )),
    }
  }

  async fn connect_with_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    if self.keepalive {
      raw_socket.set_keepalive(true)?;
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    let stream = socket.connect(addr).await?;
    if self.nodelay {
      stream.set_nodelay(true)?;
    }
    Ok(stream)
  }

  /// Connection to `target`, TLS when `server_name` is set
  ///
  /// A pooled connection for the same origin is reused when one is alive.
  pub async fn connect(&self, target: &Target, server_name: Option<&str>) -> Result<MaybeTlsStream> {
    let key = PoolKey::new(target, server_name);
    if let Some(stream) = self.pool.checkout(&key) {
      tracing::debug!("reusing pooled connection to {}", target);
      return Ok(stream);
    }
    let tcp = self.connect_tcp(target).await?;
    let Some(name) = server_name else {
      return Ok(MaybeTlsStream::Tcp(tcp));
    };
    let domain = ServerName::try_from(name.to_string()).map_err(|e| {
      Error::upstream_connect(
        target.authority(),
        io::Error::new(io::ErrorKind::InvalidInput, e),
      )
    })?;
    let handshake = self.tls.connect(domain, tcp);
    match tokio::time::timeout(self.connect_timeout, handshake).await {
      Ok(Ok(tls)) => Ok(MaybeTlsStream::Tls(Box::new(tls))),
      Ok(Err(e)) => Err(Error::upstream_connect(target.authority(), e)),
      Err(_) => Err(Error::upstream_connect(
        target.authority(),
        io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"),
      )),
    }
  }

  /// Hand a connection back for reuse
  pub fn release(&self, target: &Target, server_name: Option<&str>, stream: MaybeTlsStream) {
    tracing::debug!("returning connection to {} to the pool", target);
    self.pool.release(PoolKey::new(target, server_name), stream);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[test]
  fn test_parse_targets() {
    assert_eq!(Target::parse("r.gnavi.co.jp:443", 80).unwrap(), Target::new("r.gnavi.co.jp", 443));
    assert_eq!(Target::parse("example.com", 80).unwrap(), Target::new("example.com", 80));
    assert_eq!(Target::parse("[::1]:8443", 443).unwrap(), Target::new("::1", 8443));
    assert_eq!(Target::parse("[::1]", 443).unwrap(), Target::new("::1", 443));
    assert_eq!(Target::parse("::1", 443).unwrap(), Target::new("::1", 443));
    assert!(Target::parse("host:notaport", 80).is_err());
    assert!(Target::parse(":443", 80).is_err());
    assert!(Target::parse("[::1", 80).is_err());
  }

  #[test]
  fn test_authority_brackets_ipv6() {
    assert_eq!(Target::new("::1", 443).authority(), "[::1]:443");
    assert_eq!(Target::new("a.b", 80).to_string(), "a.b:80");
  }

  #[tokio::test]
  async fn test_unreachable_origin_is_upstream_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = UpstreamConnector::new(&MitmConfig::default()).unwrap();
    let result = connector.connect(&Target::new("127.0.0.1", port), None).await;
    assert!(matches!(result, Err(Error::UpstreamConnect { .. })));
  }

  #[tokio::test]
  async fn test_pool_reuses_live_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let target = Target::new("127.0.0.1", addr.port());
    let connector = UpstreamConnector::new(&MitmConfig::default()).unwrap();

    let (stream, accepted) = tokio::join!(connector.connect(&target, None), listener.accept());
    let stream = stream.unwrap();
    let _peer = accepted.unwrap();
    let local = stream.local_addr().unwrap();
    connector.release(&target, None, stream);
    assert_eq!(connector.pool().idle_count(&PoolKey::new(&target, None)), 1);

    let reused = connector.connect(&target, None).await.unwrap();
    assert_eq!(reused.local_addr().unwrap(), local);
    assert_eq!(connector.pool().idle_count(&PoolKey::new(&target, None)), 0);
  }

  #[tokio::test]
  async fn test_pool_keeps_newest_up_to_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let target = Target::new("127.0.0.1", addr.port());
    let key = PoolKey::new(&target, None);
    let pool = ConnectionPool::new(1, Duration::from_secs(30));

    let (first, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _first_peer = accepted.unwrap();
    let (second, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _second_peer = accepted.unwrap();
    let second = second.unwrap();
    let second_local = second.local_addr().unwrap();

    pool.release(key.clone(), MaybeTlsStream::Tcp(first.unwrap()));
    pool.release(key.clone(), MaybeTlsStream::Tcp(second));
    assert_eq!(pool.idle_count(&key), 1);

    let kept = pool.checkout(&key).unwrap();
    assert_eq!(kept.local_addr().unwrap(), second_local);
    assert!(pool.checkout(&key).is_none());
  }

  #[tokio::test]
  async fn test_release_closes_expired_connections_of_other_origins() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stale = PoolKey::new(&Target::new("127.0.0.1", addr.port()), None);
    let fresh = PoolKey::new(&Target::new("localhost", addr.port()), None);
    let pool = ConnectionPool::new(4, Duration::from_millis(50));

    let (first, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (mut stale_peer, _) = accepted.unwrap();
    pool.release(stale.clone(), MaybeTlsStream::Tcp(first.unwrap()));
    assert_eq!(pool.idle_count(&stale), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let (second, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _fresh_peer = accepted.unwrap();
    pool.release(fresh.clone(), MaybeTlsStream::Tcp(second.unwrap()));

    assert_eq!(pool.idle_count(&stale), 0);
    assert_eq!(pool.idle_count(&fresh), 1);
    assert_eq!(pool.idle.lock().len(), 1);

    // the expired socket was actually closed
    let mut buf = [0u8; 1];
    let read = tokio::io::AsyncReadExt::read(&mut stale_peer, &mut buf).await.unwrap();
    assert_eq!(read, 0);
  }
}
