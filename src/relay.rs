//! Connection relay: TLS termination, origin connect, and the byte pump
//!
//! One [`Relay`] serves one client connection. It walks
//! `Accepted -> Handshaking -> ConnectedUpstream -> Relaying -> Closed`
//! (plain HTTP skips `Handshaking` and returns to `ConnectedUpstream` each
//! time a request moves the connection to another origin), or ends in
//! `Errored` from any step.
//! While relaying, every byte is written to the other leg before it is fed
//! to the [`FlowTracker`], so recording never holds traffic back.

use crate::ca::CertificateManager;
use crate::config::{CaptureLimits, MitmConfig};
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowTracker};
use crate::interceptor::InterceptorHandler;
use crate::route::OriginGate;
use crate::socket::MaybeTlsStream;
use crate::upstream::{Target, UpstreamConnector};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

/// Read buffer per direction
const BUFFER_SIZE: usize = 16 * 1024;

const BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a relayed connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
  /// Client connection accepted
  Accepted,
  /// TLS handshake with the client in progress
  Handshaking,
  /// Origin connection established
  ConnectedUpstream,
  /// Bytes flowing both ways
  Relaying,
  /// Both legs closed normally
  Closed,
  /// Ended by an error
  Errored,
}

impl fmt::Display for RelayState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Everything a relay borrows from the proxy
pub struct RelayContext {
  /// leaf certificates
  pub cert_manager: Arc<CertificateManager>,
  /// origin connections
  pub connector: Arc<UpstreamConnector>,
  /// completed-flow consumers
  pub interceptors: Arc<InterceptorHandler>,
  /// capture limits for every flow
  pub limits: CaptureLimits,
  /// idle timeout of a relayed connection
  pub idle_timeout: Duration,
  /// origin port for direct TLS connections
  pub transparent_tls_port: u16,
}

impl RelayContext {
  /// Context built from proxy settings
  pub fn new(
    config: &MitmConfig,
    cert_manager: Arc<CertificateManager>,
    connector: Arc<UpstreamConnector>,
    interceptors: Arc<InterceptorHandler>,
  ) -> Self {
    Self {
      cert_manager,
      connector,
      interceptors,
      limits: config.capture.limits(),
      idle_timeout: config.idle_timeout(),
      transparent_tls_port: config.transparent_tls_port,
    }
  }
}

/// Summary of a finished relay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
  /// flows handed to the interceptors
  pub flows_completed: usize,
  /// flows dropped unfinished
  pub flows_discarded: usize,
  /// bytes read from the client
  pub client_bytes: u64,
  /// bytes read from the origin
  pub upstream_bytes: u64,
  /// origin connection may serve another client
  pub upstream_reusable: bool,
  /// ended by the idle timeout
  pub timed_out: bool,
}

impl RelayOutcome {
  fn absorb(&mut self, other: &RelayOutcome) {
    self.flows_completed += other.flows_completed;
    self.flows_discarded += other.flows_discarded;
    self.client_bytes += other.client_bytes;
    self.upstream_bytes += other.upstream_bytes;
    self.upstream_reusable = other.upstream_reusable;
    self.timed_out |= other.timed_out;
  }
}

/// One client connection being relayed
pub struct Relay {
  id: u64,
  state: RelayState,
  ctx: Arc<RelayContext>,
}

impl Relay {
  /// New relay in the `Accepted` state
  pub fn new(ctx: Arc<RelayContext>) -> Self {
    let relay = Self {
      id: NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed),
      state: RelayState::Accepted,
      ctx,
    };
    tracing::debug!("[relay {}] {}", relay.id, relay.state);
    relay
  }

  /// Process-unique id
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Current state
  pub fn state(&self) -> RelayState {
    self.state
  }

  fn transition(&mut self, next: RelayState) {
    tracing::debug!("[relay {}] {} -> {}", self.id, self.state, next);
    self.state = next;
  }

  fn fail(&mut self, error: Error) -> Error {
    if error.is_disconnect() {
      tracing::debug!("[relay {}] {}", self.id, error);
    }
    self.transition(RelayState::Errored);
    error
  }

  /// Terminate the client's TLS and relay it to the origin over TLS
  ///
  /// `connect_target` is the CONNECT authority; direct TLS connections pass
  /// `None` and are routed by SNI.
  pub async fn intercept_tls<S>(
    mut self,
    client: S,
    connect_target: Option<Target>,
  ) -> Result<RelayOutcome>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    self.transition(RelayState::Handshaking);
    let start = match LazyConfigAcceptor::new(Acceptor::default(), client).await {
      Ok(start) => start,
      Err(e) => {
        return Err(self.fail(Error::handshake(format!("reading ClientHello: {}", e))));
      }
    };
    let sni = start.client_hello().server_name().map(str::to_string);
    let target = match (connect_target, &sni) {
      (Some(target), _) => target,
      (None, Some(name)) => Target::new(name.as_str(), self.ctx.transparent_tls_port),
      (None, None) => {
        return Err(self.fail(Error::handshake("direct TLS connection without SNI")));
      }
    };
    let server_name = sni.unwrap_or_else(|| target.host.clone());

    let entry = match self.ctx.cert_manager.issue_leaf_certificate(&server_name).await {
      Ok(entry) => entry,
      Err(e) => return Err(self.fail(e)),
    };
    let mut client = match start.into_stream(entry.server_config()).await {
      Ok(stream) => stream,
      Err(e) => {
        return Err(self.fail(Error::handshake(format!(
          "client handshake for {}: {}",
          server_name, e
        ))));
      }
    };

    let connector = self.ctx.connector.clone();
    let mut upstream = match connector.connect(&target, Some(server_name.as_str())).await {
      Ok(upstream) => upstream,
      Err(e) => {
        write_bad_gateway(&mut client).await;
        return Err(self.fail(e));
      }
    };
    self.transition(RelayState::ConnectedUpstream);

    let mut tracker = FlowTracker::new("https", &target.authority(), self.ctx.limits);
    let outcome = self.pipe(&mut client, &mut upstream, &mut tracker).await;
    self.finish(outcome, upstream, &target, Some(server_name.as_str()))
  }

  /// Relay a plain HTTP proxy connection, starting at `target`
  ///
  /// `head` holds the bytes already read from `client` for routing. A later
  /// request for another origin ends the exchange with the current one and
  /// is replayed on a connection to its own origin.
  pub async fn forward_plain<S>(
    mut self,
    mut client: S,
    target: Target,
    head: Vec<u8>,
  ) -> Result<RelayOutcome>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let connector = self.ctx.connector.clone();
    let mut gate = OriginGate::new(target, head, self.ctx.limits);
    let mut total = RelayOutcome::default();
    loop {
      let target = gate.bound().clone();
      let mut upstream = match connector.connect(&target, None).await {
        Ok(upstream) => upstream,
        Err(e) => {
          write_bad_gateway(&mut client).await;
          return Err(self.fail(e));
        }
      };
      self.transition(RelayState::ConnectedUpstream);

      let mut tracker = FlowTracker::new("http", &target.authority(), self.ctx.limits);
      self.transition(RelayState::Relaying);
      let outcome = match self
        .pump(&mut client, &mut upstream, &mut tracker, Some(&mut gate))
        .await
      {
        Ok(outcome) => outcome,
        Err(e) => {
          tracker.abort();
          return Err(self.fail(e));
        }
      };
      total.absorb(&outcome);
      if outcome.upstream_reusable {
        connector.release(&target, None, upstream);
      }
      match gate.next_origin() {
        Some(next) if !outcome.timed_out => gate = next,
        _ => break,
      }
    }
    self.transition(RelayState::Closed);
    self.log_totals(&total);
    Ok(total)
  }

  fn finish(
    mut self,
    outcome: Result<RelayOutcome>,
    upstream: MaybeTlsStream,
    target: &Target,
    server_name: Option<&str>,
  ) -> Result<RelayOutcome> {
    match outcome {
      Ok(outcome) => {
        self.transition(RelayState::Closed);
        self.log_totals(&outcome);
        if outcome.upstream_reusable {
          self.ctx.connector.release(target, server_name, upstream);
        }
        Ok(outcome)
      }
      Err(e) => Err(self.fail(e)),
    }
  }

  fn log_totals(&self, outcome: &RelayOutcome) {
    tracing::debug!(
      "[relay {}] {} flows recorded, {} discarded, {}/{} bytes up/down",
      self.id,
      outcome.flows_completed,
      outcome.flows_discarded,
      outcome.client_bytes,
      outcome.upstream_bytes
    );
  }

  /// Pump bytes both ways until either side is done or the connection idles
  ///
  /// Unfinished flows are discarded when the pump stops, whatever the reason.
  pub async fn pipe<C, U>(
    &mut self,
    client: &mut C,
    upstream: &mut U,
    tracker: &mut FlowTracker,
  ) -> Result<RelayOutcome>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
  {
    self.transition(RelayState::Relaying);
    let result = self.pump(client, upstream, tracker, None).await;
    if result.is_err() {
      tracker.abort();
    }
    result
  }

  /// With a gate, client bytes reach `upstream` only once cleared for its
  /// origin, and the pump stops after the exchanges before a rerouted request.
  async fn pump<C, U>(
    &mut self,
    client: &mut C,
    upstream: &mut U,
    tracker: &mut FlowTracker,
    mut gate: Option<&mut OriginGate>,
  ) -> Result<RelayOutcome>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
  {
    let mut outcome = RelayOutcome::default();
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; BUFFER_SIZE];
    let mut client_open = true;
    let mut half_closed = false;
    let idle = self.ctx.idle_timeout;
    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    // Replay what was read before the relay started
    if let Some(gate) = gate.as_deref_mut() {
      let cleared = gate.admit(&[]);
      self
        .send_request_bytes(&cleared, upstream, tracker, &mut outcome)
        .await?;
    }

    loop {
      tokio::select! {
        read = client.read(&mut client_buf), if client_open => {
          let n = match read {
            Ok(n) => n,
            // clients often drop TLS without close_notify
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
          };
          if n == 0 {
            client_open = false;
            if tracker.is_idle() && !tracker.is_passthrough() {
              outcome.upstream_reusable = outcome.flows_completed > 0 && tracker.keep_alive();
              break;
            }
            // No more requests; let the origin finish what is in flight
            if let Err(e) = upstream.shutdown().await {
              tracing::debug!("[relay {}] half-close toward origin: {}", self.id, e);
            }
            half_closed = true;
            continue;
          }
          deadline.as_mut().reset(Instant::now() + idle);
          match gate.as_deref_mut() {
            Some(gate) => {
              if tracker.is_passthrough() {
                gate.open();
              }
              let cleared = gate.admit(&client_buf[..n]);
              self
                .send_request_bytes(&cleared, upstream, tracker, &mut outcome)
                .await?;
              if gate.rerouted().is_some() {
                // Finish the exchanges already sent, then hand over
                client_open = false;
                if tracker.is_idle() {
                  outcome.upstream_reusable = outcome.flows_completed > 0 && tracker.keep_alive();
                  break;
                }
              }
            }
            None => {
              self
                .send_request_bytes(&client_buf[..n], upstream, tracker, &mut outcome)
                .await?;
            }
          }
        }
        read = upstream.read(&mut upstream_buf) => {
          let n = read?;
          if n == 0 {
            let completed = tracker.on_upstream_eof();
            self.dispatch(completed, &mut outcome).await;
            break;
          }
          client.write_all(&upstream_buf[..n]).await?;
          outcome.upstream_bytes += n as u64;
          let completed = tracker.on_upstream_bytes(&upstream_buf[..n]);
          self.dispatch(completed, &mut outcome).await;
          deadline.as_mut().reset(Instant::now() + idle);
          if !client_open && tracker.is_idle() && !tracker.is_passthrough() {
            outcome.upstream_reusable =
              !half_closed && outcome.flows_completed > 0 && tracker.keep_alive();
            break;
          }
        }
        _ = &mut deadline => {
          tracing::debug!("[relay {}] idle for {:?}, closing", self.id, idle);
          outcome.timed_out = true;
          break;
        }
      }
    }

    tracker.abort();
    outcome.flows_discarded = tracker.discarded();
    let handing_over = gate.is_some_and(|gate| gate.rerouted().is_some()) && !outcome.timed_out;
    if !handing_over {
      if let Err(e) = client.shutdown().await {
        tracing::debug!("[relay {}] closing client leg: {}", self.id, e);
      }
    }
    Ok(outcome)
  }

  async fn send_request_bytes<U>(
    &self,
    data: &[u8],
    upstream: &mut U,
    tracker: &mut FlowTracker,
    outcome: &mut RelayOutcome,
  ) -> Result<()>
  where
    U: AsyncWrite + Unpin,
  {
    if data.is_empty() {
      return Ok(());
    }
    upstream.write_all(data).await?;
    outcome.client_bytes += data.len() as u64;
    let completed = tracker.on_client_bytes(data);
    self.dispatch(completed, outcome).await;
    Ok(())
  }

  async fn dispatch(&self, completed: Vec<Flow>, outcome: &mut RelayOutcome) {
    for flow in completed {
      outcome.flows_completed += 1;
      self.ctx.interceptors.process_flow(&flow).await;
    }
  }
}

/// Best-effort 502 on the client leg
pub(crate) async fn write_bad_gateway<S>(client: &mut S)
where
  S: AsyncWrite + Unpin,
{
  let written = async {
    client.write_all(BAD_GATEWAY).await?;
    client.flush().await?;
    client.shutdown().await
  };
  if let Err(e) = written.await {
    tracing::debug!("could not send 502 to client: {}", e);
  }
}
