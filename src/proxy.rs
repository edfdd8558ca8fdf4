//! MITM proxy facade: wiring, serving, and the export at shutdown

use crate::ca::CertificateManager;
use crate::config::MitmConfig;
use crate::error::Result;
use crate::interceptor::{FlowInterceptor, InterceptorHandler};
use crate::recorder::Recorder;
use crate::relay::RelayContext;
use crate::server::ProxyServer;
use crate::session::{ExportReport, Exporter, SessionBuffer};
use crate::upstream::UpstreamConnector;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// MITM Proxy main struct
pub struct MitmProxy {
  config: MitmConfig,
  cert_manager: Arc<CertificateManager>,
  connector: Arc<UpstreamConnector>,
  interceptor_handler: Arc<InterceptorHandler>,
  session: Arc<SessionBuffer>,
  exported: AtomicBool,
}

impl MitmProxy {
  /// Create a new MITM proxy with the given configuration
  ///
  /// Loads or generates the root CA and registers the recorder.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let config = config.validate()?;
    let cert_manager = Arc::new(CertificateManager::from_config(&config).await?);
    let connector = Arc::new(UpstreamConnector::new(&config)?);
    let session = Arc::new(SessionBuffer::new());
    let mut interceptor_handler = InterceptorHandler::new();
    interceptor_handler.add_interceptor(Arc::new(Recorder::new(&config.capture, session.clone())));

    Ok(Self {
      config,
      cert_manager,
      connector,
      interceptor_handler: Arc::new(interceptor_handler),
      session,
      exported: AtomicBool::new(false),
    })
  }

  /// Create a new MITM proxy with default configuration
  pub async fn default() -> Result<Self> {
    Self::new(MitmConfig::default()).await
  }

  /// Register an interceptor that sees every completed flow
  ///
  /// Only takes effect for connections accepted afterwards.
  pub fn add_interceptor(&mut self, interceptor: Arc<dyn FlowInterceptor>) {
    Arc::make_mut(&mut self.interceptor_handler).add_interceptor(interceptor);
  }

  /// Get the CA certificate in PEM format
  ///
  /// This certificate should be installed in the client's trust store
  pub fn ca_cert_pem(&self) -> &str {
    self.cert_manager.ca_cert_pem()
  }

  /// Get the CA certificate path, when it lives on disk
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.cert_manager.ca_cert_path()
  }

  /// Entries captured so far
  pub fn session(&self) -> Arc<SessionBuffer> {
    self.session.clone()
  }

  /// Effective configuration
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  fn server(&self) -> ProxyServer {
    let ctx = RelayContext::new(
      &self.config,
      self.cert_manager.clone(),
      self.connector.clone(),
      self.interceptor_handler.clone(),
    );
    ProxyServer::new(&self.config, Arc::new(ctx))
  }

  /// Start the MITM proxy server on the given address, serving forever
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.server().run(addr).await
  }

  /// Serve on the configured address until `shutdown` resolves, then export
  pub async fn run_until<F>(&self, shutdown: F) -> Result<ExportReport>
  where
    F: Future<Output = ()>,
  {
    let listener = TcpListener::bind(&self.config.listen_addr).await?;
    tracing::info!("MITM proxy listening on {}", listener.local_addr()?);
    self.serve(listener, shutdown).await
  }

  /// Serve an already bound listener until `shutdown` resolves, then export
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<ExportReport>
  where
    F: Future<Output = ()>,
  {
    self.server().serve(listener, shutdown).await?;
    self.export().await
  }

  /// Write the captured entries to the configured output path
  ///
  /// Runs once; later calls export nothing and report zero entries.
  pub async fn export(&self) -> Result<ExportReport> {
    let path = self.config.capture.output_path.clone();
    if self.exported.swap(true, Ordering::SeqCst) {
      tracing::warn!("session already exported to {}", path.display());
      return Ok(ExportReport { count: 0, path });
    }
    let entries = self.session.drain();
    match tokio::task::spawn_blocking(move || Exporter::export(&entries, path)).await {
      Ok(report) => report,
      Err(e) => Err(std::io::Error::other(e).into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(dir: &tempfile::TempDir) -> MitmConfig {
    let mut config = MitmConfig {
      ca_storage_path: dir.path().join("ca"),
      listen_addr: "127.0.0.1:0".to_string(),
      ..Default::default()
    };
    config.capture.output_path = dir.path().join("capture.json");
    config
  }

  #[tokio::test]
  async fn test_mitm_proxy_creation() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = MitmProxy::new(config(&dir)).await.unwrap();
    assert!(proxy.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    assert_eq!(proxy.ca_cert_path(), Some(dir.path().join("ca").join("ca_cert.pem")));
    assert!(proxy.session().is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_exports_once() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = MitmProxy::new(config(&dir)).await.unwrap();
    let report = proxy.run_until(async {}).await.unwrap();
    assert_eq!(report.count, 0);
    assert_eq!(
      std::fs::read_to_string(dir.path().join("capture.json")).unwrap().trim(),
      "[]"
    );
    assert!(proxy.session().is_sealed());
    assert_eq!(proxy.export().await.unwrap().count, 0);
  }
}
