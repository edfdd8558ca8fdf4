#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-capture
//!
//! A man-in-the-middle HTTP/HTTPS proxy that records matching
//! request/response pairs and writes them to a JSON file when it stops.
//!
//! - Local root CA, generated on first run, with per-host leaf certificates
//!   issued on demand and cached
//! - `CONNECT` tunnels, plain HTTP proxying and transparent TLS (by SNI)
//! - HTTP/1.1 framing tracked off the byte path: chunked, pipelined, `HEAD`,
//!   `1xx`, close-delimited
//! - Domain allowlist and static-asset filtering
//! - Bodies decompressed, charset-decoded and truncated before recording
//!
//! ## Running a capture session
//!
//! ```no_run
//! use slinger_capture::{MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = MitmConfig::load(None)?;
//!   let proxy = MitmProxy::new(config).await?;
//!   println!("trust this root: {:?}", proxy.ca_cert_path());
//!   let report = proxy
//!     .run_until(async {
//!       let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!   println!("{} entries written to {}", report.count, report.path.display());
//!   Ok(())
//! }
//! ```
//!
//! ## Watching flows
//!
//! Every completed exchange is handed to the registered
//! [`FlowInterceptor`]s. The [`Recorder`] that fills the session is always
//! registered; more can be added with [`MitmProxy::add_interceptor`].
//!
//! ```no_run
//! use slinger_capture::{Flow, FlowInterceptor, MitmProxy, Result};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl FlowInterceptor for Printer {
//!   async fn on_flow_complete(&self, flow: &Flow) -> Result<()> {
//!     println!("{:?} {:?}", flow.method(), flow.url());
//!     Ok(())
//!   }
//! }
//!
//! # async fn run() -> Result<()> {
//! let mut proxy = MitmProxy::default().await?;
//! proxy.add_interceptor(Arc::new(Printer));
//! proxy.start("127.0.0.1:8080").await
//! # }
//! ```

mod ca;
mod config;
mod decode;
mod error;
mod filter;
mod flow;
mod interceptor;
mod proxy;
mod record;
mod recorder;
mod relay;
mod route;
mod server;
mod session;
mod socket;
mod upstream;

pub use ca::{CertificateAuthority, CertificateEntry, CertificateManager};
pub use config::{CaptureConfig, CaptureLimits, DomainMatch, MitmConfig, ENV_PREFIX};
pub use decode::{body_text, decode_body, truncate_chars};
pub use error::{Error, Result};
pub use filter::{CaptureFilter, DropReason, FilterDecision};
pub use flow::{
  capture_budget, parse_request_head, parse_response_head, BodyCapture, Flow, FlowState,
  FlowTimestamps, FlowTracker, Headers, RequestHead, ResponseHead,
};
pub use interceptor::{FlowInterceptor, Interceptor, InterceptorHandler, LoggingInterceptor};
pub use proxy::MitmProxy;
pub use record::{CapturedEntry, CapturedRequest, CapturedResponse, HeaderFields};
pub use recorder::Recorder;
pub use relay::{Relay, RelayContext, RelayOutcome, RelayState};
pub use server::ProxyServer;
pub use session::{ExportReport, Exporter, SessionBuffer};
pub use socket::{MaybeTlsStream, PrefixedStream};
pub use upstream::{ConnectionPool, PoolKey, Target, UpstreamConnector};
