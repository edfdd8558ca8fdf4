//! Proxy and capture configuration

use crate::ca::MAX_LEAF_TTL_DAYS;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `SLINGER_CAPTURE__CAPTURE__OUTPUT_PATH`
pub const ENV_PREFIX: &str = "SLINGER_CAPTURE";

/// How allowlist entries are matched against a flow
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainMatch {
  /// URL host equals the entry or is a subdomain of it
  #[default]
  HostSuffix,
  /// Entry appears anywhere in the full URL
  UrlSubstring,
}

/// What gets recorded and where it goes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
  /// Domain allowlist
  pub domains: Vec<String>,
  /// Allowlist matching mode
  pub domain_match: DomainMatch,
  /// Path suffixes that are never recorded (compared case-insensitively)
  pub static_extensions: Vec<String>,
  /// Maximum characters of request body kept per entry
  pub request_body_limit: usize,
  /// Maximum characters of response body kept per entry
  pub response_body_limit: usize,
  /// JSON file written at shutdown
  pub output_path: PathBuf,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      domains: vec!["cityheaven.net".to_string(), "gnavi.co.jp".to_string()],
      domain_match: DomainMatch::HostSuffix,
      static_extensions: [
        ".png", ".jpg", ".jpeg", ".gif", ".css", ".js", ".woff", ".woff2", ".ico", ".svg",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      request_body_limit: 5000,
      response_body_limit: 10000,
      output_path: PathBuf::from("city_heaven.json"),
    }
  }
}

impl CaptureConfig {
  /// Body truncation limits
  pub fn limits(&self) -> CaptureLimits {
    CaptureLimits {
      request_body: self.request_body_limit,
      response_body: self.response_body_limit,
    }
  }
}

/// Per-side body truncation limits, in characters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureLimits {
  /// request body limit
  pub request_body: usize,
  /// response body limit
  pub response_body: usize,
}

impl Default for CaptureLimits {
  fn default() -> Self {
    CaptureConfig::default().limits()
  }
}

/// Configuration for the capture proxy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmConfig {
  /// Address the proxy listens on
  pub listen_addr: String,
  /// Directory holding a generated CA when no PEM paths are given
  pub ca_storage_path: PathBuf,
  /// Externally provisioned root certificate (PEM)
  pub ca_cert_path: Option<PathBuf>,
  /// Externally provisioned root private key (PEM)
  pub ca_key_path: Option<PathBuf>,
  /// Terminate TLS inside CONNECT tunnels; when off tunnels are spliced blindly
  pub enable_https_interception: bool,
  /// Maximum concurrent connections
  pub max_connections: usize,
  /// Idle timeout of a relayed connection in seconds
  pub connection_timeout: u64,
  /// Upstream dial timeout in seconds
  pub connect_timeout: u64,
  /// How long shutdown waits for in-flight connections, in seconds
  pub shutdown_grace: u64,
  /// Origin port used for direct (transparent) TLS connections
  pub transparent_tls_port: u16,
  /// Skip origin certificate verification
  pub upstream_insecure: bool,
  /// Idle upstream connections kept per origin
  pub pool_max_idle_per_host: usize,
  /// How long an idle upstream connection stays reusable, in seconds
  pub pool_idle_timeout: u64,
  /// Validity of issued leaf certificates in days
  pub leaf_ttl_days: i64,
  /// Recording policy
  pub capture: CaptureConfig,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      ca_storage_path: PathBuf::from(".slinger-capture"),
      ca_cert_path: None,
      ca_key_path: None,
      enable_https_interception: true,
      max_connections: 1000,
      connection_timeout: 30,
      connect_timeout: 10,
      shutdown_grace: 5,
      transparent_tls_port: 443,
      upstream_insecure: false,
      pool_max_idle_per_host: 8,
      pool_idle_timeout: 30,
      leaf_ttl_days: 365,
      capture: CaptureConfig::default(),
    }
  }
}

impl MitmConfig {
  /// Layer defaults, an optional config file and `SLINGER_CAPTURE__*` variables
  pub fn load(file: Option<&Path>) -> Result<Self> {
    let mut builder =
      config::Config::builder().add_source(config::Config::try_from(&MitmConfig::default())?);
    if let Some(path) = file {
      builder = builder.add_source(config::File::from(path).required(true));
    }
    let loaded: MitmConfig = builder
      .add_source(
        config::Environment::with_prefix(ENV_PREFIX)
          .separator("__")
          .try_parsing(true)
          .list_separator(",")
          .with_list_parse_key("capture.domains")
          .with_list_parse_key("capture.static_extensions"),
      )
      .build()?
      .try_deserialize()?;
    loaded.validate()
  }

  /// Check and normalise values
  pub fn validate(mut self) -> Result<Self> {
    if self.max_connections == 0 {
      return Err(Error::config("max_connections must be greater than zero"));
    }
    if self.connection_timeout == 0 {
      return Err(Error::config("connection_timeout must be greater than zero"));
    }
    if self.capture.request_body_limit == 0 || self.capture.response_body_limit == 0 {
      return Err(Error::config("body limits must be greater than zero"));
    }
    if !(1..=MAX_LEAF_TTL_DAYS).contains(&self.leaf_ttl_days) {
      return Err(Error::config(format!(
        "leaf_ttl_days must be between 1 and {}",
        MAX_LEAF_TTL_DAYS
      )));
    }
    if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
      return Err(Error::config(
        "ca_cert_path and ca_key_path must be set together",
      ));
    }
    let mut domains = Vec::with_capacity(self.capture.domains.len());
    for domain in self.capture.domains.drain(..) {
      let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
      if domain.is_empty() {
        return Err(Error::config("empty entry in capture.domains"));
      }
      domains.push(domain);
    }
    self.capture.domains = domains;
    self.capture.static_extensions = self
      .capture
      .static_extensions
      .iter()
      .map(|ext| ext.trim().to_ascii_lowercase())
      .filter(|ext| !ext.is_empty())
      .map(|ext| {
        if ext.starts_with('.') {
          ext
        } else {
          format!(".{}", ext)
        }
      })
      .collect();
    Ok(self)
  }

  /// Idle timeout of a relayed connection
  pub fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.connection_timeout)
  }

  /// Upstream dial timeout
  pub fn dial_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout)
  }
}
