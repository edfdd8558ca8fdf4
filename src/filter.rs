//! Recording policy: which completed flows are worth keeping

use crate::config::{CaptureConfig, DomainMatch};
use std::fmt;
use url::Url;

/// Why a flow was not recorded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
  /// Host is outside the allowlist
  DomainNotAllowed,
  /// Path names a static asset
  StaticAsset,
}

impl fmt::Display for DropReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DropReason::DomainNotAllowed => f.write_str("domain not allowed"),
      DropReason::StaticAsset => f.write_str("static asset"),
    }
  }
}

/// Outcome of [`CaptureFilter::evaluate`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
  /// Record the flow
  Capture,
  /// Skip the flow
  Drop(DropReason),
}

impl FilterDecision {
  /// Whether the flow is recorded
  pub fn is_capture(&self) -> bool {
    matches!(self, FilterDecision::Capture)
  }
}

/// Domain allowlist plus static-asset exclusion
#[derive(Clone, Debug)]
pub struct CaptureFilter {
  domains: Vec<String>,
  domain_match: DomainMatch,
  static_extensions: Vec<String>,
}

impl CaptureFilter {
  /// Build from capture settings
  pub fn new(config: &CaptureConfig) -> Self {
    Self {
      domains: config
        .domains
        .iter()
        .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
        .collect(),
      domain_match: config.domain_match,
      static_extensions: config
        .static_extensions
        .iter()
        .map(|e| e.to_ascii_lowercase())
        .collect(),
    }
  }

  /// Decide whether a flow with this URL is recorded, first match wins
  pub fn evaluate(&self, url: &str) -> FilterDecision {
    if !self.domain_allowed(url) {
      return FilterDecision::Drop(DropReason::DomainNotAllowed);
    }
    if self.is_static_asset(url) {
      return FilterDecision::Drop(DropReason::StaticAsset);
    }
    FilterDecision::Capture
  }

  /// Whether the URL passes the allowlist
  pub fn domain_allowed(&self, url: &str) -> bool {
    match self.domain_match {
      DomainMatch::UrlSubstring => {
        let url = url.to_ascii_lowercase();
        self.domains.iter().any(|d| url.contains(d.as_str()))
      }
      DomainMatch::HostSuffix => {
        let Ok(parsed) = Url::parse(url) else {
          return false;
        };
        let Some(host) = parsed.host_str() else {
          return false;
        };
        let host = host.trim_end_matches('.');
        self.domains.iter().any(|d| {
          host == d.as_str()
            || host
              .strip_suffix(d.as_str())
              .is_some_and(|prefix| prefix.ends_with('.'))
        })
      }
    }
  }

  /// Whether the URL path ends with a static-asset extension
  pub fn is_static_asset(&self, url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
      return false;
    };
    let path = parsed.path().to_ascii_lowercase();
    self
      .static_extensions
      .iter()
      .any(|ext| path.ends_with(ext.as_str()))
  }
}
