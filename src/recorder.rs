//! Turns completed flows into session entries

use crate::config::{CaptureConfig, CaptureLimits};
use crate::error::Result;
use crate::filter::{CaptureFilter, FilterDecision};
use crate::flow::Flow;
use crate::interceptor::FlowInterceptor;
use crate::session::SessionBuffer;
use std::sync::Arc;

/// Filters complete flows and appends the interesting ones to the session
pub struct Recorder {
  filter: CaptureFilter,
  limits: CaptureLimits,
  session: Arc<SessionBuffer>,
}

impl Recorder {
  /// Recorder writing into `session`
  pub fn new(config: &CaptureConfig, session: Arc<SessionBuffer>) -> Self {
    Self {
      filter: CaptureFilter::new(config),
      limits: config.limits(),
      session,
    }
  }

  /// Record a flow if it passes the filter, returns whether it was appended
  pub fn record(&self, flow: &Flow) -> bool {
    let (Some(method), Some(url)) = (flow.method(), flow.url()) else {
      return false;
    };
    tracing::info!("evaluating {} {}", method, url);
    match self.filter.evaluate(&url) {
      FilterDecision::Capture => {}
      FilterDecision::Drop(reason) => {
        tracing::trace!("skip {} {}: {}", method, url, reason);
        return false;
      }
    }
    let Some(entry) = flow.to_captured_entry(self.limits) else {
      tracing::debug!("flow {} is not complete, not recorded", flow.id());
      return false;
    };
    if !self.session.append(entry) {
      return false;
    }
    tracing::info!("captured {} {}", method, url);
    true
  }

  /// Session the recorder appends to
  pub fn session(&self) -> Arc<SessionBuffer> {
    self.session.clone()
  }
}

#[async_trait::async_trait]
impl FlowInterceptor for Recorder {
  async fn on_flow_complete(&self, flow: &Flow) -> Result<()> {
    self.record(flow);
    Ok(())
  }
}
