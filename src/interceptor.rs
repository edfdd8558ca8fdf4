//! Completed-flow event interface

use crate::error::Result;
use crate::flow::Flow;
use std::sync::Arc;

/// Receives every flow the relay finishes reading
#[async_trait::async_trait]
pub trait FlowInterceptor: Send + Sync {
  /// Called once per complete flow, in completion order per connection
  ///
  /// Returning an error is logged; it neither stops the connection nor the
  /// remaining interceptors.
  async fn on_flow_complete(&self, flow: &Flow) -> Result<()>;
}

/// Fans completed flows out to registered interceptors, in registration order
#[derive(Clone, Default)]
pub struct InterceptorHandler {
  interceptors: Vec<Arc<dyn FlowInterceptor>>,
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an interceptor
  pub fn add_interceptor(&mut self, interceptor: Arc<dyn FlowInterceptor>) {
    self.interceptors.push(interceptor);
  }

  /// Number of registered interceptors
  pub fn len(&self) -> usize {
    self.interceptors.len()
  }

  /// Whether no interceptor is registered
  pub fn is_empty(&self) -> bool {
    self.interceptors.is_empty()
  }

  /// Hand a complete flow to every interceptor
  pub async fn process_flow(&self, flow: &Flow) {
    for interceptor in &self.interceptors {
      if let Err(e) = interceptor.on_flow_complete(flow).await {
        tracing::warn!("interceptor failed on flow {}: {}", flow.id(), e);
      }
    }
  }
}

/// Ready-made interceptors
pub struct Interceptor;

impl Interceptor {
  /// Create a logging interceptor that traces every completed flow
  pub fn logging() -> LoggingInterceptor {
    LoggingInterceptor
  }
}

/// Logging interceptor implementation
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl FlowInterceptor for LoggingInterceptor {
  async fn on_flow_complete(&self, flow: &Flow) -> Result<()> {
    let method = flow.method().map(|m| m.as_str()).unwrap_or("-");
    let url = flow.url().unwrap_or_default();
    let status = flow.response().map(|r| r.status.as_u16()).unwrap_or(0);
    tracing::debug!(
      "[flow {}] {} {} -> {} ({} bytes)",
      flow.id(),
      method,
      url,
      status,
      flow.response_body().total_len()
    );
    if let Some(request) = flow.request() {
      let names: Vec<&str> = request.headers.iter().map(|(k, _)| k).collect();
      tracing::debug!("  request headers: {}", names.join(", "));
    }
    if let Some(response) = flow.response() {
      let names: Vec<&str> = response.headers.iter().map(|(k, _)| k).collect();
      tracing::debug!("  response headers: {}", names.join(", "));
    }
    Ok(())
  }
}
