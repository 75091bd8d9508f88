//! Traffic interception and modification interface

use crate::message::{Request, Response};

/// Capability for observing and mutating proxied traffic.
///
/// `on_request` runs once per request before it leaves for the origin;
/// `on_response` runs once per final response before it is relayed to the
/// client. Mutations to headers and to the request/status line take effect
/// on the wire. The proxy never starts forwarding a message until the hook
/// call has returned, so implementations should stay fast and must not
/// block on long IO.
#[async_trait::async_trait]
pub trait InterceptionHook: Send + Sync {
  /// Observe and optionally mutate a request before egress
  async fn on_request(&self, request: &mut Request) {
    let _ = request;
  }

  /// Observe and optionally mutate a response before it reaches the client.
  ///
  /// On the plain-HTTP path the originating request is passed back for
  /// correlation; inside a tunnel the two directions are independent and
  /// `request` is `None`.
  async fn on_response(&self, request: Option<&Request>, response: &mut Response) {
    let _ = (request, response);
  }
}

/// Hook that logs request and response lines through `tracing`
pub struct LoggingHook;

#[async_trait::async_trait]
impl InterceptionHook for LoggingHook {
  async fn on_request(&self, request: &mut Request) {
    tracing::info!("[MITM] Request: {} {}", request.method(), request.target());
    for (name, value) in request.headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
  }

  async fn on_response(&self, _request: Option<&Request>, response: &mut Response) {
    tracing::info!("[MITM] Response: {}", response.status());
    for (name, value) in response.headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
  }
}
