//! Parsed HTTP/1.1 messages as seen and mutated by interception hooks

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};

/// How a message body was delimited on the wire.
///
/// Recorded at parse time and honored again at serialization time so the
/// relayed message keeps a framing the receiving side can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  /// No body at all
  Empty,
  /// `Content-Length` delimited
  ContentLength,
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Body runs until the peer closes (responses only)
  CloseDelimited,
}

/// An intercepted HTTP request.
///
/// Hooks receive `&mut Request` and may rewrite the method, the
/// request-target and the header map before the bytes leave the proxy.
/// Duplicate headers are preserved with their per-name ordering.
#[derive(Debug, Clone)]
pub struct Request {
  method: Method,
  target: String,
  version: Version,
  headers: HeaderMap,
  body: Bytes,
  framing: BodyFraming,
}

impl Request {
  pub(crate) fn new(
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    framing: BodyFraming,
  ) -> Self {
    Self {
      method,
      target,
      version,
      headers,
      body,
      framing,
    }
  }

  /// Request method
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Replace the request method
  pub fn set_method(&mut self, method: Method) {
    self.method = method;
  }

  /// The request-target exactly as it will appear on the request line
  pub fn target(&self) -> &str {
    &self.target
  }

  /// Replace the request-target
  pub fn set_target(&mut self, target: impl Into<String>) {
    self.target = target.into();
  }

  /// HTTP version of the message
  pub fn version(&self) -> Version {
    self.version
  }

  /// Request headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Mutable request headers
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Buffered request body
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  pub(crate) fn framing(&self) -> BodyFraming {
    self.framing
  }
}

/// An intercepted HTTP response.
///
/// Hooks receive `&mut Response` and may rewrite the status and the header
/// map before the bytes are relayed to the client.
#[derive(Debug, Clone)]
pub struct Response {
  version: Version,
  status: StatusCode,
  reason: String,
  headers: HeaderMap,
  body: Bytes,
  framing: BodyFraming,
}

impl Response {
  pub(crate) fn new(
    version: Version,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
    framing: BodyFraming,
  ) -> Self {
    Self {
      version,
      status,
      reason,
      headers,
      body,
      framing,
    }
  }

  /// HTTP version of the message
  pub fn version(&self) -> Version {
    self.version
  }

  /// Response status code
  pub fn status(&self) -> StatusCode {
    self.status
  }

  /// Replace the status code. The reason phrase is re-derived from the code.
  pub fn set_status(&mut self, status: StatusCode) {
    self.status = status;
    self.reason = status.canonical_reason().unwrap_or_default().to_string();
  }

  /// Reason phrase as received from the origin
  pub fn reason(&self) -> &str {
    &self.reason
  }

  /// Response headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Mutable response headers
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Buffered response body
  pub fn body(&self) -> &Bytes {
    &self.body
  }

  pub(crate) fn framing(&self) -> BodyFraming {
    self.framing
  }
}
