//! MITM proxy with traffic modification
//!
//! Demonstrates a custom hook that tags every request and response with
//! marker headers before they are forwarded.
//!
//! To run:
//! ```bash
//! cargo run --example inject_headers
//! ```

use async_trait::async_trait;
use http::HeaderValue;
use prism_proxy::{InterceptionHook, MitmProxy, ProxyConfig, Request, Response};
use std::sync::Arc;

struct TaggingHook;

#[async_trait]
impl InterceptionHook for TaggingHook {
  async fn on_request(&self, request: &mut Request) {
    println!("-> {} {}", request.method(), request.target());
    request
      .headers_mut()
      .insert("x-mitm-proxy", HeaderValue::from_static("true"));
    if request.target().contains("/api/") {
      request
        .headers_mut()
        .insert("x-api-modified", HeaderValue::from_static("true"));
    }
  }

  async fn on_response(&self, _request: Option<&Request>, response: &mut Response) {
    println!("<- {}", response.status());
    response
      .headers_mut()
      .insert("x-mitm-intercepted", HeaderValue::from_static("true"));
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt().init();

  let proxy = MitmProxy::new(ProxyConfig::default())?.with_hook(Arc::new(TaggingHook));

  println!("Starting MITM proxy on 127.0.0.1:8080");
  println!("CA certificate: {}\n", proxy.ca_cert_path().display());

  proxy.start().await?;
  Ok(())
}
