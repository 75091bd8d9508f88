//! Logging MITM proxy
//!
//! Starts the proxy with a hook that logs every intercepted request and
//! response line.
//!
//! To run:
//! ```bash
//! cargo run --example logging_proxy
//! ```
//!
//! Then configure your browser to use the proxy at 127.0.0.1:8080 and
//! install the CA certificate from ./certs/ca.crt

use prism_proxy::{LoggingHook, MitmProxy, ProxyConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let config = ProxyConfig::default();
  let proxy = MitmProxy::new(config)?.with_hook(Arc::new(LoggingHook));

  println!("Starting MITM proxy on 127.0.0.1:8080");
  println!("CA certificate: {}", proxy.ca_cert_path().display());
  println!("1. Configure your browser to use HTTP proxy 127.0.0.1:8080");
  println!("2. Install the CA certificate in your browser/system");
  println!("3. Visit any HTTP/HTTPS website\n");

  proxy.start().await?;
  Ok(())
}
