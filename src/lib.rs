//! Intercepting HTTP/HTTPS forward proxy
//!
//! Clients configure this proxy as their upstream proxy. Plain HTTP
//! requests are parsed, optionally rewritten, and reissued to their
//! origins. HTTPS connections are intercepted: the CONNECT tunnel is
//! terminated with a leaf certificate forged on demand and signed by a
//! process-local CA, a second TLS session is opened to the origin, and the
//! decrypted HTTP/1.1 traffic inside is relayed through a user-supplied
//! interception hook that can observe and mutate every request and
//! response.
//!
//! The CA certificate is exported to `<cert_dir>/ca.crt` on startup;
//! install it in the client's trust store to intercept transparently.
//!
//! # Example
//!
//! ```no_run
//! use prism_proxy::{LoggingHook, MitmProxy, ProxyConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(ProxyConfig::default())?.with_hook(Arc::new(LoggingHook));
//!   proxy.start().await?;
//!   Ok(())
//! }
//! ```

mod ca;
mod codec;
mod error;
mod forwarder;
mod hook;
mod message;
mod proxy;
mod server;
mod target;
mod tunnel;

pub use ca::{CertificateAuthority, LeafForge, MintedLeaf, CA_CERT_FILE};
pub use error::{Error, Result};
pub use hook::{InterceptionHook, LoggingHook};
pub use message::{Request, Response};
pub use proxy::{MitmProxy, ProxyConfig};
pub use server::ProxyServer;
pub use target::strip_port;
