//! Proxy configuration and main proxy implementation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::ca::{CertificateAuthority, LeafForge, CA_CERT_FILE};
use crate::error::Result;
use crate::hook::InterceptionHook;
use crate::server::{ProxyServer, SessionContext};
use crate::tunnel;

/// Configuration for the MITM proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address to listen on
  pub listen_addr: String,
  /// Directory the CA certificate is exported to on startup
  pub cert_dir: PathBuf,
  /// Deadline in seconds applied to dials, handshakes and message IO
  pub connection_timeout: u64,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      cert_dir: PathBuf::from("./certs"),
      connection_timeout: 30,
    }
  }
}

/// MITM proxy main struct
pub struct MitmProxy {
  config: ProxyConfig,
  authority: Arc<CertificateAuthority>,
  forge: Arc<LeafForge>,
  hook: Option<Arc<dyn InterceptionHook>>,
}

impl MitmProxy {
  /// Create a new proxy with the given configuration.
  ///
  /// The CA keypair is generated here; a failure is fatal to construction.
  pub fn new(config: ProxyConfig) -> Result<Self> {
    let authority = Arc::new(CertificateAuthority::new()?);
    let forge = Arc::new(LeafForge::new(authority.clone()));
    Ok(Self {
      config,
      authority,
      forge,
      hook: None,
    })
  }

  /// Attach the interception hook.
  ///
  /// The hook observes every request before egress and every final response
  /// before it is relayed; without one the proxy relays traffic unchanged.
  pub fn with_hook(mut self, hook: Arc<dyn InterceptionHook>) -> Self {
    self.hook = Some(hook);
    self
  }

  /// CA certificate in PEM format, for installation in client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    self.authority.ca_cert_pem()
  }

  /// CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.authority.ca_cert_der()
  }

  /// Path the CA certificate is exported to on startup
  pub fn ca_cert_path(&self) -> PathBuf {
    self.config.cert_dir.join(CA_CERT_FILE)
  }

  /// Export the CA certificate and bind the listener.
  ///
  /// Useful when the caller needs the bound address before serving.
  pub async fn bind(&self) -> Result<ProxyServer> {
    self.authority.export_pem(&self.config.cert_dir).await?;
    let ctx = Arc::new(SessionContext {
      forge: self.forge.clone(),
      hook: self.hook.clone(),
      io_timeout: Duration::from_secs(self.config.connection_timeout),
      origin_connector: tunnel::origin_tls_connector(),
    });
    ProxyServer::bind(&self.config.listen_addr, ctx).await
  }

  /// Start the proxy on the configured address
  pub async fn start(&self) -> Result<()> {
    self.bind().await?.serve().await
  }
}
