//! Certificate authority and per-host leaf forging
//!
//! The proxy owns one in-memory root CA for its whole lifetime. Every
//! CONNECT target gets a leaf certificate minted on demand, signed by that
//! CA, and cached per hostname so repeated tunnels to the same site skip
//! the keygen cost.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use moka::future::Cache;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::error::{Error, Result};
use crate::target::strip_port;

/// Certificate validity period (1 year)
const TTL: Duration = Duration::days(365);
/// Offset for not_before timestamps to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: Duration = Duration::seconds(60);
/// Maximum number of cached leaves
const LEAF_CACHE_CAPACITY: u64 = 1_000;
/// File name of the exported CA certificate
pub const CA_CERT_FILE: &str = "ca.crt";

/// Root certificate authority, generated once per process.
///
/// Clients must install the exported PEM in their trust store for the
/// interception to be transparent; without it every CONNECT surfaces as an
/// untrusted-certificate warning on the client.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Generate a fresh in-memory CA
  pub fn new() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Prism Proxy Root CA");
    dn.push(DnType::OrganizationName, "Prism Proxy");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.serial_number = Some(1u64.into());
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TTL;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::crypto_init(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::crypto_init(format!("failed to self-sign CA certificate: {}", e)))?;

    let ca_cert_pem = cert.pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, key_pair)
      .map_err(|e| Error::crypto_init(format!("failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
    })
  }

  /// Write the CA certificate to `<dir>/ca.crt` in PEM format.
  ///
  /// The directory is created (mode 0755 on unix) if it does not exist.
  pub async fn export_pem(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await?;
    }
    let path = dir.join(CA_CERT_FILE);
    tokio::fs::write(&path, self.ca_cert_pem.as_bytes()).await?;
    tracing::info!("CA certificate exported to {}", path.display());
    Ok(path)
  }

  /// CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// A minted leaf certificate, ready to terminate TLS for one hostname
pub struct MintedLeaf {
  leaf_der: CertificateDer<'static>,
  server_config: Arc<ServerConfig>,
}

impl MintedLeaf {
  /// The leaf certificate in DER format
  pub fn certificate_der(&self) -> &CertificateDer<'static> {
    &self.leaf_der
  }

  /// TLS server configuration presenting this leaf with the CA chained,
  /// ALPN restricted to `http/1.1`
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Mints and caches per-host leaf certificates signed by the CA.
///
/// Lookups for the same hostname are coalesced, so concurrent CONNECTs to
/// one site trigger at most one mint.
pub struct LeafForge {
  authority: Arc<CertificateAuthority>,
  cache: Cache<String, Arc<MintedLeaf>>,
  serial_seq: AtomicU64,
}

impl LeafForge {
  /// Create a forge backed by the given authority
  pub fn new(authority: Arc<CertificateAuthority>) -> Self {
    let cache = Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build();
    Self {
      authority,
      cache,
      serial_seq: AtomicU64::new(0),
    }
  }

  /// Get or mint a leaf certificate for the given host.
  ///
  /// An optional `:port` suffix (including the bracketed IPv6 form) is
  /// stripped before minting; certificate fields never carry ports or
  /// brackets.
  pub async fn obtain(&self, host: &str) -> Result<Arc<MintedLeaf>> {
    let hostname = strip_port(host).to_ascii_lowercase();
    self
      .cache
      .try_get_with(hostname.clone(), async {
        self.mint(&hostname).map(Arc::new)
      })
      .await
      .map_err(|e: Arc<Error>| reissue_error(&e))
  }

  fn mint(&self, hostname: &str) -> Result<MintedLeaf> {
    tracing::debug!("minting leaf certificate for {}", hostname);
    let mut params = CertificateParams::default();

    params.serial_number = Some(self.next_serial().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP targets get an iPAddress SAN; some clients also accept a dNSName
    // with the textual IP, so include both for compatibility
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::bad_host(format!("invalid domain name: {}", hostname))
      })?)]
    };

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + TTL;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::crypto_init(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.authority.issuer)
      .map_err(|e| Error::crypto_sign(format!("failed to sign leaf for {}: {}", hostname, e)))?;

    let leaf_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::crypto_init("failed to serialize leaf key".to_string()))?;

    // chain: [leaf, ca]
    let chain = vec![leaf_der.clone(), self.authority.ca_cert_der.clone()];
    let mut server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key_der)
      .map_err(|e| Error::crypto_init(format!("failed to build TLS server config: {}", e)))?;
    // modern clients negotiate h2 when offered; the tunnel parses HTTP/1.1,
    // so the leaf advertises only http/1.1 to force the downgrade
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(MintedLeaf {
      leaf_der,
      server_config: Arc::new(server_config),
    })
  }

  /// Serial numbers derive from wall-clock milliseconds with a sequence
  /// counter mixed in, keeping them unique within the process
  fn next_serial(&self) -> u64 {
    let millis = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or(0);
    let seq = self.serial_seq.fetch_add(1, Ordering::Relaxed);
    (millis << 16) | (seq & 0xFFFF)
  }
}

/// Rebuild a mint error out of the shared reference moka hands back when a
/// coalesced mint fails
fn reissue_error(e: &Error) -> Error {
  match e {
    Error::CryptoInit(msg) => Error::CryptoInit(msg.clone()),
    Error::CryptoSign(msg) => Error::CryptoSign(msg.clone()),
    Error::BadHost(msg) => Error::BadHost(msg.clone()),
    other => Error::CryptoSign(other.to_string()),
  }
}
