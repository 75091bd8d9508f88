//! HTTPS interception tunnel
//!
//! On CONNECT the client socket is acknowledged, then both legs are wrapped
//! in TLS: the client side terminates against a leaf forged for the target
//! hostname, the origin side dials out with verification disabled. Inside
//! the decrypted channel two directions relay parsed HTTP/1.1 messages
//! through the interception hook.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::codec::{self, BufferedStream};
use crate::error::{Error, Result};
use crate::server::SessionContext;
use crate::target::parse_authority;

/// Run one CONNECT session to completion.
///
/// `authority` is the CONNECT request-target (`host:port`); bytes the
/// dispatcher over-read are still buffered in `client` and replay into the
/// TLS handshake.
pub(crate) async fn run<S>(
  mut client: BufferedStream<S>,
  authority: &str,
  ctx: &SessionContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let target = parse_authority(authority, 443);
  tracing::debug!("CONNECT tunnel to {}:{}", target.host, target.port);

  // acknowledge; from here the socket is a raw byte pipe owned by this
  // session
  client
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client.flush().await?;

  // dial the origin and mint the leaf in parallel
  let dial = async {
    timeout(
      ctx.io_timeout,
      TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
      Error::upstream_dial(format!(
        "timed out connecting to {}:{}",
        target.host, target.port
      ))
    })?
    .map_err(|e| {
      Error::upstream_dial(format!(
        "failed to connect to {}:{}: {}",
        target.host, target.port, e
      ))
    })
  };
  let (origin, leaf) = tokio::join!(dial, ctx.forge.obtain(&target.host));
  let origin = origin?;
  let leaf = leaf?;

  // TLS on both legs; either handshake failing aborts the session
  let acceptor = tokio_rustls::TlsAcceptor::from(leaf.server_config());
  let client_tls = timeout(ctx.io_timeout, acceptor.accept(client))
    .await
    .map_err(|_| Error::tls_handshake("client handshake timed out".to_string()))?
    .map_err(|e| Error::tls_handshake(format!("client handshake failed: {}", e)))?;

  let server_name = ServerName::try_from(target.host.clone())
    .map_err(|_| Error::bad_host(format!("invalid TLS server name: {}", target.host)))?;
  let origin_tls = timeout(
    ctx.io_timeout,
    ctx.origin_connector.connect(server_name, origin),
  )
  .await
  .map_err(|_| Error::tls_handshake("origin handshake timed out".to_string()))?
  .map_err(|e| {
    Error::tls_handshake(format!("origin handshake with {} failed: {}", target.host, e))
  })?;

  let (client_read, mut client_write) = tokio::io::split(client_tls);
  let (origin_read, mut origin_write) = tokio::io::split(origin_tls);
  let mut client_read = BufferedStream::new(client_read);
  let mut origin_read = BufferedStream::new(origin_read);

  let requests = async {
    loop {
      let Some(mut request) = codec::read_request(&mut client_read).await? else {
        break;
      };
      if let Some(hook) = &ctx.hook {
        hook.on_request(&mut request).await;
      }
      timeout(ctx.io_timeout, codec::write_request(&mut origin_write, &request))
        .await
        .map_err(|_| Error::upstream_io("timed out writing request to origin"))??;
      tracing::debug!("tunneled request {} {}", request.method(), request.target());
    }
    Ok::<(), Error>(())
  };

  let responses = async {
    loop {
      let Some(mut response) = codec::read_response(&mut origin_read).await? else {
        break;
      };
      // interim 1xx responses pass through untouched; the hook sees finals
      if !response.status().is_informational() {
        if let Some(hook) = &ctx.hook {
          hook.on_response(None, &mut response).await;
        }
      }
      timeout(ctx.io_timeout, codec::write_response(&mut client_write, &response))
        .await
        .map_err(|_| Error::Io(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          "timed out writing response to client",
        )))??;
      tracing::debug!("tunneled response {}", response.status());
    }
    Ok::<(), Error>(())
  };

  // either direction ending, cleanly or not, tears down the whole session
  tokio::select! {
    result = requests => result,
    result = responses => result,
  }
}

/// TLS client configuration for the origin leg.
///
/// Certificate verification is disabled so upstream certificate problems do
/// not break interception; the trade-off is that origin TLS failures are
/// invisible to the client.
pub(crate) fn origin_tls_connector() -> TlsConnector {
  let mut config = ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
