//! Proxy server: accept loop and first-request dispatch

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use crate::ca::LeafForge;
use crate::codec::{self, BufferedStream};
use crate::error::{Error, Result};
use crate::hook::InterceptionHook;
use crate::{forwarder, tunnel};

/// Shared state every session needs
pub(crate) struct SessionContext {
  pub(crate) forge: Arc<LeafForge>,
  pub(crate) hook: Option<Arc<dyn InterceptionHook>>,
  pub(crate) io_timeout: Duration,
  pub(crate) origin_connector: TlsConnector,
}

/// Bound proxy listener
pub struct ProxyServer {
  listener: TcpListener,
  ctx: Arc<SessionContext>,
}

impl ProxyServer {
  pub(crate) async fn bind(addr: &str, ctx: Arc<SessionContext>) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::startup(format!("failed to bind to {}: {}", addr, e)))?;
    Ok(Self { listener, ctx })
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.listener.local_addr().map_err(Error::from)
  }

  /// Accept connections until the future is dropped.
  ///
  /// Each connection runs as its own task; a failing session is logged and
  /// never stops the accept loop. Dropping this future stops new sessions
  /// while in-flight ones drain to their own deadlines.
  pub async fn serve(&self) -> Result<()> {
    tracing::info!("proxy listening on {}", self.local_addr()?);
    loop {
      match self.listener.accept().await {
        Ok((stream, peer_addr)) => {
          let ctx = self.ctx.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, ctx).await {
              tracing::error!("[MITM] error handling connection from {}: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[MITM] failed to accept connection: {}", e);
        }
      }
    }
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer_addr: SocketAddr,
  ctx: Arc<SessionContext>,
) -> Result<()> {
  tracing::debug!("accepted connection from {}", peer_addr);
  let mut client = BufferedStream::new(stream);

  let request = match codec::read_request(&mut client).await {
    Ok(Some(request)) => request,
    // closed without sending anything
    Ok(None) => return Ok(()),
    Err(e) => {
      if matches!(e, Error::InvalidRequest(_)) {
        let _ = codec::write_plaintext_response(
          &mut client,
          StatusCode::BAD_REQUEST,
          "malformed request\n",
        )
        .await;
      }
      return Err(e);
    }
  };

  if *request.method() == Method::CONNECT {
    tunnel::run(client, request.target(), &ctx).await
  } else {
    forwarder::forward(request, &mut client, &ctx).await
  }
}
