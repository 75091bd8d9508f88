//! Plain-HTTP forwarding
//!
//! Requests are reissued to the origin rather than byte-spliced, which is
//! what lets the hook mutate headers and the target without touching wire
//! parsing itself.

use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use http::{StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::{self, BufferedStream};
use crate::error::{Error, Result};
use crate::message::Request;
use crate::server::SessionContext;

/// Forward one plain-HTTP request to its origin and relay the response.
///
/// Failures to construct, dial or complete the exchange surface to the
/// client as a short plain-text 500.
pub(crate) async fn forward<S>(
  request: Request,
  client: &mut BufferedStream<S>,
  ctx: &SessionContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match forward_inner(request, client, ctx).await {
    Ok(()) => Ok(()),
    Err(e) => {
      let _ = codec::write_plaintext_response(
        client,
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("proxy: {}\n", e),
      )
      .await;
      Err(e)
    }
  }
}

async fn forward_inner<S>(
  mut request: Request,
  client: &mut BufferedStream<S>,
  ctx: &SessionContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // origin-form targets synthesize an absolute URL from the Host header
  if !request.target().starts_with("http://") && !request.target().starts_with("https://") {
    let host = request
      .headers()
      .get(HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::invalid_request("origin-form request without Host header"))?
      .to_string();
    let target = format!("http://{}{}", host, request.target());
    request.set_target(target);
  }

  // hop-by-hop proxy headers stop here; outer connections are one-shot
  request.headers_mut().remove(PROXY_AUTHORIZATION);
  request
    .headers_mut()
    .remove(HeaderName::from_static("proxy-connection"));
  request
    .headers_mut()
    .insert(CONNECTION, HeaderValue::from_static("close"));

  if let Some(hook) = &ctx.hook {
    hook.on_request(&mut request).await;
  }

  // the hook may have rewritten the target; the dial address follows it
  let uri: Uri = request.target().parse().map_err(|_| {
    Error::invalid_request(format!("unconstructible target URL: {}", request.target()))
  })?;
  // Uri::host keeps the brackets on IPv6 literals; the dial must not
  let host = uri
    .host()
    .ok_or_else(|| Error::invalid_request("target URL has no host"))?
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_string();
  let port = uri.port_u16().unwrap_or(80);
  let authority = uri
    .authority()
    .map(|a| a.as_str().to_string())
    .unwrap_or_else(|| host.clone());
  let origin_form = uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());

  let origin = timeout(ctx.io_timeout, TcpStream::connect((host.as_str(), port)))
    .await
    .map_err(|_| Error::upstream_dial(format!("timed out connecting to {}:{}", host, port)))?
    .map_err(|e| Error::upstream_dial(format!("failed to connect to {}:{}: {}", host, port, e)))?;
  let mut origin = BufferedStream::new(origin);

  // reissue in origin-form with a Host header matching the target
  request.set_target(origin_form);
  let host_value = HeaderValue::from_str(&authority)
    .map_err(|_| Error::invalid_request(format!("unusable authority: {}", authority)))?;
  request.headers_mut().insert(HOST, host_value);

  timeout(ctx.io_timeout, codec::write_request(&mut origin, &request))
    .await
    .map_err(|_| Error::upstream_io("timed out writing request to origin"))??;

  let mut response = timeout(ctx.io_timeout, codec::read_response(&mut origin))
    .await
    .map_err(|_| Error::upstream_io("timed out reading origin response"))??
    .ok_or_else(|| Error::upstream_io("origin closed without a response"))?;

  if let Some(hook) = &ctx.hook {
    hook.on_response(Some(&request), &mut response).await;
  }

  codec::write_response(client, &response).await?;
  tracing::debug!(
    "forwarded {} {} -> {}",
    request.method(),
    request.target(),
    response.status()
  );
  Ok(())
}
