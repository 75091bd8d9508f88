//! End-to-end tests: plain forwarding, header injection, failure surfacing
//! and the full CONNECT interception path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderValue;
use prism_proxy::{InterceptionHook, MitmProxy, ProxyConfig, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Hook that counts invocations and tags both directions
struct TaggingHook {
  requests: AtomicUsize,
  responses: AtomicUsize,
}

impl TaggingHook {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      requests: AtomicUsize::new(0),
      responses: AtomicUsize::new(0),
    })
  }
}

#[async_trait]
impl InterceptionHook for TaggingHook {
  async fn on_request(&self, request: &mut Request) {
    self.requests.fetch_add(1, Ordering::SeqCst);
    request
      .headers_mut()
      .insert("x-mitm-proxy", HeaderValue::from_static("true"));
  }

  async fn on_response(&self, _request: Option<&Request>, response: &mut Response) {
    self.responses.fetch_add(1, Ordering::SeqCst);
    response
      .headers_mut()
      .insert("x-mitm-intercepted", HeaderValue::from_static("true"));
  }
}

fn mock_response(request_head: &str) -> String {
  // echo the injected request header back so tests can observe it
  let seen = request_head
    .lines()
    .find_map(|line| {
      let (name, value) = line.split_once(':')?;
      name
        .trim()
        .eq_ignore_ascii_case("x-mitm-proxy")
        .then(|| value.trim().to_string())
    })
    .unwrap_or_default();
  let body = "Hello from target server";
  format!(
    "HTTP/1.1 200 OK\r\nX-Mock-Header: mockValue\r\nX-Proxy-Seen: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    seen,
    body.len(),
    body
  )
}

async fn read_head(stream: &mut (impl AsyncReadExt + Unpin)) -> Option<Vec<u8>> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 4096];
  loop {
    let n = stream.read(&mut chunk).await.ok()?;
    if n == 0 {
      return None;
    }
    buf.extend_from_slice(&chunk[..n]);
    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
      return Some(buf);
    }
  }
}

/// Plain-HTTP origin used behind the forwarder
async fn spawn_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let Some(head) = read_head(&mut stream).await else {
          return;
        };
        let response = mock_response(&String::from_utf8_lossy(&head));
        let _ = stream.write_all(response.as_bytes()).await;
      });
    }
  });
  addr
}

/// TLS origin used behind the interception tunnel
async fn spawn_tls_origin() -> SocketAddr {
  let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
  params
    .subject_alt_names
    .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
  let key_pair = rcgen::KeyPair::generate().unwrap();
  let cert = params.self_signed(&key_pair).unwrap();
  let chain = vec![tokio_rustls::rustls::pki_types::CertificateDer::from(
    cert.der().to_vec(),
  )];
  let key = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        let Some(head) = read_head(&mut tls).await else {
          return;
        };
        let seen = String::from_utf8_lossy(&head)
          .lines()
          .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name
              .trim()
              .eq_ignore_ascii_case("x-mitm-proxy")
              .then(|| value.trim().to_string())
          })
          .unwrap_or_default();
        let body = r#"{"message":"ok"}"#;
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-Proxy-Seen: {}\r\nContent-Length: {}\r\n\r\n{}",
          seen,
          body.len(),
          body
        );
        let _ = tls.write_all(response.as_bytes()).await;
        let _ = tls.flush().await;
        // close_notify so the tunnel sees a clean EOF
        let _ = tls.shutdown().await;
      });
    }
  });
  addr
}

static CERT_DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

async fn spawn_proxy(hook: Arc<dyn InterceptionHook>) -> (MitmProxy, SocketAddr, JoinHandle<()>) {
  let config = ProxyConfig {
    listen_addr: "127.0.0.1:0".to_string(),
    cert_dir: std::env::temp_dir().join(format!(
      "prism-proxy-e2e-{}-{}",
      std::process::id(),
      CERT_DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    )),
    connection_timeout: 10,
  };
  let proxy = MitmProxy::new(config).unwrap().with_hook(hook);
  let server = proxy.bind().await.unwrap();
  let addr = server.local_addr().unwrap();
  let handle = tokio::spawn(async move {
    let _ = server.serve().await;
  });
  (proxy, addr, handle)
}

/// One-shot exchange over the proxy: send raw bytes, read until close
async fn roundtrip(proxy_addr: SocketAddr, raw: String) -> String {
  let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn plain_get_is_forwarded_byte_for_byte() {
  let origin = spawn_origin().await;
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook.clone()).await;

  let response = roundtrip(
    addr,
    format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.to_ascii_lowercase().contains("x-mock-header: mockvalue"));
  assert!(response.ends_with("Hello from target server"));
  assert_eq!(hook.requests.load(Ordering::SeqCst), 1);
  assert_eq!(hook.responses.load(Ordering::SeqCst), 1);

  server.abort();
}

#[tokio::test]
async fn origin_form_request_synthesizes_target_from_host_header() {
  let origin = spawn_origin().await;
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook).await;

  let response = roundtrip(addr, format!("GET / HTTP/1.1\r\nHost: {origin}\r\n\r\n")).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("Hello from target server"));

  server.abort();
}

#[tokio::test]
async fn hook_mutations_reach_both_directions() {
  let origin = spawn_origin().await;
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook).await;

  let response = roundtrip(
    addr,
    format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
  )
  .await;

  let lower = response.to_ascii_lowercase();
  // the origin saw the injected request header and echoed it back
  assert!(lower.contains("x-proxy-seen: true"));
  // the response was tagged on its way back
  assert!(lower.contains("x-mitm-intercepted: true"));

  server.abort();
}

#[tokio::test]
async fn unreachable_origin_surfaces_as_500() {
  // bind and drop to find a port that refuses connections
  let dead = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook).await;

  let response = roundtrip(
    addr,
    format!("GET http://{dead}/ HTTP/1.1\r\nHost: {dead}\r\n\r\n"),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
  assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
  let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
  assert!(!body.is_empty());

  server.abort();
}

#[tokio::test]
async fn malformed_first_request_surfaces_as_400() {
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(b"completely not http\0\r\n\r\n").await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 400 Bad Request\r\n"));

  server.abort();
}

#[tokio::test]
async fn connect_tunnel_intercepts_https_traffic() {
  let origin = spawn_tls_origin().await;
  let hook = TaggingHook::new();
  let (proxy, addr, server) = spawn_proxy(hook.clone()).await;

  // open the tunnel
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let ack = read_head(&mut stream).await.expect("CONNECT ack");
  assert!(String::from_utf8_lossy(&ack).starts_with("HTTP/1.1 200"));

  // client trusts only the proxy CA; a completed handshake proves the
  // forged chain verifies against it
  let mut roots = RootCertStore::empty();
  roots.add(proxy.ca_cert_der().clone()).unwrap();
  let mut config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  // offer h2 to confirm the leaf forces the HTTP/1.1 downgrade
  config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
  let connector = TlsConnector::from(Arc::new(config));
  let server_name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(server_name, stream).await.unwrap();
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(b"http/1.1".as_ref()));

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();

  let head = read_head(&mut tls).await.expect("inner response");
  let text = String::from_utf8_lossy(&head).into_owned();
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  let lower = text.to_ascii_lowercase();
  assert!(lower.contains("x-proxy-seen: true"));
  assert!(lower.contains("x-mitm-intercepted: true"));

  // the head reader may have pulled part of the body already
  let header_end = text.find("\r\n\r\n").unwrap() + 4;
  let mut body = text[header_end..].as_bytes().to_vec();
  let expected = br#"{"message":"ok"}"#;
  while body.len() < expected.len() {
    let mut chunk = [0u8; 256];
    let n = tls.read(&mut chunk).await.unwrap();
    assert!(n > 0, "stream closed before body completed");
    body.extend_from_slice(&chunk[..n]);
  }
  assert_eq!(&body[..], expected);

  assert!(hook.requests.load(Ordering::SeqCst) >= 1);
  assert!(hook.responses.load(Ordering::SeqCst) >= 1);

  server.abort();
}

#[tokio::test]
async fn connect_to_unreachable_origin_drops_the_tunnel() {
  let dead = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let hook = TaggingHook::new();
  let (_proxy, addr, server) = spawn_proxy(hook).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(format!("CONNECT {dead} HTTP/1.1\r\nHost: {dead}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let ack = read_head(&mut stream).await.expect("CONNECT ack");
  assert!(String::from_utf8_lossy(&ack).starts_with("HTTP/1.1 200"));

  // the session aborts without a TLS handshake; the client just sees the
  // tunnel close
  let mut chunk = [0u8; 64];
  match stream.read(&mut chunk).await {
    Ok(0) | Err(_) => {}
    Ok(n) => panic!("unexpected bytes after failed dial: {:?}", &chunk[..n]),
  }

  server.abort();
}
