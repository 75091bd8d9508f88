//! HTTP/1.1 wire codec for the intercepted streams
//!
//! Both tunnel directions and the plain forwarder parse whole messages here,
//! hand them to the interception hook, and re-serialize them. Messages are
//! buffered in full before the hook runs, so nothing is forwarded until the
//! hook has returned.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::message::{BodyFraming, Request, Response};

/// Upper bound for a message head (request/status line plus headers)
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Upper bound for a buffered message body
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
/// Header count limit for httparse
const MAX_HEADERS: usize = 100;

/// Which peer a stream talks to; decides the error flavor for malformed input
#[derive(Debug, Clone, Copy)]
pub(crate) enum Side {
  Client,
  Origin,
}

impl Side {
  fn error(self, msg: impl Into<String>) -> Error {
    match self {
      Side::Client => Error::invalid_request(msg),
      Side::Origin => Error::upstream_io(msg),
    }
  }
}

/// A stream with a replay buffer in front of it.
///
/// The codec reads ahead in chunks, so bytes past the end of a parsed
/// message land in `buf` and are served back out first — both to later
/// codec calls and to anyone using the stream directly (the TLS acceptor
/// after a CONNECT).
pub(crate) struct BufferedStream<S> {
  inner: S,
  buf: Vec<u8>,
}

impl<S> BufferedStream<S> {
  pub(crate) fn new(inner: S) -> Self {
    Self {
      inner,
      buf: Vec::new(),
    }
  }

  /// Remove and return the first `n` buffered bytes
  fn take_prefix(&mut self, n: usize) -> Vec<u8> {
    let tail = self.buf.split_off(n);
    std::mem::replace(&mut self.buf, tail)
  }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
  /// Read more bytes from the underlying stream into the buffer.
  /// Returns the number of bytes read; 0 means EOF.
  async fn fill(&mut self) -> io::Result<usize> {
    self.inner.read_buf(&mut self.buf).await
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    out: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.buf.is_empty() {
      let n = out.remaining().min(this.buf.len());
      out.put_slice(&this.buf[..n]);
      this.buf.drain(..n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, out)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    data: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// Read one HTTP request from the stream.
///
/// Returns `Ok(None)` on a clean EOF before any byte of a new message.
pub(crate) async fn read_request<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
) -> Result<Option<Request>> {
  let side = Side::Client;
  let head_end = match read_head(stream, side, |buf| {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf) {
      Ok(httparse::Status::Complete(n)) => Ok(Some(n)),
      Ok(httparse::Status::Partial) => Ok(None),
      Err(e) => Err(side.error(format!("malformed request head: {}", e))),
    }
  })
  .await?
  {
    Some(n) => n,
    None => return Ok(None),
  };

  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut parsed = httparse::Request::new(&mut headers);
  parsed
    .parse(&stream.buf[..head_end])
    .map_err(|e| side.error(format!("malformed request head: {}", e)))?;

  let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
    .map_err(|_| side.error("unrecognized method"))?;
  let target = parsed.path.unwrap_or("/").to_string();
  let version = http_version(parsed.version);
  let header_map = collect_headers(parsed.headers, side)?;
  stream.take_prefix(head_end);

  let plan = request_framing(&header_map, side)?;
  let body = read_body(stream, plan, side).await?;
  let framing = framing_kind(plan);

  Ok(Some(Request::new(
    method, target, version, header_map, body, framing,
  )))
}

/// Read one HTTP response from the stream.
///
/// Returns `Ok(None)` on a clean EOF before any byte of a new message.
pub(crate) async fn read_response<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
) -> Result<Option<Response>> {
  let side = Side::Origin;
  let head_end = match read_head(stream, side, |buf| {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(buf) {
      Ok(httparse::Status::Complete(n)) => Ok(Some(n)),
      Ok(httparse::Status::Partial) => Ok(None),
      Err(e) => Err(side.error(format!("malformed response head: {}", e))),
    }
  })
  .await?
  {
    Some(n) => n,
    None => return Ok(None),
  };

  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut parsed = httparse::Response::new(&mut headers);
  parsed
    .parse(&stream.buf[..head_end])
    .map_err(|e| side.error(format!("malformed response head: {}", e)))?;

  let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
    .map_err(|_| side.error("unrecognized status code"))?;
  let reason = parsed.reason.unwrap_or("").to_string();
  let version = http_version(parsed.version);
  let header_map = collect_headers(parsed.headers, side)?;
  stream.take_prefix(head_end);

  let plan = response_framing(status, &header_map, side)?;
  let body = read_body(stream, plan, side).await?;
  let framing = framing_kind(plan);

  Ok(Some(Response::new(
    version, status, reason, header_map, body, framing,
  )))
}

/// Serialize a request onto the writer
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(
  writer: &mut W,
  request: &Request,
) -> Result<()> {
  let mut buf = Vec::with_capacity(256 + request.body().len());
  buf.extend_from_slice(
    format!(
      "{} {} {}\r\n",
      request.method(),
      request.target(),
      version_text(request.version())
    )
    .as_bytes(),
  );
  encode_headers(&mut buf, request.headers(), request.framing(), request.body().len());
  encode_body(&mut buf, request.framing(), request.body());
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Serialize a response onto the writer
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  response: &Response,
) -> Result<()> {
  let mut buf = Vec::with_capacity(256 + response.body().len());
  let reason = if response.reason().is_empty() {
    response.status().canonical_reason().unwrap_or("")
  } else {
    response.reason()
  };
  buf.extend_from_slice(
    format!(
      "{} {} {}\r\n",
      version_text(response.version()),
      response.status().as_u16(),
      reason
    )
    .as_bytes(),
  );
  encode_headers(&mut buf, response.headers(), response.framing(), response.body().len());
  encode_body(&mut buf, response.framing(), response.body());
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Write a short synthesized plain-text response (proxy-generated errors)
pub(crate) async fn write_plaintext_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
  body: &str,
) -> Result<()> {
  let response = format!(
    "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
    status.as_u16(),
    status.canonical_reason().unwrap_or(""),
    body.len(),
    body
  );
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// Accumulate bytes until `parse_head` reports a complete head, then return
/// the head length. `Ok(None)` when EOF arrives before any byte.
async fn read_head<S, F>(
  stream: &mut BufferedStream<S>,
  side: Side,
  parse_head: F,
) -> Result<Option<usize>>
where
  S: AsyncRead + Unpin,
  F: Fn(&[u8]) -> Result<Option<usize>>,
{
  loop {
    if !stream.buf.is_empty() {
      if let Some(n) = parse_head(&stream.buf)? {
        return Ok(Some(n));
      }
    }
    if stream.buf.len() > MAX_HEAD_BYTES {
      return Err(side.error("message head exceeds maximum size"));
    }
    if stream.fill().await? == 0 {
      if stream.buf.is_empty() {
        return Ok(None);
      }
      return Err(side.error("connection closed mid message head"));
    }
  }
}

fn http_version(raw: Option<u8>) -> Version {
  match raw {
    Some(0) => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

fn version_text(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

fn collect_headers(parsed: &[httparse::Header<'_>], side: Side) -> Result<HeaderMap> {
  let mut map = HeaderMap::new();
  for header in parsed.iter().take_while(|h| *h != &httparse::EMPTY_HEADER) {
    let name = HeaderName::from_bytes(header.name.as_bytes())
      .map_err(|_| side.error(format!("invalid header name: {}", header.name)))?;
    let value = HeaderValue::from_bytes(header.value)
      .map_err(|_| side.error(format!("invalid value for header {}", header.name)))?;
    map.append(name, value);
  }
  Ok(map)
}

/// Body plan for a message: framing kind plus the exact length when known
#[derive(Debug, Clone, Copy)]
enum BodyPlan {
  Empty,
  ContentLength(usize),
  Chunked,
  CloseDelimited,
}

fn framing_kind(plan: BodyPlan) -> BodyFraming {
  match plan {
    BodyPlan::Empty => BodyFraming::Empty,
    BodyPlan::ContentLength(_) => BodyFraming::ContentLength,
    BodyPlan::Chunked => BodyFraming::Chunked,
    BodyPlan::CloseDelimited => BodyFraming::CloseDelimited,
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
    v.to_str()
      .map(|s| s.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false)
  })
}

fn content_length(headers: &HeaderMap, side: Side) -> Result<Option<usize>> {
  let mut values = headers.get_all(CONTENT_LENGTH).iter();
  let Some(first) = values.next() else {
    return Ok(None);
  };
  // conflicting duplicates are a smuggling vector, reject them
  if values.any(|v| v != first) {
    return Err(side.error("conflicting Content-Length headers"));
  }
  let len = first
    .to_str()
    .ok()
    .and_then(|s| s.trim().parse::<usize>().ok())
    .ok_or_else(|| side.error("unparseable Content-Length"))?;
  Ok(Some(len))
}

fn request_framing(headers: &HeaderMap, side: Side) -> Result<BodyPlan> {
  if is_chunked(headers) {
    return Ok(BodyPlan::Chunked);
  }
  match content_length(headers, side)? {
    Some(0) | None => Ok(BodyPlan::Empty),
    Some(len) => Ok(BodyPlan::ContentLength(len)),
  }
}

fn response_framing(status: StatusCode, headers: &HeaderMap, side: Side) -> Result<BodyPlan> {
  if status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyPlan::Empty);
  }
  if is_chunked(headers) {
    return Ok(BodyPlan::Chunked);
  }
  match content_length(headers, side)? {
    Some(0) => Ok(BodyPlan::Empty),
    Some(len) => Ok(BodyPlan::ContentLength(len)),
    None => Ok(BodyPlan::CloseDelimited),
  }
}

async fn read_body<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
  plan: BodyPlan,
  side: Side,
) -> Result<Bytes> {
  match plan {
    BodyPlan::Empty => Ok(Bytes::new()),
    BodyPlan::ContentLength(len) => read_exact_len(stream, len, side).await,
    BodyPlan::Chunked => read_chunked(stream, side).await,
    BodyPlan::CloseDelimited => read_to_eof(stream, side).await,
  }
}

async fn read_exact_len<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
  len: usize,
  side: Side,
) -> Result<Bytes> {
  if len > MAX_BODY_BYTES {
    return Err(side.error("message body exceeds maximum size"));
  }
  while stream.buf.len() < len {
    if stream.fill().await? == 0 {
      return Err(side.error("connection closed before body completed"));
    }
  }
  Ok(Bytes::from(stream.take_prefix(len)))
}

async fn read_chunked<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
  side: Side,
) -> Result<Bytes> {
  let mut body = Vec::new();
  loop {
    let line = read_line(stream, side).await?;
    let size = parse_chunk_size(&line, side)?;
    if size == 0 {
      // trailer section runs to a blank line; trailers are not surfaced
      loop {
        let trailer = read_line(stream, side).await?;
        if trailer.is_empty() {
          break;
        }
      }
      break;
    }
    if body.len() + size > MAX_BODY_BYTES {
      return Err(side.error("chunked body exceeds maximum size"));
    }
    let chunk = read_exact_len(stream, size + 2, side).await?;
    if &chunk[size..] != b"\r\n" {
      return Err(side.error("invalid chunk terminator"));
    }
    body.extend_from_slice(&chunk[..size]);
  }
  Ok(Bytes::from(body))
}

async fn read_to_eof<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
  side: Side,
) -> Result<Bytes> {
  loop {
    if stream.buf.len() > MAX_BODY_BYTES {
      return Err(side.error("message body exceeds maximum size"));
    }
    if stream.fill().await? == 0 {
      break;
    }
  }
  let len = stream.buf.len();
  Ok(Bytes::from(stream.take_prefix(len)))
}

/// Read one CRLF-terminated line, returning it without the terminator
async fn read_line<S: AsyncRead + Unpin>(
  stream: &mut BufferedStream<S>,
  side: Side,
) -> Result<Vec<u8>> {
  loop {
    if let Some(pos) = stream.buf.windows(2).position(|w| w == b"\r\n") {
      let mut line = stream.take_prefix(pos + 2);
      line.truncate(pos);
      return Ok(line);
    }
    if stream.buf.len() > MAX_HEAD_BYTES {
      return Err(side.error("line exceeds maximum size"));
    }
    if stream.fill().await? == 0 {
      return Err(side.error("connection closed mid line"));
    }
  }
}

fn parse_chunk_size(line: &[u8], side: Side) -> Result<usize> {
  let text =
    std::str::from_utf8(line).map_err(|_| side.error("chunk size line is not valid UTF-8"))?;
  let size_text = text.split(';').next().unwrap_or(text).trim();
  usize::from_str_radix(size_text, 16).map_err(|_| side.error("invalid chunk size"))
}

fn encode_headers(buf: &mut Vec<u8>, headers: &HeaderMap, framing: BodyFraming, body_len: usize) {
  for (name, value) in headers {
    if *name == CONTENT_LENGTH
      && matches!(framing, BodyFraming::ContentLength | BodyFraming::Chunked)
    {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  if framing == BodyFraming::ContentLength {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body_len).as_bytes());
  }
  buf.extend_from_slice(b"\r\n");
}

fn encode_body(buf: &mut Vec<u8>, framing: BodyFraming, body: &Bytes) {
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::ContentLength | BodyFraming::CloseDelimited => {
      buf.extend_from_slice(body);
    }
    BodyFraming::Chunked => {
      if !body.is_empty() {
        buf.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\r\n");
      }
      buf.extend_from_slice(b"0\r\n\r\n");
    }
  }
}
