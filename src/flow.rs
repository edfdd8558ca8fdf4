//! Incremental HTTP/1.x exchange assembly
//!
//! The relay feeds raw bytes in whatever pieces the sockets return them. A
//! [`Flow`] assembles one request/response exchange out of those pieces and a
//! [`FlowTracker`] lines flows up with a connection, including pipelined
//! requests. Bodies are never buffered in full: each side keeps a bounded
//! prefix for recording and only counts the rest.

use crate::config::CaptureLimits;
use crate::decode::{self, MAX_BYTES_PER_CHAR};
use crate::error::{Error, Result};
use crate::record::{CapturedEntry, CapturedRequest, CapturedResponse, HeaderFields};
use http::{Method, StatusCode, Version};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest request or response head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest chunk-size or trailer line accepted
const MAX_CHUNK_LINE: usize = 4096;
/// Extra bytes kept beyond the character budget
const CAPTURE_SLACK: usize = 1024;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes kept for a body whose text is limited to `limit_chars` characters
pub fn capture_budget(limit_chars: usize) -> usize {
  limit_chars
    .saturating_mul(MAX_BYTES_PER_CHAR)
    .saturating_add(CAPTURE_SLACK)
}

fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}

/// Lifecycle of a flow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
  /// Request head or body still arriving
  RequestBuilding,
  /// Request read, response still arriving
  ResponseBuilding,
  /// Both messages fully read
  Complete,
  /// Connection closed or traffic unparsable before completion
  Errored,
}

/// Ordered header list, original casing, repeated names kept apart
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  /// Empty header list
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a header
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  /// First value of a header, case-insensitive
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Every value of a header, in order
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .0
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether a comma-separated header carries `token`
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self
      .get_all(name)
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  }

  /// Iterate over (name, value)
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Number of header lines
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  fn fold_last(&mut self, continuation: &str) -> Result<()> {
    match self.0.last_mut() {
      Some((_, value)) => {
        if !value.is_empty() {
          value.push(' ');
        }
        value.push_str(continuation);
        Ok(())
      }
      None => Err(Error::InvalidRequest(
        "continuation line before first header".to_string(),
      )),
    }
  }
}

/// Parsed request line and headers
#[derive(Clone, Debug)]
pub struct RequestHead {
  /// method
  pub method: Method,
  /// request target as sent
  pub target: String,
  /// protocol version
  pub version: Version,
  /// headers
  pub headers: Headers,
}

/// Parsed status line and headers
#[derive(Clone, Debug)]
pub struct ResponseHead {
  /// status code
  pub status: StatusCode,
  /// reason phrase
  pub reason: String,
  /// protocol version
  pub version: Version,
  /// headers
  pub headers: Headers,
}

/// Bounded prefix of a message body
#[derive(Clone, Debug, Default)]
pub struct BodyCapture {
  buf: Vec<u8>,
  budget: usize,
  total: u64,
  truncated: bool,
}

impl BodyCapture {
  fn with_budget(budget: usize) -> Self {
    Self {
      buf: Vec::new(),
      budget,
      total: 0,
      truncated: false,
    }
  }

  fn push(&mut self, data: &[u8]) {
    self.total += data.len() as u64;
    let room = self.budget.saturating_sub(self.buf.len());
    if data.len() > room {
      self.truncated = true;
    }
    self.buf.extend_from_slice(&data[..data.len().min(room)]);
  }

  /// Kept bytes (de-chunked, still content-encoded)
  pub fn bytes(&self) -> &[u8] {
    &self.buf
  }

  /// Full body length seen on the wire
  pub fn total_len(&self) -> u64 {
    self.total
  }

  /// Whether bytes were dropped past the budget
  pub fn is_truncated(&self) -> bool {
    self.truncated
  }
}

/// Milliseconds since the epoch at each stage of a flow
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowTimestamps {
  /// first request byte
  pub request_start: u64,
  /// request fully read
  pub request_end: Option<u64>,
  /// first response byte
  pub response_start: Option<u64>,
  /// response fully read
  pub response_end: Option<u64>,
}

#[derive(Debug, Default)]
struct HeadBuffer {
  buf: Vec<u8>,
}

impl HeadBuffer {
  /// Returns consumed bytes and, once the blank line arrives, the whole head
  fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Vec<u8>>)> {
    // Stray CRLFs between messages are ignored
    let skipped = if self.buf.is_empty() {
      data
        .iter()
        .take_while(|b| matches!(b, b'\r' | b'\n'))
        .count()
    } else {
      0
    };
    let data = &data[skipped..];
    let old = self.buf.len();
    self.buf.extend_from_slice(data);
    match find_head_end(&self.buf, old.saturating_sub(3)) {
      Some(end) => {
        if end > MAX_HEAD_SIZE {
          return Err(Error::InvalidRequest("message head too large".to_string()));
        }
        self.buf.truncate(end);
        Ok((skipped + end - old, Some(std::mem::take(&mut self.buf))))
      }
      None => {
        if self.buf.len() > MAX_HEAD_SIZE {
          return Err(Error::InvalidRequest("message head too large".to_string()));
        }
        Ok((skipped + data.len(), None))
      }
    }
  }

  fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }
}

/// Index just past the blank line ending a head, CRLF or bare LF
pub(crate) fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
  (from..buf.len()).find_map(|i| {
    if buf[i] != b'\n' {
      return None;
    }
    match (buf.get(i + 1), buf.get(i + 2)) {
      (Some(b'\n'), _) => Some(i + 2),
      (Some(b'\r'), Some(b'\n')) => Some(i + 3),
      _ => None,
    }
  })
}

#[derive(Debug)]
enum ChunkState {
  Size(Vec<u8>),
  Data(u64),
  DataEnd,
  Trailer(Vec<u8>),
  Done,
}

#[derive(Debug)]
enum BodyReader {
  Empty,
  Length(u64),
  Chunked(ChunkState),
  UntilClose,
}

impl BodyReader {
  /// Returns consumed bytes and whether the body ended
  fn feed(&mut self, data: &[u8], capture: &mut BodyCapture) -> Result<(usize, bool)> {
    match self {
      BodyReader::Empty => Ok((0, true)),
      BodyReader::Length(remaining) => {
        let n = (*remaining).min(data.len() as u64) as usize;
        capture.push(&data[..n]);
        *remaining -= n as u64;
        Ok((n, *remaining == 0))
      }
      BodyReader::UntilClose => {
        capture.push(data);
        Ok((data.len(), false))
      }
      BodyReader::Chunked(state) => feed_chunked(state, data, capture),
    }
  }
}

fn feed_chunked(
  state: &mut ChunkState,
  data: &[u8],
  capture: &mut BodyCapture,
) -> Result<(usize, bool)> {
  let mut pos = 0;
  while pos < data.len() {
    match state {
      ChunkState::Size(line) => {
        let b = data[pos];
        pos += 1;
        if b == b'\n' {
          let size = parse_chunk_size(line)?;
          *state = if size == 0 {
            ChunkState::Trailer(Vec::new())
          } else {
            ChunkState::Data(size)
          };
        } else {
          line.push(b);
          if line.len() > MAX_CHUNK_LINE {
            return Err(Error::InvalidRequest("chunk size line too long".to_string()));
          }
        }
      }
      ChunkState::Data(remaining) => {
        let n = (*remaining).min((data.len() - pos) as u64) as usize;
        capture.push(&data[pos..pos + n]);
        pos += n;
        *remaining -= n as u64;
        if *remaining == 0 {
          *state = ChunkState::DataEnd;
        }
      }
      ChunkState::DataEnd => {
        let b = data[pos];
        pos += 1;
        match b {
          b'\r' => {}
          b'\n' => *state = ChunkState::Size(Vec::new()),
          _ => return Err(Error::InvalidRequest("missing CRLF after chunk".to_string())),
        }
      }
      ChunkState::Trailer(line) => {
        let b = data[pos];
        pos += 1;
        if b == b'\n' {
          if line.is_empty() || line.as_slice() == b"\r" {
            *state = ChunkState::Done;
            return Ok((pos, true));
          }
          line.clear();
        } else {
          line.push(b);
          if line.len() > MAX_CHUNK_LINE {
            return Err(Error::InvalidRequest("trailer line too long".to_string()));
          }
        }
      }
      ChunkState::Done => return Ok((pos, true)),
    }
  }
  Ok((pos, matches!(state, ChunkState::Done)))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let text = String::from_utf8_lossy(line);
  let size = text
    .split(';')
    .next()
    .unwrap_or_default()
    .trim();
  u64::from_str_radix(size, 16)
    .map_err(|_| Error::InvalidRequest(format!("invalid chunk size {:?}", size)))
}

#[derive(Debug)]
enum Phase {
  Head(HeadBuffer),
  Body(BodyReader),
  Done,
}

fn parse_version(text: &str) -> Result<Version> {
  match text {
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    other => Err(Error::InvalidRequest(format!(
      "unsupported protocol version {:?}",
      other
    ))),
  }
}

/// Start line and header list of a raw head
fn split_head(raw: &[u8]) -> Result<(String, Headers)> {
  let text = String::from_utf8_lossy(raw);
  let mut lines = text
    .split('\n')
    .map(|line| line.strip_suffix('\r').unwrap_or(line));
  let start = lines.next().unwrap_or_default().to_string();
  let mut headers = Headers::new();
  for line in lines {
    if line.is_empty() {
      continue;
    }
    if line.starts_with(' ') || line.starts_with('\t') {
      headers.fold_last(line.trim())?;
      continue;
    }
    let (name, value) = line
      .split_once(':')
      .ok_or_else(|| Error::InvalidRequest(format!("malformed header line {:?}", line)))?;
    if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
      return Err(Error::InvalidRequest(format!("invalid header name {:?}", name)));
    }
    headers.append(name, value.trim());
  }
  Ok((start, headers))
}

/// Parse a request head
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
  let (start, headers) = split_head(raw)?;
  let mut parts = start.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v), None) => (m, t, v),
    _ => {
      return Err(Error::InvalidRequest(format!(
        "malformed request line {:?}",
        start
      )))
    }
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::InvalidRequest(format!("invalid method {:?}", method)))?;
  Ok(RequestHead {
    method,
    target: target.to_string(),
    version: parse_version(version)?,
    headers,
  })
}

/// Parse a response head
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
  let (start, headers) = split_head(raw)?;
  let mut parts = start.splitn(3, ' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let code = parts.next().unwrap_or_default();
  let status = StatusCode::from_bytes(code.as_bytes())
    .map_err(|_| Error::InvalidRequest(format!("invalid status code {:?}", code)))?;
  Ok(ResponseHead {
    status,
    reason: parts.next().unwrap_or_default().trim().to_string(),
    version,
    headers,
  })
}

/// Content-Length, with repeated or comma-joined copies required to agree
fn content_length(headers: &Headers) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
    let parsed: u64 = value
      .trim()
      .parse()
      .map_err(|_| Error::InvalidRequest(format!("invalid content-length {:?}", value)))?;
    match length {
      Some(existing) if existing != parsed => {
        return Err(Error::InvalidRequest(
          "conflicting content-length values".to_string(),
        ))
      }
      _ => length = Some(parsed),
    }
  }
  Ok(length)
}

/// Whether the final transfer coding is chunked, `None` without the header
fn chunked_coding(headers: &Headers) -> Option<bool> {
  let codings: Vec<&str> = headers
    .get_all("transfer-encoding")
    .flat_map(|v| v.split(','))
    .map(str::trim)
    .filter(|c| !c.is_empty())
    .collect();
  codings
    .last()
    .map(|last| last.eq_ignore_ascii_case("chunked"))
}

fn length_body(length: u64) -> BodyReader {
  if length == 0 {
    BodyReader::Empty
  } else {
    BodyReader::Length(length)
  }
}

fn request_framing(request: &RequestHead) -> Result<BodyReader> {
  match chunked_coding(&request.headers) {
    Some(true) => Ok(BodyReader::Chunked(ChunkState::Size(Vec::new()))),
    Some(false) => Err(Error::InvalidRequest(
      "request transfer-encoding is not chunked".to_string(),
    )),
    None => Ok(content_length(&request.headers)?.map_or(BodyReader::Empty, length_body)),
  }
}

fn response_framing(request: &RequestHead, response: &ResponseHead) -> Result<BodyReader> {
  let status = response.status;
  if request.method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyReader::Empty);
  }
  match chunked_coding(&response.headers) {
    Some(true) => Ok(BodyReader::Chunked(ChunkState::Size(Vec::new()))),
    Some(false) => Ok(BodyReader::UntilClose),
    None => Ok(
      content_length(&response.headers)?.map_or(BodyReader::UntilClose, length_body),
    ),
  }
}

fn start_phase(body: BodyReader) -> Phase {
  match body {
    BodyReader::Empty => Phase::Done,
    body => Phase::Body(body),
  }
}

/// One request/response exchange
#[derive(Debug)]
pub struct Flow {
  id: u64,
  scheme: String,
  authority: String,
  request: Option<RequestHead>,
  response: Option<ResponseHead>,
  request_body: BodyCapture,
  response_body: BodyCapture,
  request_phase: Phase,
  response_phase: Phase,
  close_delimited: bool,
  upgraded: bool,
  timestamps: FlowTimestamps,
  state: FlowState,
}

impl Flow {
  /// Start a flow on a connection to `authority` (`host[:port]`)
  pub fn new(scheme: &str, authority: &str, limits: CaptureLimits) -> Self {
    Self {
      id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
      scheme: scheme.to_ascii_lowercase(),
      authority: authority.to_string(),
      request: None,
      response: None,
      request_body: BodyCapture::with_budget(capture_budget(limits.request_body)),
      response_body: BodyCapture::with_budget(capture_budget(limits.response_body)),
      request_phase: Phase::Head(HeadBuffer::default()),
      response_phase: Phase::Head(HeadBuffer::default()),
      close_delimited: false,
      upgraded: false,
      timestamps: FlowTimestamps {
        request_start: now_millis(),
        ..Default::default()
      },
      state: FlowState::RequestBuilding,
    }
  }

  /// Feed client bytes, returning how many belong to this flow's request
  pub fn on_request_bytes(&mut self, data: &[u8]) -> Result<usize> {
    if self.state == FlowState::Errored || self.request_finished() {
      return Ok(0);
    }
    self.feed_request(data).map_err(|e| {
      self.state = FlowState::Errored;
      e
    })
  }

  /// Feed upstream bytes, returning how many belong to this flow's response
  pub fn on_response_bytes(&mut self, data: &[u8]) -> Result<usize> {
    if !self.response_in_progress() {
      return Ok(0);
    }
    self.feed_response(data).map_err(|e| {
      self.state = FlowState::Errored;
      e
    })
  }

  /// Upstream closed: ends a close-delimited response, aborts anything else
  pub fn on_response_eof(&mut self) -> Result<()> {
    if self.state == FlowState::Complete {
      return Ok(());
    }
    if matches!(self.response_phase, Phase::Body(BodyReader::UntilClose)) {
      self.response_phase = Phase::Done;
      self.finish_response();
      if self.state == FlowState::Complete {
        return Ok(());
      }
    }
    self.abort();
    Err(Error::incomplete_flow(format!(
      "flow {} closed before the exchange finished",
      self.id
    )))
  }

  /// Mark an unfinished flow as errored
  pub fn abort(&mut self) {
    if self.state != FlowState::Complete {
      self.state = FlowState::Errored;
    }
  }

  fn feed_request(&mut self, data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    loop {
      match &mut self.request_phase {
        Phase::Head(head) => {
          if pos == data.len() {
            break;
          }
          let (n, complete) = head.feed(&data[pos..])?;
          pos += n;
          if let Some(raw) = complete {
            let request = parse_request_head(&raw)?;
            self.request_phase = start_phase(request_framing(&request)?);
            self.request = Some(request);
          }
        }
        Phase::Body(body) => {
          if pos == data.len() {
            break;
          }
          let (n, done) = body.feed(&data[pos..], &mut self.request_body)?;
          pos += n;
          if done {
            self.request_phase = Phase::Done;
          }
        }
        Phase::Done => break,
      }
    }
    if matches!(self.request_phase, Phase::Done) && self.timestamps.request_end.is_none() {
      self.timestamps.request_end = Some(now_millis());
      self.state = if self.response_finished() {
        FlowState::Complete
      } else {
        FlowState::ResponseBuilding
      };
    }
    Ok(pos)
  }

  fn feed_response(&mut self, data: &[u8]) -> Result<usize> {
    if self.timestamps.response_start.is_none() && !data.is_empty() {
      self.timestamps.response_start = Some(now_millis());
    }
    let mut pos = 0;
    loop {
      match &mut self.response_phase {
        Phase::Head(head) => {
          if pos == data.len() {
            break;
          }
          let (n, complete) = head.feed(&data[pos..])?;
          pos += n;
          if let Some(raw) = complete {
            let response = parse_response_head(&raw)?;
            let status = response.status;
            // Interim responses precede the real one
            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
              continue;
            }
            let request = self
              .request
              .as_ref()
              .ok_or_else(|| Error::InvalidRequest("response before request".to_string()))?;
            let body = response_framing(request, &response)?;
            self.close_delimited = matches!(body, BodyReader::UntilClose);
            self.upgraded = status == StatusCode::SWITCHING_PROTOCOLS;
            self.response_phase = start_phase(body);
            self.response = Some(response);
          }
        }
        Phase::Body(body) => {
          if pos == data.len() {
            break;
          }
          let (n, done) = body.feed(&data[pos..], &mut self.response_body)?;
          pos += n;
          if done {
            self.response_phase = Phase::Done;
          }
        }
        Phase::Done => break,
      }
    }
    if matches!(self.response_phase, Phase::Done) {
      self.finish_response();
    }
    Ok(pos)
  }

  fn finish_response(&mut self) {
    if self.timestamps.response_end.is_some() {
      return;
    }
    self.timestamps.response_end = Some(now_millis());
    if self.request_finished() {
      self.state = FlowState::Complete;
    }
  }

  fn request_finished(&self) -> bool {
    matches!(self.request_phase, Phase::Done)
  }

  fn response_finished(&self) -> bool {
    matches!(self.response_phase, Phase::Done)
  }

  /// Whether client bytes could still belong to this flow
  pub(crate) fn request_in_progress(&self) -> bool {
    self.state != FlowState::Errored && !self.request_finished()
  }

  /// Whether upstream bytes could still belong to this flow
  fn response_in_progress(&self) -> bool {
    self.state != FlowState::Errored && self.request.is_some() && !self.response_finished()
  }

  /// Whether any request byte has arrived
  fn has_started(&self) -> bool {
    match &self.request_phase {
      Phase::Head(head) => !head.is_empty(),
      _ => true,
    }
  }

  /// Whether both messages were fully read
  pub fn is_complete(&self) -> bool {
    self.state == FlowState::Complete
  }

  /// Current state
  pub fn state(&self) -> FlowState {
    self.state
  }

  /// Process-unique id
  pub fn id(&self) -> u64 {
    self.id
  }

  /// `http` or `https`
  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  /// Connection authority the flow was relayed to
  pub fn authority(&self) -> &str {
    &self.authority
  }

  /// Request head once parsed
  pub fn request(&self) -> Option<&RequestHead> {
    self.request.as_ref()
  }

  /// Final response head once parsed
  pub fn response(&self) -> Option<&ResponseHead> {
    self.response.as_ref()
  }

  /// Request method once parsed
  pub fn method(&self) -> Option<&Method> {
    self.request.as_ref().map(|r| &r.method)
  }

  /// Captured request body
  pub fn request_body(&self) -> &BodyCapture {
    &self.request_body
  }

  /// Captured response body
  pub fn response_body(&self) -> &BodyCapture {
    &self.response_body
  }

  /// Stage timestamps
  pub fn timestamps(&self) -> FlowTimestamps {
    self.timestamps
  }

  /// Whether the response switched protocols
  pub fn is_upgrade(&self) -> bool {
    self.upgraded
  }

  /// Whether the connection may carry another exchange after this one
  pub fn keep_alive(&self) -> bool {
    let (Some(request), Some(response)) = (&self.request, &self.response) else {
      return false;
    };
    if self.upgraded || self.close_delimited {
      return false;
    }
    if request.headers.has_token("connection", "close")
      || response.headers.has_token("connection", "close")
    {
      return false;
    }
    response.version == Version::HTTP_11 || response.headers.has_token("connection", "keep-alive")
  }

  /// Full URL of the request
  ///
  /// Absolute-form targets are used as sent. Otherwise the `Host` header, or
  /// the connection authority, names the origin and default ports are elided.
  pub fn url(&self) -> Option<String> {
    let request = self.request.as_ref()?;
    let target = request.target.as_str();
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
      return Some(target.to_string());
    }
    let host = request
      .headers
      .get("host")
      .map(str::trim)
      .filter(|h| !h.is_empty())
      .unwrap_or(&self.authority);
    let default_port = if self.scheme == "https" { ":443" } else { ":80" };
    let host = host.strip_suffix(default_port).unwrap_or(host);
    let path = if target.starts_with('/') { target } else { "/" };
    Some(format!("{}://{}{}", self.scheme, host, path))
  }

  /// Captured record of a complete flow, bodies decoded and truncated
  pub fn to_captured_entry(&self, limits: CaptureLimits) -> Option<CapturedEntry> {
    if !self.is_complete() {
      return None;
    }
    let request = self.request.as_ref()?;
    let response = self.response.as_ref()?;
    Some(CapturedEntry {
      method: request.method.to_string(),
      url: self.url()?,
      request: CapturedRequest {
        headers: HeaderFields::from_pairs(request.headers.iter()),
        body: decode::body_text(
          self.request_body.bytes(),
          request.headers.get("content-encoding"),
          request.headers.get("content-type"),
          self.request_body.is_truncated(),
          limits.request_body,
        ),
      },
      response: CapturedResponse {
        status: response.status.as_u16(),
        headers: HeaderFields::from_pairs(response.headers.iter()),
        body: decode::body_text(
          self.response_body.bytes(),
          response.headers.get("content-encoding"),
          response.headers.get("content-type"),
          self.response_body.is_truncated(),
          limits.response_body,
        ),
      },
    })
  }
}

/// Flows of one relayed connection, oldest first
#[derive(Debug)]
pub struct FlowTracker {
  scheme: String,
  authority: String,
  limits: CaptureLimits,
  flows: VecDeque<Flow>,
  passthrough: bool,
  keep_alive: bool,
  discarded: usize,
}

impl FlowTracker {
  /// Tracker for a connection to `authority`
  pub fn new(scheme: &str, authority: &str, limits: CaptureLimits) -> Self {
    Self {
      scheme: scheme.to_string(),
      authority: authority.to_string(),
      limits,
      flows: VecDeque::new(),
      passthrough: false,
      keep_alive: true,
      discarded: 0,
    }
  }

  /// Client bytes; returns flows that completed, in order
  pub fn on_client_bytes(&mut self, data: &[u8]) -> Vec<Flow> {
    let mut rest = data;
    while !self.passthrough && !rest.is_empty() {
      if !self.flows.back().is_some_and(Flow::request_in_progress) {
        self
          .flows
          .push_back(Flow::new(&self.scheme, &self.authority, self.limits));
      }
      let Some(flow) = self.flows.back_mut() else {
        break;
      };
      match flow.on_request_bytes(rest) {
        Ok(0) => self.enter_passthrough("request bytes were not consumed"),
        Ok(n) => rest = &rest[n..],
        Err(e) => self.enter_passthrough(&e.to_string()),
      }
    }
    self.pop_completed()
  }

  /// Upstream bytes; returns flows that completed, in order
  pub fn on_upstream_bytes(&mut self, data: &[u8]) -> Vec<Flow> {
    let mut rest = data;
    let mut completed = Vec::new();
    while !self.passthrough && !rest.is_empty() {
      let Some(index) = self.flows.iter().position(Flow::response_in_progress) else {
        self.enter_passthrough("response bytes without a pending request");
        break;
      };
      let flow = &mut self.flows[index];
      match flow.on_response_bytes(rest) {
        Ok(0) => self.enter_passthrough("response bytes were not consumed"),
        Ok(n) => {
          rest = &rest[n..];
          let upgraded = flow.is_upgrade() && flow.response_finished();
          completed.extend(self.pop_completed());
          if upgraded {
            self.enter_passthrough("connection switched protocols");
          }
        }
        Err(e) => self.enter_passthrough(&e.to_string()),
      }
    }
    completed.extend(self.pop_completed());
    completed
  }

  /// Upstream closed; returns the flow it completed, if any
  pub fn on_upstream_eof(&mut self) -> Vec<Flow> {
    if let Some(flow) = self.flows.iter_mut().find(|f| f.response_in_progress()) {
      // Failure is logged by the flow and leaves it errored
      let _ = flow.on_response_eof();
    }
    let completed = self.pop_completed();
    self.abort();
    completed
  }

  /// Drop every unfinished flow, returning how many had started
  pub fn abort(&mut self) -> usize {
    let discarded = self.flows.iter().filter(|f| f.has_started()).count();
    if discarded > 0 {
      tracing::debug!(
        "discarding {} incomplete flow(s) to {}",
        discarded,
        self.authority
      );
    }
    for flow in self.flows.iter_mut() {
      flow.abort();
    }
    self.flows.clear();
    self.discarded += discarded;
    discarded
  }

  /// Flows dropped unfinished over the tracker's lifetime
  pub fn discarded(&self) -> usize {
    self.discarded
  }

  /// Whether no exchange is in flight
  pub fn is_idle(&self) -> bool {
    !self.flows.iter().any(Flow::has_started)
  }

  /// Whether the last completed exchange allows connection reuse
  pub fn keep_alive(&self) -> bool {
    self.keep_alive && !self.passthrough
  }

  /// Whether parsing stopped for this connection
  pub fn is_passthrough(&self) -> bool {
    self.passthrough
  }

  fn enter_passthrough(&mut self, reason: &str) {
    tracing::debug!(
      "stop recording connection to {}: {}",
      self.authority,
      reason
    );
    self.passthrough = true;
    self.abort();
  }

  fn pop_completed(&mut self) -> Vec<Flow> {
    let mut completed = Vec::new();
    while self.flows.front().is_some_and(Flow::is_complete) {
      if let Some(flow) = self.flows.pop_front() {
        self.keep_alive = flow.keep_alive();
        completed.push(flow);
      }
    }
    completed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn limits() -> CaptureLimits {
    CaptureLimits {
      request_body: 5000,
      response_body: 10000,
    }
  }

  fn flow() -> Flow {
    Flow::new("https", "r.gnavi.co.jp:443", limits())
  }

  #[test]
  fn test_content_length_exchange() {
    let mut flow = flow();
    let request = b"POST /search?x=1 HTTP/1.1\r\nHost: r.gnavi.co.jp\r\nContent-Length: 5\r\n\r\nq=abc";
    assert_eq!(flow.on_request_bytes(request).unwrap(), request.len());
    assert_eq!(flow.state(), FlowState::ResponseBuilding);

    let response = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 6\r\n\r\n<html>";
    assert_eq!(flow.on_response_bytes(response).unwrap(), response.len());
    assert!(flow.is_complete());

    let entry = flow.to_captured_entry(limits()).unwrap();
    assert_eq!(entry.method, "POST");
    assert_eq!(entry.url, "https://r.gnavi.co.jp/search?x=1");
    assert_eq!(entry.request.body, "q=abc");
    assert_eq!(entry.response.status, 200);
    assert_eq!(entry.response.body, "<html>");
    assert_eq!(entry.response.headers.get("content-type"), Some("text/html"));
  }

  #[test]
  fn test_chunked_response_in_arbitrary_pieces() {
    let response: &[u8] =
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n";
    for split in 1..response.len() {
      let mut flow = flow();
      flow
        .on_request_bytes(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .unwrap();
      let first = flow.on_response_bytes(&response[..split]).unwrap();
      let second = flow.on_response_bytes(&response[first..]).unwrap();
      assert_eq!(first + second, response.len(), "split at {}", split);
      assert!(flow.is_complete(), "split at {}", split);
      assert_eq!(flow.response_body().bytes(), b"hello world");
    }
  }

  #[test]
  fn test_head_response_has_no_body() {
    let mut flow = flow();
    flow
      .on_request_bytes(b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\n")
      .unwrap();
    flow
      .on_response_bytes(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
      .unwrap();
    assert!(flow.is_complete());
    assert_eq!(flow.response_body().total_len(), 0);
  }

  #[test]
  fn test_no_content_and_not_modified() {
    for status in ["204 No Content", "304 Not Modified"] {
      let mut flow = flow();
      flow.on_request_bytes(b"GET / HTTP/1.1\r\n\r\n").unwrap();
      let head = format!("HTTP/1.1 {}\r\nContent-Length: 12\r\n\r\n", status);
      flow.on_response_bytes(head.as_bytes()).unwrap();
      assert!(flow.is_complete(), "{}", status);
    }
  }

  #[test]
  fn test_interim_continue_is_skipped() {
    let mut flow = flow();
    flow
      .on_request_bytes(b"PUT /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n")
      .unwrap();
    assert_eq!(flow.state(), FlowState::RequestBuilding);
    flow
      .on_response_bytes(b"HTTP/1.1 100 Continue\r\n\r\n")
      .unwrap();
    flow.on_request_bytes(b"ok").unwrap();
    flow
      .on_response_bytes(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
      .unwrap();
    assert!(flow.is_complete());
    assert_eq!(flow.response().unwrap().status, StatusCode::CREATED);
  }

  #[test]
  fn test_close_delimited_response_completes_at_eof() {
    let mut flow = flow();
    flow.on_request_bytes(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    flow
      .on_response_bytes(b"HTTP/1.0 200 OK\r\n\r\nstreamed until close")
      .unwrap();
    assert_eq!(flow.state(), FlowState::ResponseBuilding);
    flow.on_response_eof().unwrap();
    assert!(flow.is_complete());
    assert!(!flow.keep_alive());
    assert_eq!(flow.response_body().bytes(), b"streamed until close");
  }

  #[test]
  fn test_eof_mid_body_errors_flow() {
    let mut flow = flow();
    flow.on_request_bytes(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    flow
      .on_response_bytes(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
      .unwrap();
    assert!(matches!(flow.on_response_eof(), Err(Error::IncompleteFlow(_))));
    assert_eq!(flow.state(), FlowState::Errored);
    assert!(flow.to_captured_entry(limits()).is_none());
  }

  #[test]
  fn test_capture_is_bounded_but_length_counted() {
    let limits = CaptureLimits {
      request_body: 10,
      response_body: 10,
    };
    let mut flow = Flow::new("http", "example.com", limits);
    flow.on_request_bytes(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let body = vec![b'a'; 200_000];
    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    flow.on_response_bytes(head.as_bytes()).unwrap();
    flow.on_response_bytes(&body).unwrap();
    assert!(flow.is_complete());
    assert_eq!(flow.response_body().total_len(), 200_000);
    assert_eq!(flow.response_body().bytes().len(), capture_budget(10));
    assert!(flow.response_body().is_truncated());
    assert_eq!(flow.to_captured_entry(limits).unwrap().response.body, "a".repeat(10));
  }

  #[test]
  fn test_url_forms() {
    let mut absolute = Flow::new("http", "example.com:80", limits());
    absolute
      .on_request_bytes(b"GET http://example.com/a?b=1 HTTP/1.1\r\n\r\n")
      .unwrap();
    assert_eq!(absolute.url().unwrap(), "http://example.com/a?b=1");

    let mut origin = Flow::new("https", "www.cityheaven.net:443", limits());
    origin.on_request_bytes(b"GET /tokyo/ HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(origin.url().unwrap(), "https://www.cityheaven.net/tokyo/");

    let mut custom_port = Flow::new("https", "x:8443", limits());
    custom_port
      .on_request_bytes(b"GET / HTTP/1.1\r\nHost: api.gnavi.co.jp:8443\r\n\r\n")
      .unwrap();
    assert_eq!(custom_port.url().unwrap(), "https://api.gnavi.co.jp:8443/");
  }

  #[test]
  fn test_obs_fold_and_bare_lf() {
    let head = parse_request_head(b"GET / HTTP/1.1\nX-Long: one\n  two\nHost: a\n\n").unwrap();
    assert_eq!(head.headers.get("x-long"), Some("one two"));
    assert_eq!(head.headers.get("HOST"), Some("a"));
  }

  #[test]
  fn test_conflicting_content_length_is_rejected() {
    let mut flow = flow();
    let result = flow.on_request_bytes(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");
    assert!(result.is_err());
    assert_eq!(flow.state(), FlowState::Errored);
  }

  #[test]
  fn test_tracker_pipelined_requests_complete_in_order() {
    let mut tracker = FlowTracker::new("https", "a.gnavi.co.jp:443", limits());
    let done = tracker.on_client_bytes(b"GET /1 HTTP/1.1\r\nHost: a.gnavi.co.jp\r\n\r\nGET /2 HTTP/1.1\r\nHost: a.gnavi.co.jp\r\n\r\n");
    assert!(done.is_empty());
    assert!(!tracker.is_idle());

    let done = tracker.on_upstream_bytes(
      b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nAHTTP/1.1 404 Not Found\r\nContent-Length: 1\r\n\r\nB",
    );
    let urls: Vec<String> = done.iter().filter_map(Flow::url).collect();
    assert_eq!(urls, vec!["https://a.gnavi.co.jp/1", "https://a.gnavi.co.jp/2"]);
    assert_eq!(done[1].response().unwrap().status, StatusCode::NOT_FOUND);
    assert!(tracker.is_idle());
    assert!(tracker.keep_alive());
  }

  #[test]
  fn test_tracker_garbage_switches_to_passthrough() {
    let mut tracker = FlowTracker::new("http", "a:80", limits());
    tracker.on_client_bytes(b"GET / HTTP/1.1\r\n\r\n");
    let done = tracker.on_upstream_bytes(b"SSH-2.0-OpenSSH\r\n\r\n");
    assert!(done.is_empty());
    assert!(tracker.is_passthrough());
    assert!(tracker.on_client_bytes(b"GET / HTTP/1.1\r\n\r\n").is_empty());
  }

  #[test]
  fn test_tracker_upgrade_stops_parsing() {
    let mut tracker = FlowTracker::new("https", "a:443", limits());
    tracker.on_client_bytes(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
    let done = tracker.on_upstream_bytes(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x05hello");
    assert_eq!(done.len(), 1);
    assert!(done[0].is_upgrade());
    assert!(tracker.is_passthrough());
  }

  #[test]
  fn test_tracker_upstream_eof_discards_incomplete() {
    let mut tracker = FlowTracker::new("https", "a:443", limits());
    tracker.on_client_bytes(b"GET / HTTP/1.1\r\n\r\n");
    tracker.on_upstream_bytes(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n12345");
    assert!(tracker.on_upstream_eof().is_empty());
    assert!(tracker.is_idle());
    assert_eq!(tracker.discarded(), 1);
  }
}
