//! Request routing for plain proxy connections
//!
//! Browsers keep one proxy connection open and send requests for any origin
//! over it. [`OriginGate`] lets through the client bytes that belong to the
//! origin a relay is connected to and holds back the first request addressed
//! elsewhere, so the relay can dial that origin and replay it there.

use crate::config::CaptureLimits;
use crate::error::{Error, Result};
use crate::flow::{find_head_end, parse_request_head, Flow, RequestHead, MAX_HEAD_SIZE};
use crate::upstream::Target;
use http::Uri;

/// Origin of a plain proxy request: absolute-form URI, else `Host`
pub(crate) fn plain_target(request: &RequestHead) -> Result<Target> {
  if let Ok(uri) = request.target.parse::<Uri>() {
    if let Some(authority) = uri.authority() {
      let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
      };
      let host = authority.host().trim_start_matches('[').trim_end_matches(']');
      return Ok(Target::new(host, authority.port_u16().unwrap_or(default_port)));
    }
  }
  match request.headers.get("host") {
    Some(host) if !host.trim().is_empty() => Target::parse(host, 80),
    _ => Err(Error::invalid_request(format!(
      "no target for {} {}",
      request.method, request.target
    ))),
  }
}

fn same_origin(a: &Target, b: &Target) -> bool {
  a.port == b.port && a.host.eq_ignore_ascii_case(&b.host)
}

/// Splits a plain client byte stream at requests for another origin
#[derive(Debug)]
pub(crate) struct OriginGate {
  bound: Target,
  limits: CaptureLimits,
  /// request currently passing through
  request: Option<Flow>,
  /// client bytes not yet cleared
  held: Vec<u8>,
  rerouted: Option<Target>,
  /// routing gave up; everything passes
  open: bool,
}

impl OriginGate {
  /// Gate for `bound`, starting with bytes already read from the client
  pub(crate) fn new(bound: Target, held: Vec<u8>, limits: CaptureLimits) -> Self {
    Self {
      bound,
      limits,
      request: None,
      held,
      rerouted: None,
      open: false,
    }
  }

  /// Origin the cleared bytes go to
  pub(crate) fn bound(&self) -> &Target {
    &self.bound
  }

  /// Origin of the held request, once one was addressed elsewhere
  pub(crate) fn rerouted(&self) -> Option<&Target> {
    self.rerouted.as_ref()
  }

  /// Stop routing, e.g. after the connection switched protocols
  pub(crate) fn open(&mut self) {
    self.open = true;
  }

  /// Take client bytes; returns those cleared for the bound origin
  ///
  /// Bytes after a request for another origin are held until
  /// [`OriginGate::next_origin`] hands them over.
  pub(crate) fn admit(&mut self, data: &[u8]) -> Vec<u8> {
    self.held.extend_from_slice(data);
    let mut cleared = Vec::new();
    while !self.open && self.rerouted.is_none() && !self.held.is_empty() {
      match self.step() {
        Ok(0) => break,
        Ok(n) => cleared.extend(self.held.drain(..n)),
        Err(e) => {
          tracing::debug!("no longer routing requests to {}: {}", self.bound, e);
          self.open = true;
        }
      }
    }
    if self.open {
      cleared.append(&mut self.held);
    }
    cleared
  }

  /// Gate for the origin of the held request, carrying the held bytes over
  pub(crate) fn next_origin(&mut self) -> Option<OriginGate> {
    let target = self.rerouted.take()?;
    Some(OriginGate::new(
      target,
      std::mem::take(&mut self.held),
      self.limits,
    ))
  }

  /// Length of the cleared prefix of `held`, 0 when more bytes are needed
  fn step(&mut self) -> Result<usize> {
    if let Some(flow) = self.request.as_mut() {
      if flow.request_in_progress() {
        return Self::feed(flow, &self.held);
      }
    }

    // Between requests: stray line breaks pass, a head must be whole to route
    let blank = self
      .held
      .iter()
      .take_while(|b| matches!(b, b'\r' | b'\n'))
      .count();
    if blank > 0 {
      return Ok(blank);
    }
    let Some(end) = find_head_end(&self.held, 0) else {
      if self.held.len() > MAX_HEAD_SIZE {
        return Err(Error::invalid_request("request head too large"));
      }
      return Ok(0);
    };
    let request = parse_request_head(&self.held[..end])?;
    let target = plain_target(&request)?;
    if !same_origin(&target, &self.bound) {
      tracing::debug!(
        "{} {} moves the connection from {} to {}",
        request.method,
        request.target,
        self.bound,
        target
      );
      self.rerouted = Some(target);
      return Ok(0);
    }
    let flow = self
      .request
      .insert(Flow::new("http", &self.bound.authority(), self.limits));
    Self::feed(flow, &self.held)
  }

  fn feed(flow: &mut Flow, data: &[u8]) -> Result<usize> {
    match flow.on_request_bytes(data)? {
      0 => Err(Error::invalid_request("request bytes were not consumed")),
      n => Ok(n),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn head(raw: &[u8]) -> RequestHead {
    parse_request_head(raw).unwrap()
  }

  fn gate(host: &str, port: u16) -> OriginGate {
    OriginGate::new(Target::new(host, port), Vec::new(), CaptureLimits::default())
  }

  #[test]
  fn test_plain_target_from_absolute_uri() {
    let request = head(b"GET http://www.cityheaven.net:8080/tokyo/ HTTP/1.1\r\nHost: other\r\n\r\n");
    assert_eq!(
      plain_target(&request).unwrap(),
      Target::new("www.cityheaven.net", 8080)
    );
    let request = head(b"GET http://[::1]/ HTTP/1.1\r\n\r\n");
    assert_eq!(plain_target(&request).unwrap(), Target::new("::1", 80));
  }

  #[test]
  fn test_plain_target_from_host_header() {
    let request = head(b"GET /a HTTP/1.1\r\nHost: r.gnavi.co.jp\r\n\r\n");
    assert_eq!(plain_target(&request).unwrap(), Target::new("r.gnavi.co.jp", 80));
    let request = head(b"GET /a HTTP/1.1\r\n\r\n");
    assert!(plain_target(&request).is_err());
  }

  #[test]
  fn test_same_origin_requests_pass_whole() {
    let mut gate = gate("r.gnavi.co.jp", 80);
    let first = b"GET http://r.gnavi.co.jp/a HTTP/1.1\r\nHost: r.gnavi.co.jp\r\n\r\n";
    let second = b"GET /b HTTP/1.1\r\nHost: R.GNAVI.CO.JP:80\r\n\r\n";
    let mut data = first.to_vec();
    data.extend_from_slice(second);
    assert_eq!(gate.admit(&data), data);
    assert!(gate.rerouted().is_none());
    assert!(gate.next_origin().is_none());
  }

  #[test]
  fn test_partial_head_is_held_until_routable() {
    let mut gate = gate("r.gnavi.co.jp", 80);
    let request = b"GET http://r.gnavi.co.jp/a HTTP/1.1\r\nHost: r.gnavi.co.jp\r\n\r\n";
    assert!(gate.admit(&request[..20]).is_empty());
    assert_eq!(gate.admit(&request[20..]), request.to_vec());
  }

  #[test]
  fn test_request_for_another_origin_is_held_back() {
    let mut gate = gate("r.gnavi.co.jp", 80);
    let first = b"POST http://r.gnavi.co.jp/form HTTP/1.1\r\nHost: r.gnavi.co.jp\r\nContent-Length: 45\r\n\r\nGET http://www.cityheaven.net/ HTTP/1.1\r\n\r\n\r\n";
    let second = b"GET http://www.cityheaven.net/tokyo HTTP/1.1\r\nHost: www.cityheaven.net\r\n\r\n";
    let mut data = first.to_vec();
    data.extend_from_slice(second);

    // the body that looks like a request line stays with the first origin
    assert_eq!(gate.admit(&data), first.to_vec());
    assert_eq!(gate.rerouted(), Some(&Target::new("www.cityheaven.net", 80)));
    // later bytes queue behind the held request
    assert!(gate.admit(b"GET /x HTTP/1.1\r\n").is_empty());

    let mut next = gate.next_origin().unwrap();
    assert!(gate.rerouted().is_none());
    assert_eq!(next.bound(), &Target::new("www.cityheaven.net", 80));
    // the trailing partial head waits for its blank line
    assert_eq!(next.admit(&[]), second.to_vec());
    let host = b"Host: www.cityheaven.net\r\n\r\n";
    assert_eq!(next.admit(host), [&b"GET /x HTTP/1.1\r\n"[..], host].concat());
  }

  #[test]
  fn test_unparsable_traffic_opens_the_gate() {
    let mut gate = gate("r.gnavi.co.jp", 80);
    let data = b"NOT AN HTTP REQUEST\r\n\r\nmore";
    assert_eq!(gate.admit(data), data.to_vec());
    assert_eq!(gate.admit(b"\x00\x01"), b"\x00\x01".to_vec());
  }

  #[test]
  fn test_open_gate_passes_upgraded_traffic() {
    let mut gate = gate("r.gnavi.co.jp", 80);
    let upgrade = b"GET /ws HTTP/1.1\r\nHost: r.gnavi.co.jp\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    assert_eq!(gate.admit(upgrade), upgrade.to_vec());
    gate.open();
    assert_eq!(gate.admit(b"\x81\x05hello"), b"\x81\x05hello".to_vec());
  }
}
