//! Body text extraction: content-encoding, charset, and character truncation
//!
//! Everything here works on the bounded capture prefix a flow keeps, so a
//! compressed or multi-byte body may end mid-sequence. Decoders keep whatever
//! prefix they could produce; anything that cannot be turned into text at all
//! becomes an empty string.

use crate::error::{Error, Result};
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use mime::Mime;
use std::io::Read;

/// Bytes sniffed for an HTML `<meta charset>`
const META_SNIFF_LEN: usize = 1024;
/// Worst-case UTF-8 bytes per character
pub const MAX_BYTES_PER_CHAR: usize = 4;

/// Decode a captured body to text of at most `max_chars` characters
///
/// Never fails: decode errors are logged at debug and yield `""`.
pub fn body_text(
  body: &[u8],
  content_encoding: Option<&str>,
  content_type: Option<&str>,
  truncated: bool,
  max_chars: usize,
) -> String {
  if body.is_empty() {
    return String::new();
  }
  match decode_body(body, content_encoding, content_type, truncated, max_chars) {
    Ok(text) => text,
    Err(e) => {
      tracing::debug!("{}", e);
      String::new()
    }
  }
}

/// Decode a captured body, reporting why it could not be decoded
pub fn decode_body(
  body: &[u8],
  content_encoding: Option<&str>,
  content_type: Option<&str>,
  truncated: bool,
  max_chars: usize,
) -> Result<String> {
  let max_bytes = max_chars
    .saturating_mul(MAX_BYTES_PER_CHAR)
    .saturating_add(MAX_BYTES_PER_CHAR);
  let (raw, truncated) = decode_content(body, content_encoding, truncated, max_bytes)?;
  let label = charset_label(content_type, &raw);
  let text = decode_charset(&raw, label.as_deref(), truncated)?;
  Ok(truncate_chars(&text, max_chars))
}

/// Keep the first `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
  match text.char_indices().nth(max_chars) {
    Some((idx, _)) => text[..idx].to_string(),
    None => text.to_string(),
  }
}

/// Undo `Content-Encoding`, codings applied last are removed first
///
/// Returns the decoded bytes and whether they are only a prefix.
fn decode_content(
  body: &[u8],
  content_encoding: Option<&str>,
  truncated: bool,
  max_bytes: usize,
) -> Result<(Vec<u8>, bool)> {
  let codings: Vec<String> = content_encoding
    .unwrap_or("")
    .split(',')
    .map(|c| c.trim().to_ascii_lowercase())
    .filter(|c| !c.is_empty() && c != "identity")
    .collect();

  let mut data = body.to_vec();
  let mut truncated = truncated;
  for coding in codings.iter().rev() {
    let (decoded, partial) = match coding.as_str() {
      "gzip" | "x-gzip" => read_limited(MultiGzDecoder::new(&data[..]), truncated, max_bytes)?,
      "deflate" => match read_limited(ZlibDecoder::new(&data[..]), truncated, max_bytes) {
        Ok(decoded) => decoded,
        Err(_) => read_limited(DeflateDecoder::new(&data[..]), truncated, max_bytes)?,
      },
      other => {
        return Err(Error::Decode(format!(
          "unsupported content-encoding {}",
          other
        )))
      }
    };
    data = decoded;
    truncated = partial;
  }
  Ok((data, truncated))
}

/// Read a decoder to its end or `max_bytes`, whichever comes first
///
/// A decoder fed a truncated prefix fails at the cut; what it produced before
/// that is still valid output.
fn read_limited<R: Read>(mut reader: R, truncated: bool, max_bytes: usize) -> Result<(Vec<u8>, bool)> {
  let mut out = Vec::new();
  let mut buf = [0u8; 8192];
  loop {
    match reader.read(&mut buf) {
      Ok(0) => return Ok((out, truncated)),
      Ok(n) => {
        out.extend_from_slice(&buf[..n]);
        if out.len() >= max_bytes {
          out.truncate(max_bytes);
          return Ok((out, true));
        }
      }
      Err(e) if truncated && !out.is_empty() => {
        tracing::trace!("decoder stopped at capture boundary: {}", e);
        return Ok((out, true));
      }
      Err(e) => return Err(Error::Decode(format!("content decoding failed: {}", e))),
    }
  }
}

/// Charset from `Content-Type`, else from an HTML meta tag
fn charset_label(content_type: Option<&str>, body: &[u8]) -> Option<String> {
  let mime = content_type.and_then(|value| value.parse::<Mime>().ok());
  if let Some(charset) = mime
    .as_ref()
    .and_then(|mime| mime.get_param(mime::CHARSET))
  {
    return Some(charset.as_str().to_string());
  }
  let is_html = mime
    .as_ref()
    .map(|mime| mime.subtype() == mime::HTML || mime.subtype() == "xhtml")
    .unwrap_or(false);
  if is_html {
    return sniff_meta_charset(body);
  }
  None
}

fn sniff_meta_charset(body: &[u8]) -> Option<String> {
  let head = &body[..body.len().min(META_SNIFF_LEN)];
  let lower = head.to_ascii_lowercase();
  let needle = b"charset=";
  let pos = lower.windows(needle.len()).position(|w| w == needle)?;
  let rest = &lower[pos + needle.len()..];
  let rest = rest
    .strip_prefix(b"\"")
    .or_else(|| rest.strip_prefix(b"'"))
    .unwrap_or(rest);
  let end = rest
    .iter()
    .position(|b| matches!(b, b'"' | b'\'' | b' ' | b';' | b'>' | b'/'))
    .unwrap_or(rest.len());
  let label = std::str::from_utf8(&rest[..end]).ok()?.trim();
  if label.is_empty() {
    None
  } else {
    Some(label.to_string())
  }
}

/// Decode with the declared label, then UTF-8, accepting only clean decodes
fn decode_charset(raw: &[u8], label: Option<&str>, truncated: bool) -> Result<String> {
  let declared = label
    .and_then(|l| Encoding::for_label(l.trim().as_bytes()))
    .unwrap_or(UTF_8);
  let candidates: &[&'static Encoding] = if declared == UTF_8 {
    &[UTF_8]
  } else {
    &[declared, UTF_8]
  };
  // A cut prefix can end inside a multi-byte sequence
  let max_trim = if truncated {
    (MAX_BYTES_PER_CHAR - 1).min(raw.len())
  } else {
    0
  };
  for encoding in candidates {
    for trim in 0..=max_trim {
      let (text, _, had_errors) = encoding.decode(&raw[..raw.len() - trim]);
      if !had_errors {
        return Ok(text.into_owned());
      }
    }
  }
  Err(Error::Decode(format!(
    "body is not valid {}",
    declared.name()
  )))
}
