//! Captured request/response records, the unit written to the output file

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Header object of a captured message
///
/// Keeps first-seen name casing and order. Repeated names are folded into one
/// field with their values joined by `", "`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderFields(Vec<(String, String)>);

impl HeaderFields {
  /// Fold raw header pairs
  pub fn from_pairs<'a, I>(pairs: I) -> Self
  where
    I: IntoIterator<Item = (&'a str, &'a str)>,
  {
    let mut fields: Vec<(String, String)> = Vec::new();
    for (name, value) in pairs {
      match fields
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
      {
        Some((_, joined)) => {
          joined.push_str(", ");
          joined.push_str(value);
        }
        None => fields.push((name.to_string(), value.to_string())),
      }
    }
    HeaderFields(fields)
  }

  /// Value of a header, case-insensitive
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Number of distinct header names
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Iterate over (name, value)
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl Serialize for HeaderFields {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut map = serializer.serialize_map(Some(self.0.len()))?;
    for (name, value) in &self.0 {
      map.serialize_entry(name, value)?;
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for HeaderFields {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(HeaderFields(
      map
        .into_iter()
        .map(|(k, v)| match v {
          serde_json::Value::String(s) => (k, s),
          other => (k, other.to_string()),
        })
        .collect(),
    ))
  }
}

/// Request half of a captured entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
  /// headers
  pub headers: HeaderFields,
  /// body text, truncated to the request limit
  pub body: String,
}

/// Response half of a captured entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
  /// status code
  pub status: u16,
  /// headers
  pub headers: HeaderFields,
  /// body text, truncated to the response limit
  pub body: String,
}

/// One recorded exchange
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEntry {
  /// request method
  pub method: String,
  /// full URL
  pub url: String,
  /// request
  pub request: CapturedRequest,
  /// response
  pub response: CapturedResponse,
}
