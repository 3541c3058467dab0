//! Structural cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One primitive component of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Bool(bool),
  Int(i64),
  Str(String),
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<i32> for KeyPart {
  fn from(n: i32) -> Self {
    KeyPart::Int(n.into())
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(n.into())
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Str(s) => write!(f, "{:?}", s),
    }
  }
}

/// Ordered tuple of primitive identifiers addressing one cache entry,
/// e.g. `["comments"]` or `["product", 7]`.
///
/// Equality and hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
  /// Start a key with a single part.
  pub fn of(part: impl Into<KeyPart>) -> Self {
    Self(vec![part.into()])
  }

  /// Build a key from any sequence of parts.
  pub fn from_parts<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Append a part, returning the extended key.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// Whether `prefix` matches the leading parts of this key.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable, fixed-length name for this key (SHA256 of its JSON form).
  pub fn fingerprint(&self) -> String {
    let input = serde_json::to_string(&self.0).unwrap_or_else(|_| self.to_string());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}", part)?;
    }
    write!(f, "]")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_structural_equality() {
    let a = CacheKey::of("product").with(7);
    let b = CacheKey::from_parts([KeyPart::from("product"), KeyPart::from(7)]);
    assert_eq!(a, b);

    let mut set = HashSet::new();
    set.insert(a);
    assert!(set.contains(&b));
  }

  #[test]
  fn test_type_matters() {
    let int = CacheKey::of("product").with(7);
    let string = CacheKey::of("product").with("7");
    assert_ne!(int, string);
    assert_ne!(int.fingerprint(), string.fingerprint());
  }

  #[test]
  fn test_display() {
    assert_eq!(CacheKey::of("product").with(7).to_string(), r#"["product",7]"#);
    assert_eq!(CacheKey::of("comments").to_string(), r#"["comments"]"#);
  }

  #[test]
  fn test_prefix() {
    let key = CacheKey::of("todos").with("done").with(true);
    assert!(key.starts_with(&CacheKey::of("todos")));
    assert!(key.starts_with(&key));
    assert!(!key.starts_with(&CacheKey::of("comments")));
    assert!(!CacheKey::of("todos").starts_with(&key));
  }

  #[test]
  fn test_fingerprint_is_stable_hex() {
    let key = CacheKey::of("comments");
    let fp = key.fingerprint();
    assert_eq!(fp.len(), 64);
    assert_eq!(fp, CacheKey::of("comments").fingerprint());
  }
}
