use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::HASH_PREFIX_LEN;

/// A content-addressed hash identifying a unique object.
///
/// The hash is a 20-character truncated SHA-256 of the canonical JSON form
/// of the hashed value. This provides sufficient collision resistance while
/// keeping store paths readable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types whose identity is the hash of their canonical serialized form.
///
/// Canonical means: `BTreeMap`-backed maps (sorted keys) and ordered arrays,
/// so the hash is stable under key insertion order.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, serde_json::Error> {
    let serialized = serde_json::to_string(self)?;
    Ok(hash_bytes(serialized.as_bytes()))
  }
}

/// Hash raw bytes into a truncated object hash.
pub fn hash_bytes(bytes: &[u8]) -> ObjectHash {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  let full = format!("{:x}", hasher.finalize());
  ObjectHash(full[..HASH_PREFIX_LEN].to_string())
}

/// Full (untruncated) hex SHA-256 of raw bytes, for archive verification.
pub fn sha256_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

/// Hash a file's contents without loading it whole into memory.
pub fn hash_file(path: &Path) -> io::Result<ObjectHash> {
  let mut file = File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buf = [0u8; 64 * 1024];
  loop {
    let n = file.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  let full = format!("{:x}", hasher.finalize());
  Ok(ObjectHash(full[..HASH_PREFIX_LEN].to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  #[derive(Serialize)]
  struct Sample {
    entries: BTreeMap<String, String>,
  }

  impl Hashable for Sample {}

  #[test]
  fn hash_is_stable_under_insertion_order() {
    let mut a = Sample {
      entries: BTreeMap::new(),
    };
    a.entries.insert("x".to_string(), "1".to_string());
    a.entries.insert("y".to_string(), "2".to_string());

    let mut b = Sample {
      entries: BTreeMap::new(),
    };
    b.entries.insert("y".to_string(), "2".to_string());
    b.entries.insert("x".to_string(), "1".to_string());

    assert_eq!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn hash_has_expected_length() {
    let h = hash_bytes(b"hello");
    assert_eq!(h.0.len(), HASH_PREFIX_LEN);
  }

  #[test]
  fn file_hash_matches_bytes_hash() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("f.txt");
    std::fs::write(&path, b"contents").unwrap();

    assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"contents"));
  }
}
