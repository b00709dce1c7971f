//! Content-addressed hashing primitives
//!
//! Provides [`ContentHash`], a strongly-typed 32-byte digest tagged with the
//! algorithm that produced it. Digests render as `"<algorithm>:<hex>"`
//! (for example `sha256:9f86d0...`) so persisted state stays self-describing.

use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Hash algorithm used for content addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (default, matches persisted state written by other tools)
    #[default]
    Sha256,
    /// Blake3 (faster, same digest width)
    Blake3,
}

impl HashAlgorithm {
    /// Prefix used in the rendered digest
    #[inline]
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Start an incremental hasher for this algorithm
    #[must_use]
    pub fn hasher(self) -> StreamingHasher {
        match self {
            Self::Sha256 => StreamingHasher::Sha256(sha2::Sha256::new()),
            Self::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher for large inputs
#[derive(Debug, Clone)]
pub enum StreamingHasher {
    /// SHA-256 state
    Sha256(sha2::Sha256),
    /// Blake3 state
    Blake3(Box<blake3::Hasher>),
}

impl StreamingHasher {
    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and produce the digest
    #[must_use]
    pub fn finalize(self) -> ContentHash {
        match self {
            Self::Sha256(h) => ContentHash::new(HashAlgorithm::Sha256, h.finalize().into()),
            Self::Blake3(h) => ContentHash::new(HashAlgorithm::Blake3, *h.finalize().as_bytes()),
        }
    }
}

/// A 32-byte content hash tagged with its algorithm
///
/// Immutable and cheap to clone (Copy). Two hashes are equal only when both
/// the algorithm and the digest bytes match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    bytes: [u8; 32],
}

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(algorithm: HashAlgorithm, bytes: [u8; 32]) -> Self {
        Self { algorithm, bytes }
    }

    /// Algorithm that produced this digest
    #[inline]
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Create hash from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    #[inline]
    pub fn from_slice(algorithm: HashAlgorithm, bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::new(algorithm, arr))
    }

    /// Compute the digest of arbitrary data
    #[must_use]
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// SHA-256 digest of data
    #[inline]
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(HashAlgorithm::Sha256, data)
    }

    /// Short string representation (first 16 hex chars, no prefix)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..8])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(self.bytes))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, digest) = s
            .split_once(':')
            .ok_or_else(|| HashError::MissingPrefix(s.to_string()))?;
        let algorithm = prefix.parse()?;
        let bytes = hex::decode(digest)?;
        Self::from_slice(algorithm, &bytes)
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ContentHashVisitor;

        impl serde::de::Visitor<'_> for ContentHashVisitor {
            type Value = ContentHash;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a digest string like \"sha256:<64 hex chars>\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(ContentHashVisitor)
    }
}

/// Errors that can occur when working with content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Digest string has no `<algorithm>:` prefix
    #[error("digest is missing an algorithm prefix: '{0}'")]
    MissingPrefix(String),

    /// Prefix names an algorithm we do not know
    #[error("unknown hash algorithm: '{0}'")]
    UnknownAlgorithm(String),

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        let h1 = ContentHash::sha256(b"hello world");
        let h2 = ContentHash::sha256(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_different_hash() {
        assert_ne!(ContentHash::sha256(b"data1"), ContentHash::sha256(b"data2"));
    }

    #[test]
    fn sha256_known_vector() {
        let hash = ContentHash::sha256(b"test");
        assert_eq!(
            hash.to_string(),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn algorithms_never_compare_equal() {
        let sha = ContentHash::compute(HashAlgorithm::Sha256, b"x");
        let blake = ContentHash::compute(HashAlgorithm::Blake3, b"x");
        assert_ne!(sha, blake);
        assert!(blake.to_string().starts_with("blake3:"));
    }

    #[test]
    fn display_and_parse() {
        let hash = ContentHash::compute(HashAlgorithm::Blake3, b"test");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            "abcdef".parse::<ContentHash>(),
            Err(HashError::MissingPrefix(_))
        ));
        assert!(matches!(
            "md5:abcd".parse::<ContentHash>(),
            Err(HashError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            "sha256:abcd".parse::<ContentHash>(),
            Err(HashError::InvalidLength { expected: 32, actual: 2 })
        ));
    }

    #[test]
    fn streaming_matches_one_shot() {
        for alg in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let mut hasher = alg.hasher();
            hasher.update(b"hello ");
            hasher.update(b"world");
            assert_eq!(hasher.finalize(), ContentHash::compute(alg, b"hello world"));
        }
    }

    #[test]
    fn short_is_prefix_of_hex() {
        let hash = ContentHash::sha256(b"test");
        let short = hash.short();
        assert_eq!(short.len(), 16);
        assert!(hash.to_string().contains(&short));
    }

    #[test]
    fn serde_json_as_string() {
        let hash = ContentHash::sha256(b"test");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let decoded: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, decoded);
    }
}
