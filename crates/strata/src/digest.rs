//! Content digests identifying diffs and layer chains.
//!
//! Two digest identities exist side by side:
//!
//! - [`DiffId`] identifies the uncompressed byte content of a single diff,
//!   independent of where it sits in a chain.
//! - [`ChainId`] identifies a layer *including its ancestry*: a base layer's
//!   chain id equals its diff id, and a child's chain id is the digest of
//!   `"<parent chain id>:<diff id>"`.
//!
//! Both render as `sha256:<hex>` strings. Two layers with identical content
//! but different ancestry therefore have distinct chain ids, while identical
//! content under an identical parent converges on the same chain id and is
//! stored once.
//!
//! [`DigestingReader`] computes a [`DiffId`] over a stream while it is being
//! consumed, so registration can hash a diff in the same pass that applies it.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// The digest algorithm prefix used by all identifiers.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// A digest string was not of the form `sha256:<64 hex chars>`.
#[derive(Debug, thiserror::Error)]
#[error("invalid digest: {0}")]
pub struct InvalidDigest(pub String);

fn validate(s: &str) -> std::result::Result<(), InvalidDigest> {
    let hex_part = s
        .strip_prefix(DIGEST_ALGORITHM)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| InvalidDigest(s.to_string()))?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(InvalidDigest(s.to_string()));
    }
    Ok(())
}

fn format_digest(raw: impl AsRef<[u8]>) -> String {
    format!("{}:{}", DIGEST_ALGORITHM, hex::encode(raw))
}

/// Content-only identity of a single diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiffId(String);

impl DiffId {
    /// Build a diff id from a finalized sha256 digest.
    pub(crate) fn from_raw_digest(raw: impl AsRef<[u8]>) -> Self {
        DiffId(format_digest(raw))
    }

    /// The full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DiffId {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        validate(s)?;
        Ok(DiffId(s.to_string()))
    }
}

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-and-ancestry identity of a read-only layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(String);

impl ChainId {
    /// Derive the chain id for a diff registered under `parent`.
    ///
    /// Without a parent the chain id is the diff id itself; with one it is
    /// `sha256("<parent>:<diff>")`.
    pub fn derive(parent: Option<&ChainId>, diff: &DiffId) -> Self {
        match parent {
            None => ChainId(diff.as_str().to_string()),
            Some(parent) => {
                let mut hasher = Sha256::new();
                hasher.update(parent.as_str().as_bytes());
                hasher.update(b":");
                hasher.update(diff.as_str().as_bytes());
                ChainId(format_digest(hasher.finalize()))
            }
        }
    }

    /// The full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part, without the algorithm prefix. Used as an on-disk key.
    pub fn encoded(&self) -> &str {
        // Validated at construction, the separator is always present.
        &self.0[DIGEST_ALGORITHM.len() + 1..]
    }
}

impl FromStr for ChainId {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        validate(s)?;
        Ok(ChainId(s.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reader adapter that digests and counts every byte read through it.
///
/// Registration streams a diff through this while handing it to the backend,
/// so the digest covers exactly the bytes the diff contained. The caller is
/// responsible for draining the stream to the end before finalizing; a
/// backend that stops reading early must not truncate the identity.
#[derive(Debug)]
pub struct DigestingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> DigestingReader<R> {
    /// Wrap a reader, digesting everything subsequently read from it.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Total number of bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Finalize the digest, returning the diff id and the byte count.
    pub fn finalize(self) -> (DiffId, u64) {
        (DiffId::from_raw_digest(self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.count += n as u64;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_of_base_layer_equals_diff_id() {
        let diff: DiffId = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .parse()
            .unwrap();
        let chain = ChainId::derive(None, &diff);
        assert_eq!(chain.as_str(), diff.as_str());
    }

    #[test]
    fn test_chain_id_depends_on_ancestry() {
        let diff: DiffId = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .parse()
            .unwrap();
        let p1: ChainId = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
            .parse()
            .unwrap();
        let p2: ChainId = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc"
            .parse()
            .unwrap();

        let c1 = ChainId::derive(Some(&p1), &diff);
        let c2 = ChainId::derive(Some(&p2), &diff);
        assert_ne!(c1, c2, "same content under different parents must differ");

        // Deterministic for identical inputs.
        assert_eq!(c1, ChainId::derive(Some(&p1), &diff));
    }

    #[test]
    fn test_chain_id_derivation_is_digest_of_parent_and_diff() {
        let diff: DiffId = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .parse()
            .unwrap();
        let parent: ChainId =
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
                .parse()
                .unwrap();

        let expected = {
            let mut h = Sha256::new();
            h.update(format!("{}:{}", parent.as_str(), diff.as_str()).as_bytes());
            format!("sha256:{}", hex::encode(h.finalize()))
        };
        assert_eq!(ChainId::derive(Some(&parent), &diff).as_str(), expected);
    }

    #[test]
    fn test_digest_parsing_rejects_malformed_strings() {
        assert!("sha256:short".parse::<DiffId>().is_err());
        assert!("md5:0123".parse::<ChainId>().is_err());
        assert!(
            "sha256:zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
                .parse::<DiffId>()
                .is_err()
        );
    }

    #[test]
    fn test_encoded_strips_algorithm_prefix() {
        let chain: ChainId =
            "sha256:dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd"
                .parse()
                .unwrap();
        assert_eq!(chain.encoded().len(), 64);
        assert!(!chain.encoded().contains(':'));
    }

    #[test]
    fn test_digesting_reader_matches_direct_hash() {
        let data = b"some diff content";
        let mut reader = DigestingReader::new(&data[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let (diff_id, count) = reader.finalize();

        assert_eq!(out, data);
        assert_eq!(count, data.len() as u64);

        let direct = {
            let mut h = Sha256::new();
            h.update(data);
            format!("sha256:{}", hex::encode(h.finalize()))
        };
        assert_eq!(diff_id.as_str(), direct);
    }
}
