//! Content hashing primitive shared by the fingerprint layer and the
//! invocation log.
//!
//! Produces a 20-byte digest. Upstream Shuriken specifies a BLAKE2b-160
//! digest; this crate realizes the same "20-byte opaque digest" contract on
//! top of `blake3`, truncating its 32-byte output, since no BLAKE2 crate is
//! available in this workspace's dependency stack.

use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::io::{self, Write};

pub const LEN: usize = 20;

/// A 20-byte opaque content digest. Equality is byte-equal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hash(pub [u8; LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; LEN]);

    pub fn from_bytes(bytes: [u8; LEN]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LEN] {
        &self.0
    }

    /// Hashes a single byte slice in one shot.
    pub fn of(data: &[u8]) -> Self {
        let mut w = HashWriter::new();
        w.write_all(data).expect("writing to a hasher cannot fail");
        w.finish()
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl StdHash for Hash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The digest is already uniformly distributed; folding it into a
        // u64 for HashMap/HashSet keys is cheap and collision-free in
        // practice for this use.
        state.write(&self.0);
    }
}

/// An incremental hasher that can be fed bytes from multiple sources (e.g.
/// stat metadata followed by file content) before finalizing into a [`Hash`].
pub struct HashWriter {
    inner: blake3::Hasher,
}

impl HashWriter {
    pub fn new() -> Self {
        HashWriter {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Hashes a length-prefixed chunk so that e.g. `["a", "bc"]` and
    /// `["ab", "c"]` never collide.
    pub fn update_framed(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(&(data.len() as u64).to_le_bytes());
        self.inner.update(data);
        self
    }

    pub fn finish(&self) -> Hash {
        let digest = self.inner.finalize();
        let mut out = [0u8; LEN];
        out.copy_from_slice(&digest.as_bytes()[..LEN]);
        Hash(out)
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_hash() {
        assert_eq!(Hash::of(b"hello"), Hash::of(b"hello"));
    }

    #[test]
    fn different_bytes_different_hash() {
        assert_ne!(Hash::of(b"hello"), Hash::of(b"world"));
    }

    #[test]
    fn framing_prevents_concatenation_collisions() {
        let mut a = HashWriter::new();
        a.update_framed(b"a").update_framed(b"bc");
        let mut b = HashWriter::new();
        b.update_framed(b"ab").update_framed(b"c");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn hex_round_trips_through_display() {
        let h = Hash::of(b"round trip");
        assert_eq!(h.to_hex().len(), LEN * 2);
        assert_eq!(format!("{h}"), h.to_hex());
    }
}
