//! Streaming digest used to fingerprint devices and cached binaries
//!
//! The binary cache keys everything by SHA-1: a 20-byte binary form for the
//! on-disk record headers and a 40-character lowercase hex form for cache
//! filenames.

use sha1::{Digest as _, Sha1};

/// Length of the binary digest in bytes
pub const DIGEST_LENGTH: usize = 20;

/// Streaming SHA-1 hasher
///
/// `update` is associative over concatenation: feeding `"ab"` then `"cd"`
/// produces the same digest as feeding `"abcd"` once. Finalisation consumes
/// the hasher, so a finished digest cannot be extended.
pub struct Digest {
    inner: Sha1,
}

impl Digest {
    /// Create a fresh hasher
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    /// Append bytes to the running hash
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.inner.update(bytes.as_ref());
    }

    /// Finalise into the 20-byte binary digest
    pub fn finalize(self) -> [u8; DIGEST_LENGTH] {
        self.inner.finalize().into()
    }

    /// Finalise into the 40-character lowercase hex digest
    ///
    /// This form is used as the cache filename stem.
    pub fn finalize_hex(self) -> String {
        let raw = self.finalize();
        let mut out = String::with_capacity(DIGEST_LENGTH * 2);
        for byte in raw {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let mut d = Digest::new();
        d.update("abcd");
        assert_eq!(d.finalize_hex(), "81fe8bfe87576c3ecb22426f8e57847382917acf");
    }

    #[test]
    fn test_update_is_associative() {
        let mut split = Digest::new();
        split.update("ab");
        split.update("cd");

        let mut whole = Digest::new();
        whole.update("abcd");

        assert_eq!(split.finalize(), whole.finalize());
    }

    #[test]
    fn test_empty_digest() {
        let d = Digest::new();
        assert_eq!(d.finalize_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_binary_length() {
        let mut d = Digest::new();
        d.update([0u8; 128]);
        assert_eq!(d.finalize().len(), DIGEST_LENGTH);
    }
}
