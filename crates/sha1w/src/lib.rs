// Wrapper for sha1 libraries.
// Piece verification is where most CPU goes, so the backend is selectable at build time:
// the pure-rust one by default, or the system one (openssl etc.) through crypto-hash.

assert_cfg::exactly_one! {
    feature = "sha1-rust",
    feature = "sha1-crypto-hash",
}

#[cfg(feature = "sha1-rust")]
pub type Sha1 = Sha1Rust;

#[cfg(feature = "sha1-crypto-hash")]
pub type Sha1 = Sha1System;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

/// Hash several slices as if they were one contiguous buffer.
pub fn sha1_of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> [u8; 20] {
    let mut h = Sha1::new();
    for p in parts {
        h.update(p);
    }
    h.finish()
}

#[cfg(feature = "sha1-rust")]
pub struct Sha1Rust {
    inner: sha1::Sha1,
}

#[cfg(feature = "sha1-rust")]
impl ISha1 for Sha1Rust {
    fn new() -> Self {
        use sha1::Digest;
        Sha1Rust {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.inner.finalize());
        out
    }
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha1System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha1 for Sha1System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA1),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Writing into an in-memory hasher doesn't fail.
        let _ = self.inner.write_all(buf);
    }

    fn finish(mut self) -> [u8; 20] {
        let result = self.inner.finish();
        debug_assert_eq!(result.len(), 20);
        let mut result_arr = [0u8; 20];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA1: [u8; 20] = [
        0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50, 0xc2,
        0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
    ];

    #[test]
    fn test_known_digest() {
        let mut h = Sha1::new();
        h.update(b"abc");
        assert_eq!(h.finish(), ABC_SHA1);
    }

    #[test]
    fn test_parts_equal_whole() {
        assert_eq!(sha1_of_parts([&b"a"[..], b"", b"bc"]), ABC_SHA1);
    }
}
