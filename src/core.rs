use std::fmt::Write;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use console::Style;
use serde::{Deserialize, Serialize};

const ANSI_BLUE: Style = Style::new().blue();

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `kumiki`, this serves two primary purposes:
/// 1. It is the identity of every build graph node and every request, derived
///    from the semantic content of the node, so that identical inputs map to
///    identical ids across process restarts.
/// 2. It fingerprints files in filesystem snapshots, so that the set of
///    changes since the last build can be computed on startup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    /// Hashes any `Hash` value under a tag, e.g. the kind of a request.
    pub fn of<T: Hash + ?Sized>(tag: &str, value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        tag.hash(&mut hasher);
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            // writing into a String cannot fail
            let _ = write!(&mut acc, "{byte:02x}");
        }

        acc
    }

    /// First 12 hex digits, enough to tell nodes apart in logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Elapsed time since `s`, styled for log lines.
pub(crate) fn as_overhead(s: Instant) -> impl std::fmt::Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash(b"kumiki");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.short().len(), 12);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn test_tagged_hash_is_stable() {
        let a = Hash32::of("dependency", "./foo.js");
        let b = Hash32::of("dependency", "./foo.js");
        let c = Hash32::of("asset_group", "./foo.js");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
