//! Cache keys and versions.
//!
//! Keys are built from an ordered list of heterogeneous components and
//! encoded as a MessagePack array. Every component carries its own type and
//! length tag, so `("a", "bc")` and `("ab", "c")` never collide the way a
//! plain string concatenation would.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::Result;

/// Opaque identifier of a cached artifact.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    /// Build a key from its components.
    ///
    /// Pass a tuple or slice; it is encoded as one MessagePack array.
    ///
    /// ```
    /// use model::CacheKey;
    ///
    /// let a = CacheKey::new(&("thumbnail", "album/cat.jpg", "800")).unwrap();
    /// let b = CacheKey::new(&("thumbnail", "album/cat.jpg", "100")).unwrap();
    /// assert_ne!(a, b);
    /// ```
    pub fn new<T: Serialize + ?Sized>(components: &T) -> Result<Self> {
        Ok(Self(rmp_serde::to_vec(components)?))
    }

    /// Build a key from raw bytes previously obtained from [`CacheKey::as_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Derive a sibling key namespaced below this one.
    pub fn derive(&self, suffix: &str) -> Result<Self> {
        CacheKey::new(&(serde_bytes::Bytes::new(&self.0), suffix))
    }

    /// The encoded key. No guarantees are made about its format; in
    /// particular it is not a safe file name.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(\"{}\")", self.0.escape_ascii())
    }
}

/// Freshness tag of a cached artifact. Compared byte-for-byte, never
/// interpreted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheVersion(Vec<u8>);

impl CacheVersion {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Version derived from a file's modification time and size.
    pub fn fingerprint(modified: SystemTime, size: u64) -> Self {
        let (secs, nanos) = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
        };

        let mut bytes = Vec::with_capacity(20);
        bytes.extend_from_slice(&secs.to_be_bytes());
        bytes.extend_from_slice(&nanos.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheVersion(\"{}\")", self.0.escape_ascii())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_components_are_delimited() {
        let a = CacheKey::new(&("a", "bc")).unwrap();
        let b = CacheKey::new(&("ab", "c")).unwrap();
        assert_ne!(a, b);

        let c = CacheKey::new(&("", "abc")).unwrap();
        let d = CacheKey::new(&("abc", "")).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn test_arity_is_part_of_the_key() {
        let two = CacheKey::new(&("a", "b")).unwrap();
        let one = CacheKey::new(&("ab",)).unwrap();
        let nested = CacheKey::new(&(("a", "b"),)).unwrap();
        assert_ne!(two, one);
        assert_ne!(two, nested);
    }

    #[test]
    fn test_types_are_part_of_the_key() {
        let string = CacheKey::new(&("0",)).unwrap();
        let int = CacheKey::new(&(0u32,)).unwrap();
        let boolean = CacheKey::new(&(false,)).unwrap();
        assert_ne!(string, int);
        assert_ne!(int, boolean);
    }

    #[test]
    fn test_heterogeneous_components_are_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("e", "f");
        let a = CacheKey::new(&("a", 0, vec!["c", "d"], &map, false)).unwrap();
        let b = CacheKey::new(&("a", 0, vec!["c", "d"], &map, false)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes()[0], 0x95); // fixarray of five
    }

    #[test]
    fn test_derive() {
        let key = CacheKey::new(&("thumbnail", "a.jpg")).unwrap();
        let ver = key.derive("ver").unwrap();
        assert_ne!(key, ver);
        assert_eq!(ver, key.derive("ver").unwrap());
        assert_ne!(ver, key.derive("data").unwrap());

        // A derived key cannot be forged from ordinary string components.
        let forged = CacheKey::new(&(std::str::from_utf8(key.as_bytes()).unwrap_or(""), "ver"))
            .unwrap();
        assert_ne!(ver, forged);
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let key = CacheKey::new(&("imagemeta", "x.png")).unwrap();
        assert_eq!(CacheKey::from_bytes(key.as_bytes().to_vec()), key);
    }

    #[test]
    fn test_debug_is_printable() {
        let key = CacheKey::new(&("a",)).unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.starts_with("CacheKey(\""));
    }

    #[test]
    fn test_fingerprint() {
        let t = UNIX_EPOCH + Duration::new(1_500_000_000, 42);
        let v1 = CacheVersion::fingerprint(t, 1024);
        let v2 = CacheVersion::fingerprint(t, 1024);
        assert_eq!(v1, v2);

        assert_ne!(v1, CacheVersion::fingerprint(t, 1025));
        assert_ne!(v1, CacheVersion::fingerprint(t + Duration::from_nanos(1), 1024));
        assert_ne!(
            CacheVersion::fingerprint(UNIX_EPOCH - Duration::from_secs(5), 0),
            CacheVersion::fingerprint(UNIX_EPOCH + Duration::from_secs(5), 0)
        );
    }

    #[test]
    fn test_version_from_bytes() {
        let v = CacheVersion::from_bytes(b"v1".to_vec());
        assert_eq!(v.as_bytes(), b"v1");
        assert_eq!(v, CacheVersion::from_bytes("v1"));
    }
}
