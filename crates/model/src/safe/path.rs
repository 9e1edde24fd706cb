//! Sandboxed relative paths.
//!
//! Every path segment that arrives from a URL passes through
//! [`RelativePath::new`] before it is joined onto a base directory. The
//! validator is a five-state scanner over the characters of the candidate:
//!
//! | input  | `Begin`    | `AfterSlash` | `Dot1`   | `Dot2`   | `Safe`       |
//! |--------|------------|--------------|----------|----------|--------------|
//! | NUL    | reject     | reject       | reject   | reject   | reject       |
//! | `/`    | reject     | reject       | reject   | reject   | `AfterSlash` |
//! | `.`    | `Dot1`     | `Dot1`       | `Dot2`   | `Safe`   | `Safe`       |
//! | other  | `Safe`     | `Safe`       | `Safe`   | `Safe`   | `Safe`       |
//!
//! The candidate is accepted iff the scan ends in `Begin` (empty input) or
//! `Safe`. Accepted paths are returned unchanged.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ModelError, Result};

/// Scanner state while validating a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Start of input.
    Begin,
    /// Previous character was a separator between two components.
    AfterSlash,
    /// One leading dot of a component.
    Dot1,
    /// Two leading dots of a component.
    Dot2,
    /// Inside a component known not to be empty, `.` or `..`.
    Safe,
}

/// Advance the scanner by one character. `None` rejects the input.
fn transition(state: ScanState, c: char) -> Option<ScanState> {
    use ScanState::*;

    match (c, state) {
        ('\0', _) => None,

        ('/', Begin) => None,
        ('/', AfterSlash) => None,
        ('/', Dot1) => None,
        ('/', Dot2) => None,
        ('/', Safe) => Some(AfterSlash),

        ('.', Begin | AfterSlash) => Some(Dot1),
        ('.', Dot1) => Some(Dot2),
        ('.', Dot2 | Safe) => Some(Safe),

        (_, _) => Some(Safe),
    }
}

/// Returns true if `candidate` is a possibly empty, normalized, relative
/// path without NUL bytes.
pub fn is_safe_relative_path(candidate: &str) -> bool {
    let mut state = ScanState::Begin;
    for c in candidate.chars() {
        match transition(state, c) {
            Some(next) => state = next,
            None => return false,
        }
    }
    matches!(state, ScanState::Begin | ScanState::Safe)
}

/// A validated, normalized, non-absolute path. May be empty (the root).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    /// Validate an untrusted path string.
    pub fn new(candidate: &str) -> Result<Self> {
        if !is_safe_relative_path(candidate) {
            return Err(ModelError::UnsafePath(candidate.to_string()));
        }
        Ok(Self(candidate.to_string()))
    }

    /// The empty path.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Borrow the raw path string. Empty for the root.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The last component, or an empty string for the root.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Join another relative path onto this one.
    ///
    /// Both sides are already normalized, so the result is too.
    pub fn join(&self, other: &RelativePath) -> RelativePath {
        if self.is_root() {
            return other.clone();
        }
        if other.is_root() {
            return self.clone();
        }
        RelativePath(format!("{}/{}", self.0, other.0))
    }

    /// Join a single directory entry name onto this path.
    pub fn join_name(&self, name: &str) -> Result<RelativePath> {
        if name.is_empty() || name.contains('/') {
            return Err(ModelError::UnsafePath(name.to_string()));
        }
        Ok(self.join(&RelativePath::new(name)?))
    }

    /// Resolve this path below `base`.
    pub fn to_path(&self, base: &Path) -> PathBuf {
        if self.is_root() {
            base.to_path_buf()
        } else {
            base.join(&self.0)
        }
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<&str> for RelativePath {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self> {
        RelativePath::new(value)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for RelativePath {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RelativePath::new(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Independent component-based definition of a safe path.
    fn reference_is_safe(candidate: &str) -> bool {
        if candidate.is_empty() {
            return true;
        }
        if candidate.contains('\0') {
            return false;
        }
        candidate
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
    }

    #[test]
    fn test_empty_is_root() {
        let path = RelativePath::new("").unwrap();
        assert!(path.is_root());
        assert_eq!(path, RelativePath::root());
        assert_eq!(path.to_string(), ".");
    }

    #[test]
    fn test_accepts_ordinary_paths_unchanged() {
        for candidate in [
            "a",
            "photos",
            "photos/2019",
            "photos/2019/IMG_0001.JPG",
            ".hidden",
            "a/.hidden",
            "...",
            "a/.../b",
            "..a",
            "a..",
            "a.b",
            "name with spaces/ümlaut.png",
            "\\..\\windows",
        ] {
            let path = RelativePath::new(candidate).unwrap();
            assert_eq!(path.as_str(), candidate);
        }
    }

    #[test]
    fn test_rejects_traversal_payloads() {
        for candidate in [
            "..",
            ".",
            "../",
            "../etc/passwd",
            "a/../../etc/passwd",
            "a/..",
            "a/../b",
            "./a",
            "a/./b",
            "a/.",
            "/",
            "/etc/passwd",
            "//etc",
            "a//b",
            "a/",
            "a/b/",
            "a\0b",
            "\0",
            "a/\0/b",
            "images/..\0/x",
        ] {
            assert!(
                RelativePath::new(candidate).is_err(),
                "accepted unsafe path {:?}",
                candidate
            );
        }
    }

    #[test]
    fn test_rejected_error_carries_input() {
        let err = RelativePath::new("../x").unwrap_err();
        assert!(matches!(err, ModelError::UnsafePath(ref p) if p == "../x"));
    }

    #[test]
    fn test_scanner_matches_component_definition_exhaustively() {
        // Every string of length <= 5 over the interesting alphabet.
        let alphabet = ['a', '.', '/', '\0'];
        let mut candidates = vec![String::new()];
        let mut frontier = vec![String::new()];
        for _ in 0..5 {
            let mut next = Vec::new();
            for prefix in &frontier {
                for c in alphabet {
                    let mut s = prefix.clone();
                    s.push(c);
                    next.push(s);
                }
            }
            candidates.extend(next.iter().cloned());
            frontier = next;
        }

        for candidate in &candidates {
            assert_eq!(
                is_safe_relative_path(candidate),
                reference_is_safe(candidate),
                "mismatch for {:?}",
                candidate
            );
        }
    }

    #[test]
    fn test_transition_table() {
        use ScanState::*;

        for state in [Begin, AfterSlash, Dot1, Dot2, Safe] {
            assert_eq!(transition(state, '\0'), None);
            assert_eq!(transition(state, 'x'), Some(Safe));
        }
        assert_eq!(transition(Begin, '/'), None);
        assert_eq!(transition(AfterSlash, '/'), None);
        assert_eq!(transition(Dot1, '/'), None);
        assert_eq!(transition(Dot2, '/'), None);
        assert_eq!(transition(Safe, '/'), Some(AfterSlash));
        assert_eq!(transition(Begin, '.'), Some(Dot1));
        assert_eq!(transition(AfterSlash, '.'), Some(Dot1));
        assert_eq!(transition(Dot1, '.'), Some(Dot2));
        assert_eq!(transition(Dot2, '.'), Some(Safe));
        assert_eq!(transition(Safe, '.'), Some(Safe));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(RelativePath::root().file_name(), "");
        assert_eq!(RelativePath::new("a").unwrap().file_name(), "a");
        assert_eq!(RelativePath::new("a/b/c.jpg").unwrap().file_name(), "c.jpg");
    }

    #[test]
    fn test_join() {
        let root = RelativePath::root();
        let a = RelativePath::new("a").unwrap();
        let bc = RelativePath::new("b/c").unwrap();

        assert_eq!(root.join(&a), a);
        assert_eq!(a.join(&root), a);
        assert_eq!(a.join(&bc).as_str(), "a/b/c");
        assert!(is_safe_relative_path(a.join(&bc).as_str()));
    }

    #[test]
    fn test_join_name() {
        let dir = RelativePath::new("album").unwrap();
        assert_eq!(dir.join_name("x.png").unwrap().as_str(), "album/x.png");
        assert_eq!(
            RelativePath::root().join_name("x.png").unwrap().as_str(),
            "x.png"
        );
        assert!(dir.join_name("").is_err());
        assert!(dir.join_name("..").is_err());
        assert!(dir.join_name("a/b").is_err());
    }

    #[test]
    fn test_to_path() {
        let base = Path::new("/srv/images");
        assert_eq!(RelativePath::root().to_path(base), PathBuf::from("/srv/images"));
        assert_eq!(
            RelativePath::new("a/b.jpg").unwrap().to_path(base),
            PathBuf::from("/srv/images/a/b.jpg")
        );
    }

    #[test]
    fn test_serde_json() {
        let path = RelativePath::new("a/b.jpg").unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"a/b.jpg\"");

        let decoded: RelativePath = serde_json::from_str("\"a/b.jpg\"").unwrap();
        assert_eq!(decoded, path);

        assert!(serde_json::from_str::<RelativePath>("\"../b.jpg\"").is_err());
        assert!(serde_json::from_str::<RelativePath>("\"/abs\"").is_err());
    }
}
