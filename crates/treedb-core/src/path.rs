//! Slash-separated paths addressing locations in the database tree.

use std::fmt;
use std::sync::Arc;

/// An immutable sequence of child keys.
///
/// The empty path is the root. Cloning is cheap: pieces are shared behind an
/// `Arc` and [`Path::pop_front`] advances an offset instead of copying.
#[derive(Clone)]
pub struct Path {
    pieces: Arc<[String]>,
    start: usize,
}

impl Path {
    /// The root (empty) path.
    pub fn root() -> Path {
        Path {
            pieces: Vec::new().into(),
            start: 0,
        }
    }

    /// Parses a slash-separated path string. Empty components are skipped,
    /// so `"/a//b/"` and `"a/b"` both address the same location.
    pub fn new(path: &str) -> Path {
        let pieces: Vec<String> = path
            .split('/')
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect();
        Path {
            pieces: pieces.into(),
            start: 0,
        }
    }

    /// Builds a path from already-split child keys.
    pub fn from_pieces(pieces: Vec<String>) -> Path {
        Path {
            pieces: pieces.into(),
            start: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.pieces.len()
    }

    /// Number of child keys in this path.
    pub fn len(&self) -> usize {
        self.pieces.len() - self.start
    }

    /// First child key, or `None` for the root path.
    pub fn front(&self) -> Option<&str> {
        self.pieces.get(self.start).map(|p| p.as_str())
    }

    /// Last child key, or `None` for the root path.
    pub fn back(&self) -> Option<&str> {
        if self.is_empty() {
            None
        } else {
            Some(self.pieces[self.pieces.len() - 1].as_str())
        }
    }

    /// The path with the first key removed. The root path pops to itself.
    pub fn pop_front(&self) -> Path {
        let start = if self.is_empty() {
            self.start
        } else {
            self.start + 1
        };
        Path {
            pieces: self.pieces.clone(),
            start,
        }
    }

    /// The path addressing `key` under this path. `key` may itself be a
    /// slash-separated string.
    pub fn child(&self, key: &str) -> Path {
        let mut pieces: Vec<String> = self.pieces[self.start..].to_vec();
        pieces.extend(key.split('/').filter(|p| !p.is_empty()).map(|p| p.to_string()));
        Path {
            pieces: pieces.into(),
            start: 0,
        }
    }

    /// This path extended by all keys of `other`.
    pub fn child_path(&self, other: &Path) -> Path {
        let mut pieces: Vec<String> = self.pieces[self.start..].to_vec();
        pieces.extend(other.pieces().map(|p| p.to_string()));
        Path {
            pieces: pieces.into(),
            start: 0,
        }
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            let pieces: Vec<String> = self.pieces[self.start..self.pieces.len() - 1].to_vec();
            Some(Path {
                pieces: pieces.into(),
                start: 0,
            })
        }
    }

    /// Iterates the child keys front to back.
    pub fn pieces(&self) -> impl Iterator<Item = &str> {
        self.pieces[self.start..].iter().map(|p| p.as_str())
    }

    /// Returns `true` when `other` is this path or a descendant of it.
    pub fn contains(&self, other: &Path) -> bool {
        if other.len() < self.len() {
            return false;
        }
        self.pieces().zip(other.pieces()).all(|(a, b)| a == b)
    }

    /// The remainder of this path below `ancestor`, or `None` when this path
    /// is not at or below `ancestor`.
    pub fn relative_to(&self, ancestor: &Path) -> Option<Path> {
        if ancestor.contains(self) {
            Some(Path {
                pieces: self.pieces.clone(),
                start: self.start + ancestor.len(),
            })
        } else {
            None
        }
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        self.len() == other.len() && self.pieces().zip(other.pieces()).all(|(a, b)| a == b)
    }
}

impl Eq for Path {}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "/");
        }
        for piece in self.pieces() {
            write!(f, "/{piece}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl From<&str> for Path {
    fn from(path: &str) -> Path {
        Path::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!(Path::new("/a/b/c").to_string(), "/a/b/c");
        assert_eq!(Path::new("a/b").to_string(), "/a/b");
        assert_eq!(Path::new("/a//b/").to_string(), "/a/b");
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(Path::new("").to_string(), "/");
    }

    #[test]
    fn front_and_pop() {
        let p = Path::new("/a/b");
        assert_eq!(p.front(), Some("a"));
        let p = p.pop_front();
        assert_eq!(p.front(), Some("b"));
        let p = p.pop_front();
        assert!(p.is_empty());
        assert!(p.pop_front().is_empty());
    }

    #[test]
    fn child_and_parent() {
        let p = Path::new("/a");
        assert_eq!(p.child("b"), Path::new("/a/b"));
        assert_eq!(p.child("b/c"), Path::new("/a/b/c"));
        assert_eq!(Path::new("/a/b").parent(), Some(Path::new("/a")));
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn relative_to_ancestor() {
        let p = Path::new("/a/b/c");
        assert_eq!(p.relative_to(&Path::new("/a")), Some(Path::new("/b/c")));
        assert_eq!(p.relative_to(&Path::new("/a/b/c")), Some(Path::root()));
        assert_eq!(p.relative_to(&Path::root()), Some(Path::new("/a/b/c")));
        assert_eq!(p.relative_to(&Path::new("/x")), None);
        assert_eq!(Path::new("/a").relative_to(&Path::new("/a/b")), None);
    }

    #[test]
    fn contains_is_prefix_check() {
        assert!(Path::new("/a").contains(&Path::new("/a/b")));
        assert!(Path::new("/a").contains(&Path::new("/a")));
        assert!(Path::root().contains(&Path::new("/a")));
        assert!(!Path::new("/a/b").contains(&Path::new("/a")));
        assert!(!Path::new("/a").contains(&Path::new("/b")));
    }

    #[test]
    fn popped_paths_compare_by_remaining_pieces() {
        let p = Path::new("/a/b").pop_front();
        assert_eq!(p, Path::new("/b"));
    }
}
