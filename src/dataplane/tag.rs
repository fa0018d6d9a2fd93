//! Change tags
//!
//! A tag is an opaque token attached to every forwarding decision that
//! depended on some piece of mutable state (a slave's enable flag, a bond
//! bucket assignment, the active slave, a learned MAC). When that state
//! changes, the owner hands the old tag to the control plane, which
//! revalidates every cached decision carrying it.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u32);

impl Tag {
    /// Draws a fresh random tag. Zero is never produced so that it can
    /// never be confused with "no tag".
    pub fn random() -> Self {
        loop {
            let v: u32 = rand::random();
            if v != 0 {
                return Tag(v);
            }
        }
    }

    /// Deterministic tag derived from a key, used for state that has no
    /// owner to hold a random tag (e.g. a MAC that has not been learned).
    pub fn from_key(bytes: &[u8], secret: u32) -> Self {
        let mut hasher = crc32fast::Hasher::new_with_initial(secret);
        hasher.update(bytes);
        Tag(hasher.finalize() | 1)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{:08x}", self.0)
    }
}

/// Accumulator of the tags a single decision depended on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.tags.contains(&tag)
    }

    /// True if any tag in `other` is also in this set
    pub fn intersects(&self, other: &TagSet) -> bool {
        other.tags.iter().any(|t| self.tags.contains(t))
    }

    pub fn iter(&self) -> impl Iterator<Item = Tag> + '_ {
        self.tags.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Extend<Tag> for TagSet {
    fn extend<I: IntoIterator<Item = Tag>>(&mut self, iter: I) {
        for tag in iter {
            self.insert(tag);
        }
    }
}
