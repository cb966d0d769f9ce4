//! Tree value model: nested, immutable values used for computation inputs/outputs and for
//! describing filesystem content.
//!
//! A tree is either a leaf carrying a content [`Digest`] or a mapping from [`Name`] to subtree.
//! Mappings are `BTreeMap`s, so equality, hashing, ordering and serialization are all
//! independent of insertion order.

pub mod digest;
pub mod name;

pub use digest::{Digest, DigestBuilder};
pub use name::{Name, Path};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tree {
    Leaf(Digest),
    Dir(BTreeMap<Name, Tree>),
}

impl Tree {
    pub fn empty() -> Self {
        Tree::Dir(BTreeMap::new())
    }

    pub fn leaf(digest: Digest) -> Self {
        Tree::Leaf(digest)
    }

    pub fn dir(entries: impl IntoIterator<Item = (Name, Tree)>) -> Self {
        Tree::Dir(entries.into_iter().collect())
    }

    /// Wrap `tree` so that it sits at `path` inside an otherwise empty tree.
    pub fn nest(path: &Path, tree: Tree) -> Self {
        path.names()
            .iter()
            .rev()
            .fold(tree, |inner, name| Tree::dir([(name.clone(), inner)]))
    }

    /// Build a tree from `(location, value)` entries, merging them together.
    ///
    /// No entries yields the empty tree.
    pub fn from_entries(entries: impl IntoIterator<Item = (Path, Tree)>) -> Result<Self, TreeError> {
        let mut out: Option<Tree> = None;
        for (path, tree) in entries {
            let nested = Tree::nest(&path, tree);
            out = Some(match out {
                None => nested,
                Some(acc) => acc.merge(&nested)?,
            });
        }
        Ok(out.unwrap_or_else(Tree::empty))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&Digest> {
        match self {
            Tree::Leaf(d) => Some(d),
            Tree::Dir(_) => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<Name, Tree>> {
        match self {
            Tree::Leaf(_) => None,
            Tree::Dir(entries) => Some(entries),
        }
    }

    /// Descend to `path`.
    pub fn pick(&self, path: &Path) -> Result<&Tree, TreeError> {
        let mut here = self;
        for (depth, name) in path.names().iter().enumerate() {
            let walked = || Path::new(path.names()[..depth].to_vec()).to_string();
            match here {
                Tree::Leaf(_) => return Err(TreeError::PastLeaf { path: walked() }),
                Tree::Dir(entries) => {
                    here = entries.get(name).ok_or_else(|| TreeError::Missing {
                        path: walked(),
                        name: name.to_string(),
                    })?;
                }
            }
        }
        Ok(here)
    }

    /// Recursive union.
    ///
    /// Identical values merge to themselves. Two different leaves, or a leaf against a subtree,
    /// at the same location raise [`TreeError::Collision`].
    pub fn merge(&self, other: &Tree) -> Result<Tree, TreeError> {
        merge_at(self, other, &Path::root())
    }

    /// Lazy pre-order traversal in document order (names sorted), root first.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(Path::root(), self)],
        }
    }

    /// All items exactly `depth` levels below this tree.
    ///
    /// Every node above that depth must be a subtree; a leaf there means the declared nesting
    /// does not match the value, and [`TreeError::LevelMismatch`] is returned.
    pub fn iter_level(&self, depth: usize) -> Result<Vec<(Path, &Tree)>, TreeError> {
        let mut frontier = vec![(Path::root(), self)];
        for level in 0..depth {
            let mut next = Vec::new();
            for (path, tree) in frontier {
                let Tree::Dir(entries) = tree else {
                    return Err(TreeError::LevelMismatch {
                        path: path.to_string(),
                        level,
                        depth,
                    });
                };
                next.extend(entries.iter().map(|(name, child)| (path.join(name), child)));
            }
            frontier = next;
        }
        Ok(frontier)
    }

    /// Every digest referenced anywhere in the tree.
    pub fn leaves(&self) -> BTreeSet<&Digest> {
        self.walk().filter_map(|(_, tree)| tree.as_leaf()).collect()
    }

    /// Structural fingerprint of the whole tree (Merkle style).
    pub fn digest(&self) -> Digest {
        match self {
            Tree::Leaf(d) => {
                let mut b = DigestBuilder::new("leaf");
                b.field(d.as_str());
                b.finish()
            }
            Tree::Dir(entries) => {
                let mut b = DigestBuilder::new("dir");
                for (name, child) in entries {
                    b.field(name.as_str()).field(child.digest().as_str());
                }
                b.finish()
            }
        }
    }
}

fn merge_at(a: &Tree, b: &Tree, at: &Path) -> Result<Tree, TreeError> {
    match (a, b) {
        (Tree::Leaf(x), Tree::Leaf(y)) if x == y => Ok(a.clone()),
        (Tree::Dir(xs), Tree::Dir(ys)) => {
            let mut out = xs.clone();
            for (name, y) in ys {
                let merged = match xs.get(name) {
                    Some(x) => merge_at(x, y, &at.join(name))?,
                    None => y.clone(),
                };
                out.insert(name.clone(), merged);
            }
            Ok(Tree::Dir(out))
        }
        _ => Err(TreeError::Collision {
            path: at.to_string(),
        }),
    }
}

/// Iterator returned by [`Tree::walk`].
#[derive(Debug, Clone)]
pub struct Walk<'a> {
    stack: Vec<(Path, &'a Tree)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (Path, &'a Tree);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, tree) = self.stack.pop()?;
        if let Tree::Dir(entries) = tree {
            // Reverse so the smallest name is popped first.
            for (name, child) in entries.iter().rev() {
                self.stack.push((path.join(name), child));
            }
        }
        Some((path, tree))
    }
}
