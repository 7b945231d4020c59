//! In-memory path tree of resident records.
//!
//! Intermediate nodes are created lazily on insert and pruned as soon as they
//! become empty, so the tree never holds dangling branches.

use crate::error::{CacheError, Result};
use crate::path::CachePath;
use crate::record::Shared;
use std::collections::hash_map::{self, HashMap};

/// A tree node: a resident record or a nested mapping.
#[derive(Debug)]
pub enum Node<T> {
    Leaf(Shared<T>),
    Branch(HashMap<String, Node<T>>),
}

/// Path-indexed tree of shared records.
#[derive(Debug)]
pub struct PathTree<T> {
    root: HashMap<String, Node<T>>,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self {
            root: HashMap::new(),
        }
    }
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record at `path` without creating anything.
    pub fn resolve(&self, path: &CachePath) -> Option<&Shared<T>> {
        let (leaf, parents) = path.segments().split_last()?;
        let mut map = &self.root;
        for segment in parents {
            match map.get(segment)? {
                Node::Branch(children) => map = children,
                Node::Leaf(_) => return None,
            }
        }
        match map.get(leaf)? {
            Node::Leaf(record) => Some(record),
            Node::Branch(_) => None,
        }
    }

    /// Check that a leaf could be stored at `path`.
    ///
    /// Fails if a leaf sits where `path` needs a branch, or a branch sits at
    /// the leaf key.
    pub fn check_shape(&self, path: &CachePath) -> Result<()> {
        let Some((leaf, parents)) = path.segments().split_last() else {
            return Err(conflict(path));
        };
        let mut probe = Some(&self.root);
        for segment in parents {
            probe = match probe.and_then(|map| map.get(segment)) {
                Some(Node::Branch(children)) => Some(children),
                Some(Node::Leaf(_)) => return Err(conflict(path)),
                None => None,
            };
        }
        match probe.and_then(|map| map.get(leaf)) {
            Some(Node::Branch(_)) => Err(conflict(path)),
            _ => Ok(()),
        }
    }

    /// Set the record at `path`, creating missing branches.
    ///
    /// Returns the record previously stored there.
    pub fn insert(&mut self, path: &CachePath, record: Shared<T>) -> Result<Option<Shared<T>>> {
        // Check the shape first so a conflict leaves no half-built branch.
        self.check_shape(path)?;
        let Some((leaf, parents)) = path.segments().split_last() else {
            return Err(conflict(path));
        };

        let mut map = &mut self.root;
        for segment in parents {
            map = match map
                .entry(segment.clone())
                .or_insert_with(|| Node::Branch(HashMap::new()))
            {
                Node::Branch(children) => children,
                Node::Leaf(_) => return Err(conflict(path)),
            };
        }
        match map.insert(leaf.clone(), Node::Leaf(record)) {
            Some(Node::Leaf(previous)) => Ok(Some(previous)),
            _ => Ok(None),
        }
    }

    /// Remove the record at `path` and prune emptied ancestors.
    pub fn remove(&mut self, path: &CachePath) -> Option<Shared<T>> {
        remove_in(&mut self.root, path.segments())
    }

    /// Keep only the records for which `keep` returns true.
    ///
    /// Every leaf is visited exactly once; branches emptied at any depth are
    /// pruned. Returns the number of removed records.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&CachePath, &Shared<T>) -> bool,
    {
        let mut prefix = CachePath::default();
        retain_in(&mut self.root, &mut prefix, &mut keep)
    }

    /// Lazy traversal over every resident record and its path.
    pub fn iter(&self) -> Leaves<'_, T> {
        Leaves {
            stack: vec![(CachePath::default(), self.root.iter())],
        }
    }

    pub fn clear(&mut self) {
        self.root.clear();
    }

    /// Number of resident records.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Number of intermediate nodes.
    pub fn branch_count(&self) -> usize {
        fn count<T>(map: &HashMap<String, Node<T>>) -> usize {
            map.values()
                .map(|node| match node {
                    Node::Branch(children) => 1 + count(children),
                    Node::Leaf(_) => 0,
                })
                .sum()
        }
        count(&self.root)
    }
}

fn conflict(path: &CachePath) -> CacheError {
    CacheError::PathConflict {
        type_name: String::new(),
        path: path.to_string(),
    }
}

fn remove_in<T>(map: &mut HashMap<String, Node<T>>, segments: &[String]) -> Option<Shared<T>> {
    let (head, rest) = segments.split_first()?;
    if rest.is_empty() {
        return match map.remove(head)? {
            Node::Leaf(record) => Some(record),
            branch => {
                // Not a leaf; put it back untouched.
                map.insert(head.clone(), branch);
                None
            }
        };
    }

    let Node::Branch(children) = map.get_mut(head)? else {
        return None;
    };
    let removed = remove_in(children, rest);
    if children.is_empty() {
        map.remove(head);
    }
    removed
}

fn retain_in<T, F>(map: &mut HashMap<String, Node<T>>, prefix: &mut CachePath, keep: &mut F) -> usize
where
    F: FnMut(&CachePath, &Shared<T>) -> bool,
{
    let mut removed = 0;
    map.retain(|segment, node| {
        prefix.push(segment.clone());
        let retained = match node {
            Node::Leaf(record) => {
                let kept = keep(prefix, record);
                if !kept {
                    removed += 1;
                }
                kept
            }
            Node::Branch(children) => {
                removed += retain_in(children, &mut *prefix, &mut *keep);
                !children.is_empty()
            }
        };
        prefix.pop();
        retained
    });
    removed
}

/// Iterator over `(path, record)` pairs of a [`PathTree`].
pub struct Leaves<'a, T> {
    stack: Vec<(CachePath, hash_map::Iter<'a, String, Node<T>>)>,
}

impl<'a, T> Iterator for Leaves<'a, T> {
    type Item = (CachePath, &'a Shared<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, iter) = self.stack.last_mut()?;
            match iter.next() {
                Some((segment, Node::Leaf(record))) => {
                    let mut path = prefix.clone();
                    path.push(segment.clone());
                    return Some((path, record));
                }
                Some((segment, Node::Branch(children))) => {
                    let mut path = prefix.clone();
                    path.push(segment.clone());
                    self.stack.push((path, children.iter()));
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
