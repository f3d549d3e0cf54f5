//! Resource tree
//!
//! A [`Resource`] holds an attribute model and typed, named children. The
//! committed tree is a graph of immutable, protected snapshots shared through
//! [`Arc`]: readers clone the root pointer and never observe a partial write,
//! while a commit builds a new root by copying only the path to each changed
//! subtree and swaps it in under a single lock.

use indexmap::IndexMap;
use mgmt_model::{ModelValue, PathAddress, PathElement};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Children of one type, keyed by name
pub type ChildMap = IndexMap<String, Arc<Resource>>;

/// A node of the configuration tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    model: ModelValue,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    children: IndexMap<String, ChildMap>,
}

impl Resource {
    /// Resource with the given attribute model and no children
    #[must_use]
    pub fn new(model: ModelValue) -> Self {
        Self {
            model,
            children: IndexMap::new(),
        }
    }

    /// Attribute model
    #[inline]
    #[must_use]
    pub fn model(&self) -> &ModelValue {
        &self.model
    }

    /// Writable attribute model
    ///
    /// Writes fail with ILLEGAL-STATE if this resource belongs to a protected
    /// snapshot.
    #[inline]
    pub fn model_mut(&mut self) -> &mut ModelValue {
        &mut self.model
    }

    /// Whether this node belongs to a committed tree
    #[inline]
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.model.is_protected()
    }

    /// Deep-freeze this resource and every unfrozen descendant
    pub fn protect(&mut self) {
        self.model.protect();
        for child in self.children.values_mut().flat_map(IndexMap::values_mut) {
            if !child.is_protected() {
                Arc::make_mut(child).protect();
            }
        }
    }

    /// Make this resource's own model writable again
    fn thaw(&mut self) {
        if self.model.is_protected() {
            self.model = self.model.clone();
        }
    }

    /// Direct child `key=name`
    #[must_use]
    pub fn child(&self, key: &str, name: &str) -> Option<&Arc<Resource>> {
        self.children.get(key).and_then(|m| m.get(name))
    }

    /// Writable child, copied out of any shared snapshot
    pub fn child_mut(&mut self, key: &str, name: &str) -> Option<&mut Resource> {
        let child = Arc::make_mut(self.children.get_mut(key)?.get_mut(name)?);
        child.thaw();
        Some(child)
    }

    /// Whether child `key=name` exists
    #[must_use]
    pub fn has_child(&self, key: &str, name: &str) -> bool {
        self.child(key, name).is_some()
    }

    /// Child types present, in insertion order
    pub fn child_types(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Names of children of `key`, in address order
    #[must_use]
    pub fn children_names(&self, key: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .children
            .get(key)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Whether any child of any type exists
    #[must_use]
    pub fn has_children(&self) -> bool {
        self.children.values().any(|m| !m.is_empty())
    }

    /// Every direct child with its address element, in address order
    #[must_use]
    pub fn children(&self) -> Vec<(PathElement, &Arc<Resource>)> {
        let mut out: Vec<_> = self
            .children
            .iter()
            .flat_map(|(key, m)| {
                m.iter()
                    .map(move |(name, child)| (PathElement::new(key.as_str(), name.as_str()), child))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Insert or replace a child
    pub fn set_child(&mut self, key: &str, name: &str, child: Arc<Resource>) {
        self.children
            .entry(key.to_string())
            .or_default()
            .insert(name.to_string(), child);
    }

    /// Detach a child, dropping its type entry when it was the last one
    pub fn remove_child(&mut self, key: &str, name: &str) -> Option<Arc<Resource>> {
        let map = self.children.get_mut(key)?;
        let removed = map.shift_remove(name);
        if map.is_empty() {
            self.children.shift_remove(key);
        }
        removed
    }

    /// Descendant at a relative address
    #[must_use]
    pub fn navigate(&self, relative: &PathAddress) -> Option<&Resource> {
        relative.iter().try_fold(self, |node, element| {
            node.child(element.key(), element.value()).map(|c| &**c)
        })
    }

    /// Writable descendant at a relative address
    ///
    /// Shared snapshots along the path are copied, and every resource on the
    /// path gets a writable model.
    pub fn navigate_mut(&mut self, relative: &PathAddress) -> Option<&mut Resource> {
        self.thaw();
        let mut node = self;
        for element in relative.iter() {
            let child = node
                .children
                .get_mut(element.key())
                .and_then(|m| m.get_mut(element.value()))?;
            node = Arc::make_mut(child);
            node.thaw();
        }
        Some(node)
    }

    /// Shared pointer to a descendant of `root`
    #[must_use]
    pub fn lookup(root: &Arc<Resource>, relative: &PathAddress) -> Option<Arc<Resource>> {
        relative.iter().try_fold(Arc::clone(root), |node, element| {
            node.child(element.key(), element.value()).cloned()
        })
    }

    /// Model rendering used by `read-resource`
    ///
    /// Non-recursive reads list each child as undefined under its type.
    #[must_use]
    pub fn to_model(&self, recursive: bool) -> ModelValue {
        let mut out = self.model.clone();
        if !out.is_defined() && self.children.is_empty() {
            return ModelValue::new_object();
        }
        for (key, map) in &self.children {
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            let rendered: ModelValue = names
                .into_iter()
                .map(|name| {
                    let value = if recursive {
                        map[name].to_model(true)
                    } else {
                        ModelValue::undefined()
                    };
                    (name.clone(), value)
                })
                .collect();
            // out is an unprotected clone; a scalar model is a TYPE-MISMATCH we skip
            let _ = out.set(key, rendered);
        }
        out
    }
}

/// The committed, process-wide resource tree
#[derive(Debug)]
pub struct ResourceTree {
    root: RwLock<Arc<Resource>>,
    generation: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new(Resource::new(ModelValue::new_object()))
    }
}

impl ResourceTree {
    /// Tree rooted at `root`, which is protected on the way in
    #[must_use]
    pub fn new(mut root: Resource) -> Self {
        root.protect();
        Self {
            root: RwLock::new(Arc::new(root)),
            generation: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        }
    }

    /// Consistent snapshot of the whole tree
    #[must_use]
    pub fn snapshot(&self) -> Arc<Resource> {
        Arc::clone(&*self.root.read())
    }

    /// Number of commits applied so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of the resource at `address`
    #[must_use]
    pub fn read(&self, address: &PathAddress) -> Option<Arc<Resource>> {
        Resource::lookup(&self.snapshot(), address)
    }

    /// Whether the committed tree has a resource at `address`
    #[must_use]
    pub fn contains(&self, address: &PathAddress) -> bool {
        self.snapshot().navigate(address).is_some()
    }

    /// Build the next root with `apply` and swap it in
    ///
    /// Commits are serialized. `apply` receives a writable copy of the
    /// current root; when it fails nothing changes.
    ///
    /// # Errors
    /// Whatever `apply` returns.
    pub fn commit<F, E>(&self, apply: F) -> Result<u64, E>
    where
        F: FnOnce(&mut Resource) -> Result<(), E>,
    {
        let _serial = self.commit_lock.lock();
        let mut next = Resource::clone(&self.snapshot());
        apply(&mut next)?;
        next.protect();
        *self.root.write() = Arc::new(next);
        Ok(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
