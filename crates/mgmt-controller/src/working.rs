//! Per-context working copies
//!
//! A [`WorkingTree`] holds the subtrees a context has taken for update, keyed
//! by the lock root that covers them. Entries never overlap: opening an entry
//! above existing ones grafts them in. `None` records that nothing exists at
//! the entry address (removed, or not yet created).

use crate::error::OperationFailure;
use crate::resource::Resource;
use mgmt_model::{ModelValue, PathAddress};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct WorkingTree {
    entries: BTreeMap<PathAddress, Option<Resource>>,
}

impl WorkingTree {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry key covering `address`
    fn covering(&self, address: &PathAddress) -> Option<&PathAddress> {
        self.entries
            .range(..=address.clone())
            .rev()
            .map(|(k, _)| k)
            .find(|k| k.is_prefix_of(address))
    }

    /// Current view of `address`: working copy when covered, else `committed`
    pub(crate) fn read(
        &self,
        committed: &Arc<Resource>,
        address: &PathAddress,
    ) -> Option<Arc<Resource>> {
        let Some(key) = self.covering(address) else {
            return Resource::lookup(committed, address);
        };
        let entry = self.entries.get(key)?.as_ref()?;
        let relative = address.relative_to(key).ok()?;
        entry.navigate(&relative).map(|r| Arc::new(r.clone()))
    }

    /// Whether something exists at `address` in the current view
    pub(crate) fn exists(&self, committed: &Arc<Resource>, address: &PathAddress) -> bool {
        match self.covering(address) {
            None => committed.navigate(address).is_some(),
            Some(key) => {
                let Ok(relative) = address.relative_to(key) else {
                    return false;
                };
                self.entries
                    .get(key)
                    .and_then(Option::as_ref)
                    .and_then(|e| e.navigate(&relative))
                    .is_some()
            }
        }
    }

    /// Make sure an entry covering `address` exists, opening one at `root`
    ///
    /// `root` must be a prefix of `address`.
    fn open(
        &mut self,
        committed: &Arc<Resource>,
        root: &PathAddress,
        address: &PathAddress,
    ) -> Result<PathAddress, OperationFailure> {
        if let Some(key) = self.covering(address) {
            return Ok(key.clone());
        }
        let mut entry = committed.navigate(root).cloned();
        let inner: Vec<PathAddress> = self
            .entries
            .range(root.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| root.is_prefix_of(k))
            .cloned()
            .collect();
        for key in inner {
            let value = self.entries.remove(&key).flatten();
            let relative = key.relative_to(root)?;
            match entry.as_mut() {
                Some(base) => graft(base, &relative, value)?,
                None if value.is_none() => {}
                None => {
                    return Err(OperationFailure::illegal_state(format!(
                        "working copy of {key} has no parent in {root}"
                    )))
                }
            }
        }
        self.entries.insert(root.clone(), entry);
        Ok(root.clone())
    }

    /// Writable resource at `address`
    pub(crate) fn for_update(
        &mut self,
        committed: &Arc<Resource>,
        root: &PathAddress,
        address: &PathAddress,
    ) -> Result<&mut Resource, OperationFailure> {
        let key = self.open(committed, root, address)?;
        let relative = address.relative_to(&key)?;
        self.entries
            .get_mut(&key)
            .and_then(Option::as_mut)
            .and_then(|e| e.navigate_mut(&relative))
            .ok_or_else(|| OperationFailure::ResourceNotFound(address.clone()))
    }

    /// Create an empty resource at `address`
    pub(crate) fn create(
        &mut self,
        committed: &Arc<Resource>,
        root: &PathAddress,
        address: &PathAddress,
    ) -> Result<&mut Resource, OperationFailure> {
        if self.exists(committed, address) {
            return Err(OperationFailure::AlreadyExists(address.clone()));
        }
        let parent = address.parent()?;
        if !self.exists(committed, &parent) {
            return Err(OperationFailure::ResourceNotFound(parent));
        }
        let key = self.open(committed, root, address)?;
        let fresh = Resource::new(ModelValue::new_object());
        let slot = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| OperationFailure::illegal_state("working entry vanished"))?;
        if key == *address {
            return Ok(slot.insert(fresh));
        }
        let relative = address.relative_to(&key)?;
        let element = relative
            .last()
            .ok_or_else(|| OperationFailure::illegal_state("empty relative address"))?
            .clone();
        let parent_node = slot
            .as_mut()
            .and_then(|e| e.navigate_mut(&relative.parent().unwrap_or_default()))
            .ok_or_else(|| OperationFailure::ResourceNotFound(parent.clone()))?;
        parent_node.set_child(element.key(), element.value(), Arc::new(fresh));
        let child = parent_node
            .child_mut(element.key(), element.value())
            .ok_or_else(|| OperationFailure::illegal_state("created child vanished"))?;
        Ok(child)
    }

    /// Detach the resource at `address`
    pub(crate) fn remove(
        &mut self,
        committed: &Arc<Resource>,
        root: &PathAddress,
        address: &PathAddress,
    ) -> Result<Resource, OperationFailure> {
        if address.is_empty() {
            return Err(OperationFailure::illegal_state("the root resource cannot be removed"));
        }
        if !self.exists(committed, address) {
            return Err(OperationFailure::ResourceNotFound(address.clone()));
        }
        let key = self.open(committed, root, address)?;
        let slot = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| OperationFailure::illegal_state("working entry vanished"))?;
        if key == *address {
            return slot
                .take()
                .ok_or_else(|| OperationFailure::ResourceNotFound(address.clone()));
        }
        let relative = address.relative_to(&key)?;
        let parent = relative.parent()?;
        let element = relative
            .last()
            .ok_or_else(|| OperationFailure::illegal_state("empty relative address"))?;
        slot.as_mut()
            .and_then(|e| e.navigate_mut(&parent))
            .and_then(|p| p.remove_child(element.key(), element.value()))
            .map(|detached| Arc::try_unwrap(detached).unwrap_or_else(|shared| (*shared).clone()))
            .ok_or_else(|| OperationFailure::ResourceNotFound(address.clone()))
    }

    /// Write every entry into `root`, the copy about to be committed
    pub(crate) fn apply(self, root: &mut Resource) -> Result<(), OperationFailure> {
        for (key, entry) in self.entries {
            let Some(element) = key.last().cloned() else {
                match entry {
                    Some(resource) => *root = resource,
                    None => {
                        return Err(OperationFailure::illegal_state(
                            "the root resource cannot be removed",
                        ))
                    }
                }
                continue;
            };
            let parent_address = key.parent()?;
            let parent = root.navigate_mut(&parent_address).ok_or_else(|| {
                OperationFailure::illegal_state(format!("parent of {key} vanished before commit"))
            })?;
            match entry {
                Some(resource) => {
                    parent.set_child(element.key(), element.value(), Arc::new(resource));
                }
                None => {
                    parent.remove_child(element.key(), element.value());
                }
            }
        }
        Ok(())
    }
}

/// Place `value` at `relative` inside `base`
fn graft(
    base: &mut Resource,
    relative: &PathAddress,
    value: Option<Resource>,
) -> Result<(), OperationFailure> {
    let Some(element) = relative.last() else {
        if let Some(resource) = value {
            *base = resource;
        }
        return Ok(());
    };
    let parent = base.navigate_mut(&relative.parent()?).ok_or_else(|| {
        OperationFailure::illegal_state(format!("no parent for working copy at {relative}"))
    })?;
    match value {
        Some(resource) => parent.set_child(element.key(), element.value(), Arc::new(resource)),
        None => {
            parent.remove_child(element.key(), element.value());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceTree;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn addr(text: &str) -> PathAddress {
        text.parse().unwrap()
    }

    fn committed() -> Arc<Resource> {
        let mut root = Resource::new(ModelValue::new_object());
        let mut web = Resource::new(ModelValue::from_json(json!({"enabled": true})));
        web.set_child("connector", "http", Arc::new(Resource::default()));
        root.set_child("subsystem", "web", Arc::new(web));
        ResourceTree::new(root).snapshot()
    }

    #[test]
    fn updates_are_invisible_to_committed_snapshot() {
        let base = committed();
        let mut working = WorkingTree::default();
        let web = addr("/subsystem=web");
        working
            .for_update(&base, &web, &web)
            .unwrap()
            .model_mut()
            .set("enabled", false)
            .unwrap();

        let seen = working.read(&base, &web).unwrap();
        assert!(!seen.model().get("enabled").unwrap().as_bool().unwrap());
        let original = base.navigate(&web).unwrap();
        assert!(original.model().get("enabled").unwrap().as_bool().unwrap());
    }

    #[test]
    fn repeated_update_aliases_same_copy() {
        let base = committed();
        let mut working = WorkingTree::default();
        let web = addr("/subsystem=web");
        working.for_update(&base, &web, &web).unwrap().model_mut().set("a", 1).unwrap();
        let again = working.for_update(&base, &web, &web).unwrap();
        assert_eq!(again.model().get("a").unwrap().as_i64().unwrap(), 1);
        assert_eq!(working.len(), 1);
    }

    #[test]
    fn create_rejects_duplicates_and_orphans() {
        let base = committed();
        let mut working = WorkingTree::default();
        let jca = addr("/subsystem=jca");
        working.create(&base, &jca, &jca).unwrap();
        assert!(matches!(
            working.create(&base, &jca, &jca),
            Err(OperationFailure::AlreadyExists(_))
        ));
        let orphan = addr("/subsystem=missing/pool=default");
        assert!(matches!(
            working.create(&base, &orphan, &orphan),
            Err(OperationFailure::ResourceNotFound(_))
        ));
    }

    #[test]
    fn child_created_under_new_parent_is_covered_by_parent_entry() {
        let base = committed();
        let mut working = WorkingTree::default();
        let ra = addr("/subsystem=jca/resource-adapter=test");
        let parent = addr("/subsystem=jca");
        working.create(&base, &parent, &parent).unwrap();
        working
            .create(&base, &parent, &ra)
            .unwrap()
            .model_mut()
            .set("archive", "test.rar")
            .unwrap();
        assert!(working.exists(&base, &ra));
        assert_eq!(working.len(), 1);

        let mut root = Resource::clone(&base);
        working.apply(&mut root).unwrap();
        assert_eq!(
            root.navigate(&ra).unwrap().model().get("archive").unwrap().as_str().unwrap(),
            "test.rar"
        );
    }

    #[test]
    fn opening_ancestor_grafts_inner_entries() {
        let base = committed();
        let mut working = WorkingTree::default();
        let http = addr("/subsystem=web/connector=http");
        let web = addr("/subsystem=web");
        working
            .for_update(&base, &http, &http)
            .unwrap()
            .model_mut()
            .set("port", 8081)
            .unwrap();
        working.for_update(&base, &web, &web).unwrap();
        assert_eq!(working.len(), 1);
        let seen = working.read(&base, &http).unwrap();
        assert_eq!(seen.model().get("port").unwrap().as_i64().unwrap(), 8081);
    }

    #[test]
    fn remove_then_apply_detaches_subtree() {
        let base = committed();
        let mut working = WorkingTree::default();
        let web = addr("/subsystem=web");
        let detached = working.remove(&base, &web, &web).unwrap();
        assert!(detached.has_child("connector", "http"));
        assert!(!working.exists(&base, &web));
        assert!(working.read(&base, &addr("/subsystem=web/connector=http")).is_none());

        let mut root = Resource::clone(&base);
        working.apply(&mut root).unwrap();
        assert!(root.navigate(&web).is_none());
    }

    #[test]
    fn removing_missing_resource_is_not_found() {
        let base = committed();
        let mut working = WorkingTree::default();
        let jca = addr("/subsystem=jca");
        assert!(matches!(
            working.remove(&base, &jca, &jca),
            Err(OperationFailure::ResourceNotFound(_))
        ));
        assert!(working.is_empty());
    }
}
