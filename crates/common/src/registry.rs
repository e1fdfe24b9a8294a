//! Tag-indexed registry
//!
//! `Registry<T>` is a keyed store of named objects with a secondary
//! `TagIndex` answering set queries over tags. All mutation happens under a
//! single write lock per registry, so readers never observe the entry map and
//! the tag index out of step.

use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Capability for objects that can be discovered by tag
pub trait Taggable {
    fn tags(&self) -> &BTreeSet<String>;
}

impl<T: Taggable + ?Sized> Taggable for Arc<T> {
    fn tags(&self) -> &BTreeSet<String> {
        (**self).tags()
    }
}

/// Mapping from tag to the set of keys carrying it
///
/// A tag whose last member is removed is dropped entirely.
#[derive(Debug, Clone)]
pub struct TagIndex<K: Ord> {
    tags: HashMap<String, BTreeSet<K>>,
}

impl<K: Ord> Default for TagIndex<K> {
    fn default() -> Self {
        Self {
            tags: HashMap::new(),
        }
    }
}

impl<K: Ord + Clone> TagIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag: &str, key: K) {
        self.tags.entry(tag.to_string()).or_default().insert(key);
    }

    pub fn add_all<'a, I>(&mut self, tags: I, key: &K)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.add(tag, key.clone());
        }
    }

    /// Remove `key` from `tag`, dropping the tag once it is empty
    pub fn remove(&mut self, tag: &str, key: &K) -> bool {
        let Some(members) = self.tags.get_mut(tag) else {
            return false;
        };
        let removed = members.remove(key);
        if members.is_empty() {
            self.tags.remove(tag);
        }
        removed
    }

    pub fn remove_all<'a, I>(&mut self, tags: I, key: &K)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.remove(tag, key);
        }
    }

    /// Keys under `tag`; empty if the tag is unknown
    pub fn lookup(&self, tag: &str) -> BTreeSet<K> {
        self.tags.get(tag).cloned().unwrap_or_default()
    }

    /// Keys carrying every one of `tags`
    pub fn intersection<S: AsRef<str>>(&self, tags: &[S]) -> Result<BTreeSet<K>> {
        let (first, rest) = tags.split_first().ok_or_else(|| {
            Error::InvalidQuery("tag intersection requires at least one tag".to_string())
        })?;

        let mut result = self.lookup(first.as_ref());
        for tag in rest {
            if result.is_empty() {
                break;
            }
            match self.tags.get(tag.as_ref()) {
                Some(members) => result.retain(|k| members.contains(k)),
                None => result.clear(),
            }
        }
        Ok(result)
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// All tags with at least one member, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tags.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// True if any tag set still references `key`
    pub fn references(&self, key: &K) -> bool {
        self.tags.values().any(|members| members.contains(key))
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

struct RegistryInner<T> {
    entries: BTreeMap<String, T>,
    index: TagIndex<String>,
}

impl<T: Taggable> RegistryInner<T> {
    fn detach(&mut self, name: &str) -> Option<T> {
        let obj = self.entries.remove(name)?;
        self.index.remove_all(obj.tags(), &name.to_string());
        Some(obj)
    }

    fn attach(&mut self, name: &str, obj: T) {
        let key = name.to_string();
        self.index.add_all(obj.tags(), &key);
        self.entries.insert(key, obj);
    }
}

/// Keyed store of named, taggable objects
pub struct Registry<T> {
    kind: &'static str,
    inner: RwLock<RegistryInner<T>>,
}

impl<T: Taggable + Clone> Registry<T> {
    /// Create an empty registry; `kind` names the object type in errors
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: RwLock::new(RegistryInner {
                entries: BTreeMap::new(),
                index: TagIndex::new(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Insert or replace `name`, re-indexing its tags
    pub fn register(&self, name: &str, obj: T) {
        let mut inner = self.inner.write();
        inner.detach(name);
        inner.attach(name, obj);
        debug!("Registered {} {}", self.kind, name);
    }

    /// Insert `name` only if it is not already present
    pub fn insert_new(&self, name: &str, obj: T) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(name) {
            return Err(Error::duplicate(self.kind, name));
        }
        inner.attach(name, obj);
        debug!("Registered {} {}", self.kind, name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<T> {
        self.inner
            .read()
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(self.kind, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().entries.contains_key(name)
    }

    /// Names registered under `tag`
    pub fn find(&self, tag: &str) -> BTreeSet<String> {
        self.inner.read().index.lookup(tag)
    }

    /// Names registered under every tag in `tags`
    pub fn find_all<S: AsRef<str>>(&self, tags: &[S]) -> Result<BTreeSet<String>> {
        self.inner.read().index.intersection(tags)
    }

    pub fn remove(&self, name: &str) -> Result<T> {
        let removed = self
            .inner
            .write()
            .detach(name)
            .ok_or_else(|| Error::not_found(self.kind, name))?;
        debug!("Removed {} {}", self.kind, name);
        Ok(removed)
    }

    /// Remove `name` only if `pred` holds for the current entry
    ///
    /// The check and the removal happen under the same write lock.
    pub fn remove_if<F>(&self, name: &str, pred: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.inner.write();
        if !inner.entries.get(name).map_or(false, pred) {
            return None;
        }
        inner.detach(name)
    }

    /// Remove every entry through `remove`
    pub fn clear(&self) {
        for name in self.names() {
            // Only a concurrent remover can make this fail
            let _ = self.remove(&name);
        }
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// True if some tag set still references `name`
    pub fn indexed(&self, name: &str) -> bool {
        self.inner.read().index.references(&name.to_string())
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.read().index.tags()
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &inner.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        tags: BTreeSet<String>,
    }

    fn item(tags: &[&str]) -> Item {
        Item {
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    impl Taggable for Item {
        fn tags(&self) -> &BTreeSet<String> {
            &self.tags
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_all_intersects_tags() {
        let reg = Registry::new("item");
        reg.register("a", item(&["batch", "gpu"]));
        reg.register("b", item(&["batch"]));
        reg.register("c", item(&["gpu", "web"]));

        assert_eq!(reg.find_all(&["batch"]).unwrap(), names(&["a", "b"]));
        assert_eq!(reg.find_all(&["gpu"]).unwrap(), names(&["a", "c"]));
        assert_eq!(reg.find_all(&["batch", "gpu"]).unwrap(), names(&["a"]));
        assert!(reg.find_all(&["batch", "web"]).unwrap().is_empty());
        assert!(reg.find_all(&["batch", "unknown"]).unwrap().is_empty());
    }

    #[test]
    fn test_find_all_empty_query_is_invalid() {
        let reg: Registry<Item> = Registry::new("item");
        reg.register("a", item(&["batch"]));
        let empty: [&str; 0] = [];
        assert!(matches!(reg.find_all(&empty), Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn test_find_unknown_tag_is_empty() {
        let reg: Registry<Item> = Registry::new("item");
        assert!(reg.find("nothing").is_empty());
    }

    #[test]
    fn test_remove_scrubs_tags() {
        let reg = Registry::new("item");
        reg.register("svc-a", item(&["batch"]));
        assert_eq!(reg.find_all(&["batch"]).unwrap(), names(&["svc-a"]));

        reg.remove("svc-a").unwrap();
        assert!(reg.get("svc-a").unwrap_err().is_not_found());
        assert!(reg.find_all(&["batch"]).unwrap().is_empty());
        assert!(!reg.indexed("svc-a"));
        assert!(reg.tags().is_empty());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let reg: Registry<Item> = Registry::new("item");
        assert!(reg.remove("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_register_replaces_old_tags() {
        let reg = Registry::new("item");
        reg.register("a", item(&["old"]));
        reg.register("a", item(&["new"]));

        assert!(reg.find("old").is_empty());
        assert_eq!(reg.find("new"), names(&["a"]));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_insert_new_rejects_duplicates() {
        let reg = Registry::new("item");
        reg.insert_new("a", item(&[])).unwrap();
        let err = reg.insert_new("a", item(&["x"])).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
        assert!(reg.find("x").is_empty());
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let reg = Registry::new("item");
        reg.register("a", item(&["t"]));
        assert!(reg.remove_if("a", |i| i.tags.is_empty()).is_none());
        assert!(reg.contains("a"));
        assert!(reg.remove_if("a", |i| i.tags.contains("t")).is_some());
        assert!(!reg.contains("a"));
        assert!(reg.find("t").is_empty());
    }

    #[test]
    fn test_clear_empties_index() {
        let reg = Registry::new("item");
        reg.register("a", item(&["x", "y"]));
        reg.register("b", item(&["y"]));
        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.tags().is_empty());
    }

    #[test]
    fn test_concurrent_registration_keeps_index_consistent() {
        let reg = Arc::new(Registry::new("item"));
        std::thread::scope(|s| {
            for i in 0..8 {
                let reg = reg.clone();
                s.spawn(move || {
                    for j in 0..50 {
                        let name = format!("n-{}-{}", i, j);
                        reg.register(&name, item(&["shared"]));
                        if j % 2 == 0 {
                            reg.remove(&name).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(reg.len(), 8 * 25);
        let shared = reg.find("shared");
        assert_eq!(shared.len(), 8 * 25);
        for name in reg.names() {
            assert!(shared.contains(&name));
        }
    }

    #[test]
    fn test_tag_index_drops_empty_tags() {
        let mut index: TagIndex<(String, String)> = TagIndex::new();
        let key = ("A".to_string(), "1".to_string());
        index.add("web", key.clone());
        assert!(index.contains_tag("web"));
        assert!(index.remove("web", &key));
        assert!(!index.contains_tag("web"));
        assert!(!index.remove("web", &key));
    }
}
