//! Key-value persistence for the cache, registrations and the local secret
//!
//! Keys are `/`-separated paths such as `dundi/cache/<key>`. Any store with
//! get/put/delete and prefix delete satisfies the node.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent string store
pub trait KvStore: Send + Sync {
    fn get(&self, family: &str, key: &str) -> Option<String>;
    fn put(&self, family: &str, key: &str, value: &str) -> io::Result<()>;
    fn delete(&self, family: &str, key: &str) -> io::Result<()>;
    /// Remove every key of `family` starting with `prefix` (all keys when `None`)
    fn delete_tree(&self, family: &str, prefix: Option<&str>) -> io::Result<usize>;
    /// Keys of `family` starting with `prefix`, without the family part
    fn keys(&self, family: &str, prefix: &str) -> Vec<String>;
}

fn full_key(family: &str, key: &str) -> String {
    format!("{}/{}", family, key)
}

fn family_prefix(family: &str) -> String {
    format!("{}/", family)
}

fn remove_tree(map: &mut BTreeMap<String, String>, family: &str, prefix: Option<&str>) -> usize {
    let start = full_key(family, prefix.unwrap_or(""));
    let doomed: Vec<String> = map
        .range(start.clone()..)
        .take_while(|(k, _)| k.starts_with(&start))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &doomed {
        map.remove(key);
    }
    doomed.len()
}

fn list_keys(map: &BTreeMap<String, String>, family: &str, prefix: &str) -> Vec<String> {
    let fam = family_prefix(family);
    let start = full_key(family, prefix);
    map.range(start.clone()..)
        .take_while(|(k, _)| k.starts_with(&start))
        .map(|(k, _)| k[fam.len()..].to_string())
        .collect()
}

fn lock(map: &Mutex<BTreeMap<String, String>>) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, used by tests and nodes that do not persist state
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, family: &str, key: &str) -> Option<String> {
        lock(&self.entries).get(&full_key(family, key)).cloned()
    }

    fn put(&self, family: &str, key: &str, value: &str) -> io::Result<()> {
        lock(&self.entries).insert(full_key(family, key), value.to_string());
        Ok(())
    }

    fn delete(&self, family: &str, key: &str) -> io::Result<()> {
        lock(&self.entries).remove(&full_key(family, key));
        Ok(())
    }

    fn delete_tree(&self, family: &str, prefix: Option<&str>) -> io::Result<usize> {
        Ok(remove_tree(&mut lock(&self.entries), family, prefix))
    }

    fn keys(&self, family: &str, prefix: &str) -> Vec<String> {
        list_keys(&lock(&self.entries), family, prefix)
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Store persisted as one JSON object, rewritten after every mutation
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> io::Result<()> {
        let text = serde_json::to_string_pretty(map)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, family: &str, key: &str) -> Option<String> {
        lock(&self.entries).get(&full_key(family, key)).cloned()
    }

    fn put(&self, family: &str, key: &str, value: &str) -> io::Result<()> {
        let mut map = lock(&self.entries);
        map.insert(full_key(family, key), value.to_string());
        self.flush(&map)
    }

    fn delete(&self, family: &str, key: &str) -> io::Result<()> {
        let mut map = lock(&self.entries);
        if map.remove(&full_key(family, key)).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }

    fn delete_tree(&self, family: &str, prefix: Option<&str>) -> io::Result<usize> {
        let mut map = lock(&self.entries);
        let removed = remove_tree(&mut map, family, prefix);
        if removed > 0 {
            self.flush(&map)?;
        }
        Ok(removed)
    }

    fn keys(&self, family: &str, prefix: &str) -> Vec<String> {
        list_keys(&lock(&self.entries), family, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        store.put("dundi/cache", "a/1", "x").unwrap();
        store.put("dundi/cache", "a/2", "y").unwrap();
        store.put("dundi/cache", "b/1", "z").unwrap();
        store.put("dundi/dpeers", "a", "w").unwrap();

        assert_eq!(store.get("dundi/cache", "a/1").as_deref(), Some("x"));
        assert_eq!(store.keys("dundi/cache", "a/"), vec!["a/1".to_string(), "a/2".to_string()]);

        assert_eq!(store.delete_tree("dundi/cache", Some("a/")).unwrap(), 2);
        assert_eq!(store.get("dundi/cache", "a/1"), None);
        assert_eq!(store.get("dundi/cache", "b/1").as_deref(), Some("z"));

        store.delete("dundi/cache", "b/1").unwrap();
        assert!(store.keys("dundi/cache", "").is_empty());
        // Other families untouched
        assert_eq!(store.get("dundi/dpeers", "a").as_deref(), Some("w"));

        assert_eq!(store.delete_tree("dundi/dpeers", None).unwrap(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("astdb.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            exercise(&store);
            store.put("dundi", "secret", "abc").unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("dundi", "secret").as_deref(), Some("abc"));
    }

    #[test]
    fn test_family_prefix_not_shared() {
        let store = MemoryStore::new();
        store.put("dundi/cache", "k", "1").unwrap();
        store.put("dundi/cachex", "k", "2").unwrap();
        assert_eq!(store.delete_tree("dundi/cache", None).unwrap(), 1);
        assert_eq!(store.get("dundi/cachex", "k").as_deref(), Some("2"));
    }
}
