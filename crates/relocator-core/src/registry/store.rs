use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;

use parking_lot::RwLock;

use super::value::{RegistryKeyPath, RegistryValue};

/// Access to a hierarchical key/value store shaped like the Windows registry.
///
/// Every call opens the key it needs; nothing is held between calls.
pub trait RegistryStore: Send + Sync {
    /// Direct child key names of `key`.
    fn subkeys(&self, key: &RegistryKeyPath) -> io::Result<Vec<String>>;

    /// Named values of `key`. The default value has an empty name.
    fn values(&self, key: &RegistryKeyPath) -> io::Result<Vec<(String, RegistryValue)>>;

    /// Write a value to an existing key.
    fn set_value(&self, key: &RegistryKeyPath, name: &str, value: &RegistryValue) -> io::Result<()>;
}

#[derive(Debug, Clone)]
struct KeyEntry {
    path: RegistryKeyPath,
    values: BTreeMap<String, RegistryValue>,
}

/// In-process registry used on hosts without a system registry and in tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    keys: RwLock<BTreeMap<String, KeyEntry>>,
    denied: RwLock<HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `key` and its parents if missing.
    pub fn create_key(&self, key: &RegistryKeyPath) {
        let mut keys = self.keys.write();
        let mut current = RegistryKeyPath::new(key.hive, "");
        Self::ensure(&mut keys, &current);
        for part in key.path.split('\\').filter(|p| !p.is_empty()) {
            current = current.join(part);
            Self::ensure(&mut keys, &current);
        }
    }

    /// Create the key if needed and store a value.
    pub fn insert(&self, key: &RegistryKeyPath, name: &str, value: RegistryValue) {
        self.create_key(key);
        if let Some(entry) = self.keys.write().get_mut(&Self::lookup(key)) {
            entry.values.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, key: &RegistryKeyPath, name: &str) -> Option<RegistryValue> {
        self.keys
            .read()
            .get(&Self::lookup(key))
            .and_then(|entry| Self::find_value(&entry.values, name).map(|(_, v)| v.clone()))
    }

    /// Make every operation on `key` fail with `PermissionDenied`, as an ACL
    /// denial would.
    pub fn deny(&self, key: &RegistryKeyPath) {
        self.denied.write().insert(Self::lookup(key));
    }

    fn ensure(keys: &mut BTreeMap<String, KeyEntry>, path: &RegistryKeyPath) {
        keys.entry(Self::lookup(path)).or_insert_with(|| KeyEntry {
            path: path.clone(),
            values: BTreeMap::new(),
        });
    }

    // Registry names compare case-insensitively.
    fn lookup(key: &RegistryKeyPath) -> String {
        key.to_string().to_lowercase()
    }

    fn find_value<'a>(
        values: &'a BTreeMap<String, RegistryValue>,
        name: &str,
    ) -> Option<(&'a String, &'a RegistryValue)> {
        values.iter().find(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    fn check_access(&self, key: &RegistryKeyPath) -> io::Result<()> {
        if self.denied.read().contains(&Self::lookup(key)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access denied: {}", key),
            ));
        }
        Ok(())
    }

    fn not_found(key: &RegistryKeyPath) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("key not found: {}", key))
    }
}

impl RegistryStore for MemoryRegistry {
    fn subkeys(&self, key: &RegistryKeyPath) -> io::Result<Vec<String>> {
        self.check_access(key)?;
        let keys = self.keys.read();
        let parent = Self::lookup(key);
        if !keys.contains_key(&parent) {
            return Err(Self::not_found(key));
        }

        let prefix = format!("{}\\", parent);
        let mut children = BTreeSet::new();
        for (lookup, entry) in keys.range(prefix.clone()..) {
            if !lookup.starts_with(&prefix) {
                break;
            }
            if lookup[prefix.len()..].contains('\\') {
                continue;
            }
            if let Some(name) = entry.path.path.rsplit('\\').next() {
                children.insert(name.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    fn values(&self, key: &RegistryKeyPath) -> io::Result<Vec<(String, RegistryValue)>> {
        self.check_access(key)?;
        self.keys
            .read()
            .get(&Self::lookup(key))
            .map(|entry| {
                entry
                    .values
                    .iter()
                    .map(|(n, v)| (n.clone(), v.clone()))
                    .collect()
            })
            .ok_or_else(|| Self::not_found(key))
    }

    fn set_value(&self, key: &RegistryKeyPath, name: &str, value: &RegistryValue) -> io::Result<()> {
        self.check_access(key)?;
        let mut keys = self.keys.write();
        let entry = keys
            .get_mut(&Self::lookup(key))
            .ok_or_else(|| Self::not_found(key))?;
        let stored_name = Self::find_value(&entry.values, name)
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| name.to_string());
        entry.values.insert(stored_name, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::value::Hive;

    fn key(path: &str) -> RegistryKeyPath {
        RegistryKeyPath::new(Hive::HkeyLocalMachine, path)
    }

    #[test]
    fn subkeys_lists_direct_children_only() {
        let reg = MemoryRegistry::new();
        reg.create_key(&key(r"SOFTWARE\Vendor\App\Sub"));
        reg.create_key(&key(r"SOFTWARE\Vendor\Tool"));

        let children = reg.subkeys(&key(r"SOFTWARE\Vendor")).unwrap();
        assert_eq!(children, vec!["App".to_string(), "Tool".to_string()]);
        assert!(reg.subkeys(&key(r"SOFTWARE\Missing")).is_err());
    }

    #[test]
    fn set_value_requires_existing_key() {
        let reg = MemoryRegistry::new();
        let err = reg
            .set_value(&key(r"SOFTWARE\Nope"), "x", &RegistryValue::DWord(1))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn names_compare_case_insensitively() {
        let reg = MemoryRegistry::new();
        reg.insert(&key(r"SOFTWARE\App"), "InstallLocation", RegistryValue::String("a".into()));
        reg.set_value(&key(r"software\app"), "installlocation", &RegistryValue::String("b".into()))
            .unwrap();

        let values = reg.values(&key(r"SOFTWARE\App")).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "InstallLocation");
        assert_eq!(values[0].1, RegistryValue::String("b".into()));
    }

    #[test]
    fn denied_key_rejects_everything() {
        let reg = MemoryRegistry::new();
        reg.insert(&key(r"SOFTWARE\Locked"), "", RegistryValue::String("x".into()));
        reg.deny(&key(r"SOFTWARE\Locked"));

        assert_eq!(
            reg.values(&key(r"SOFTWARE\Locked")).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert!(reg
            .set_value(&key(r"SOFTWARE\Locked"), "", &RegistryValue::DWord(0))
            .is_err());
    }
}
