use std::{cell::RefCell, collections::BTreeMap, fmt};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry key {0} does not exist")]
    NotFound(String),
    #[error("access to registry key {0} denied")]
    AccessDenied(String),
    #[error("registry operation on {key} failed: {message}")]
    Other { key: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    String(String),
    Dword(u32),
}

impl From<&str> for RegistryValue {
    fn from(value: &str) -> Self {
        RegistryValue::String(value.to_string())
    }
}

impl From<String> for RegistryValue {
    fn from(value: String) -> Self {
        RegistryValue::String(value)
    }
}

impl From<u32> for RegistryValue {
    fn from(value: u32) -> Self {
        RegistryValue::Dword(value)
    }
}

impl fmt::Display for RegistryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryValue::String(value) => write!(f, "{value}"),
            RegistryValue::Dword(value) => write!(f, "{value}"),
        }
    }
}

/// Name of a key's default value.
pub const DEFAULT_VALUE: &str = "";

/// Minimal view on a per-user registry hive. Key paths are relative to the
/// hive root and use backslashes.
pub trait RegistryBackend {
    /// Creates `key` including missing parents and sets the given values.
    fn set_values(&self, key: &str, values: &[(&str, RegistryValue)]) -> Result<(), RegistryError>;

    /// Deletes `key` with all sub keys. Fails with [`RegistryError::NotFound`]
    /// if there is nothing to delete.
    fn delete_tree(&self, key: &str) -> Result<(), RegistryError>;

    fn get_value(&self, key: &str, name: &str) -> Result<Option<RegistryValue>, RegistryError>;

    fn key_exists(&self, key: &str) -> Result<bool, RegistryError>;
}

impl<T: RegistryBackend + ?Sized> RegistryBackend for &T {
    fn set_values(&self, key: &str, values: &[(&str, RegistryValue)]) -> Result<(), RegistryError> {
        (**self).set_values(key, values)
    }

    fn delete_tree(&self, key: &str) -> Result<(), RegistryError> {
        (**self).delete_tree(key)
    }

    fn get_value(&self, key: &str, name: &str) -> Result<Option<RegistryValue>, RegistryError> {
        (**self).get_value(key, name)
    }

    fn key_exists(&self, key: &str) -> Result<bool, RegistryError> {
        (**self).key_exists(key)
    }
}

/// Registry kept in memory, for tests and dry runs.
///
/// Key names are compared case-sensitively, unlike the real registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    keys: RefCell<BTreeMap<String, BTreeMap<String, RegistryValue>>>,
    denied_prefixes: RefCell<Vec<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write or delete below `prefix` fail with access denied.
    pub fn deny_access(&self, prefix: impl Into<String>) {
        self.denied_prefixes.borrow_mut().push(prefix.into());
    }

    /// All keys that hold values, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.keys.borrow().keys().cloned().collect()
    }

    pub fn values(&self, key: &str) -> Option<BTreeMap<String, RegistryValue>> {
        self.keys.borrow().get(key).cloned()
    }

    fn check_access(&self, key: &str) -> Result<(), RegistryError> {
        if self
            .denied_prefixes
            .borrow()
            .iter()
            .any(|prefix| is_same_or_below(key, prefix))
        {
            return Err(RegistryError::AccessDenied(key.to_string()));
        }
        Ok(())
    }
}

fn is_same_or_below(key: &str, parent: &str) -> bool {
    key == parent
        || key
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('\\'))
}

impl RegistryBackend for MemoryRegistry {
    fn set_values(&self, key: &str, values: &[(&str, RegistryValue)]) -> Result<(), RegistryError> {
        self.check_access(key)?;
        let mut keys = self.keys.borrow_mut();
        let stored = keys.entry(key.to_string()).or_default();
        for (name, value) in values {
            stored.insert(name.to_string(), value.clone());
        }
        Ok(())
    }

    fn delete_tree(&self, key: &str) -> Result<(), RegistryError> {
        self.check_access(key)?;
        let mut keys = self.keys.borrow_mut();
        let before = keys.len();
        keys.retain(|existing, _| !is_same_or_below(existing, key));
        if keys.len() == before {
            return Err(RegistryError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn get_value(&self, key: &str, name: &str) -> Result<Option<RegistryValue>, RegistryError> {
        let keys = self.keys.borrow();
        match keys.get(key) {
            Some(values) => Ok(values.get(name).cloned()),
            None if self.key_exists(key)? => Ok(None),
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    fn key_exists(&self, key: &str) -> Result<bool, RegistryError> {
        Ok(self
            .keys
            .borrow()
            .keys()
            .any(|existing| is_same_or_below(existing, key)))
    }
}
