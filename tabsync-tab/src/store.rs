use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::StoreError;

pub const MAX_FLAG_BYTES: u64 = 16 * 1024;

pub trait FlagStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFlagStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryFlagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileFlagStore {
    dir: PathBuf,
}

impl FileFlagStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.flag"))
    }
}

impl FlagStore for FileFlagStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    key: key.to_owned(),
                    source,
                });
            }
        };
        if meta.len() > MAX_FLAG_BYTES {
            return Err(StoreError::TooLarge {
                key: key.to_owned(),
                size: meta.len(),
                max: MAX_FLAG_BYTES,
            });
        }

        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if value.len() as u64 > MAX_FLAG_BYTES {
            return Err(StoreError::TooLarge {
                key: key.to_owned(),
                size: value.len() as u64,
                max: MAX_FLAG_BYTES,
            });
        }
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("flag.{}.tmp", std::process::id()));
        fs::write(&tmp, value.as_bytes()).map_err(|source| StoreError::Write {
            key: key.to_owned(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StoreError::Write {
                key: key.to_owned(),
                source,
            }
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_is_shared_between_clones() {
        let a = MemoryFlagStore::new();
        let b = a.clone();
        a.set("ns:election", "{}").unwrap();
        assert_eq!(b.get("ns:election").unwrap().as_deref(), Some("{}"));
        b.remove("ns:election").unwrap();
        assert_eq!(a.get("ns:election").unwrap(), None);
    }

    #[test]
    fn file_store_roundtrip_and_missing_key() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = FileFlagStore::open(dir.path()).unwrap();

        assert_eq!(store.get("tabsync:multi-tab").unwrap(), None);
        store.set("tabsync:multi-tab", "true").unwrap();

        let other = FileFlagStore::open(dir.path()).unwrap();
        assert_eq!(other.get("tabsync:multi-tab").unwrap().as_deref(), Some("true"));

        other.remove("tabsync:multi-tab").unwrap();
        other.remove("tabsync:multi-tab").unwrap();
        assert_eq!(store.get("tabsync:multi-tab").unwrap(), None);
    }

    #[test]
    fn file_store_keys_are_sanitized() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = FileFlagStore::open(dir.path()).unwrap();
        let path = store.path_for("../escape:key");
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[test]
    fn file_store_refuses_oversized_values() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = FileFlagStore::open(dir.path()).unwrap();

        let big = "x".repeat(MAX_FLAG_BYTES as usize + 1);
        let err = store.set("k", &big).unwrap_err();
        assert!(err.to_string().contains("too large"), "unexpected error: {err}");

        fs::write(store.path_for("k"), big.as_bytes()).unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::TooLarge { .. })));
    }
}
