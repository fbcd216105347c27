use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::LocalStoreError;
use crate::model::SessionRecord;

const SESSION_KEY_PREFIX: &str = "tarot_session_";

/// Browser-storage style string key/value persistence.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError>;
    fn remove(&self, key: &str) -> Result<(), LocalStoreError>;
}

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

pub fn load_session(
    store: &dyn LocalStore,
    session_id: &str,
) -> Result<Option<SessionRecord>, LocalStoreError> {
    match store.get(&session_key(session_id))? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn save_session(store: &dyn LocalStore, record: &SessionRecord) -> Result<(), LocalStoreError> {
    let raw = serde_json::to_string(record)?;
    store.set(&session_key(&record.id), &raw)
}

pub fn remove_session(store: &dyn LocalStore, session_id: &str) -> Result<(), LocalStoreError> {
    store.remove(&session_key(session_id))
}

#[derive(Default)]
pub struct MemoryLocalStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per entry under a directory.
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LocalStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_local_session_id, DEFAULT_DECK_ID};
    use chrono::Utc;

    #[test]
    fn snapshot_round_trips_under_session_key() {
        let store = MemoryLocalStore::new();
        let record = SessionRecord::new(new_local_session_id(), DEFAULT_DECK_ID, None, Utc::now());
        save_session(&store, &record).unwrap();
        assert_eq!(store.keys(), vec![format!("tarot_session_{}", record.id)]);
        assert_eq!(load_session(&store, &record.id).unwrap(), Some(record.clone()));

        remove_session(&store, &record.id).unwrap();
        assert_eq!(load_session(&store, &record.id).unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_handles() {
        let dir = std::env::temp_dir().join(format!("reading-session-{}", uuid::Uuid::new_v4()));
        let store = FileLocalStore::open(&dir).unwrap();
        store.set("tarot_browser_fingerprint", "fp-1").unwrap();

        let reopened = FileLocalStore::open(&dir).unwrap();
        assert_eq!(
            reopened.get("tarot_browser_fingerprint").unwrap().as_deref(),
            Some("fp-1")
        );
        reopened.remove("tarot_browser_fingerprint").unwrap();
        reopened.remove("tarot_browser_fingerprint").unwrap();
        assert_eq!(store.get("tarot_browser_fingerprint").unwrap(), None);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let store = MemoryLocalStore::new();
        store.set(&session_key("local_x"), "{not json").unwrap();
        assert!(matches!(
            load_session(&store, "local_x"),
            Err(LocalStoreError::Serde(_))
        ));
    }
}
