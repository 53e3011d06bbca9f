//! Directory-backed shared store.
//!
//! Every key is one file in the store directory, so several client processes
//! pointed at the same directory share the session token and the election
//! records. Writes go to a temporary file that is renamed over the key, which
//! keeps readers from seeing half-written values.
//!
//! Other processes' writes are discovered by polling: [`FileStore::poll`]
//! compares the directory with the last values this store knows about and
//! reports the difference to the watchers. The store's own writes update that
//! record directly, so they are never reported back.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    rc::{Rc, Weak},
    time::Duration,
};

use kiip_core::{KeyValueStore, SharedStore, StoreChange, Subscribers, Subscription};

use crate::error::StoreError;

/// Delay between two directory scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    known: RefCell<HashMap<String, String>>,
    watchers: Subscribers<StoreChange>,
}

/// Shared store backed by one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    inner: Rc<Inner>,
}

impl FileStore {
    /// Open the store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created or read.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let known = scan(&dir)?;
        tracing::debug!(dir = %dir.display(), keys = known.len(), "store opened");

        Ok(Self { inner: Rc::new(Inner { dir, known: RefCell::new(known), watchers: Subscribers::new() }) })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Scan the directory and report values changed by other processes.
    ///
    /// Returns the number of changes delivered.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be read. Nothing is
    /// reported in that case.
    pub fn poll(&self) -> Result<usize, StoreError> {
        let current = scan(&self.inner.dir)?;
        let changes = {
            let mut known = self.inner.known.borrow_mut();
            let mut changes: Vec<StoreChange> = current
                .iter()
                .filter(|(key, value)| known.get(*key) != Some(*value))
                .map(|(key, value)| StoreChange { key: key.clone(), new_value: Some(value.clone()) })
                .collect();
            changes.extend(
                known
                    .keys()
                    .filter(|key| !current.contains_key(*key))
                    .map(|key| StoreChange { key: key.clone(), new_value: None }),
            );
            *known = current;
            changes
        };

        for change in &changes {
            tracing::trace!(key = %change.key, value = ?change.new_value, "external store write");
            self.inner.watchers.emit(change);
        }
        Ok(changes.len())
    }

    /// Poll every `interval` on the current `LocalSet` until the store and
    /// all its clones are dropped.
    pub fn spawn_poller(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner: Weak<Inner> = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = (Self { inner }).poll() {
                    tracing::warn!(error = %e, "store poll failed");
                }
            }
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if is_valid_key(key) {
            Ok(self.inner.dir.join(key))
        } else {
            Err(StoreError::InvalidKey(key.to_owned()))
        }
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn try_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let tmp = self.inner.dir.join(format!(".{key}.{}.tmp", std::process::id()));
        fs::write(&tmp, value).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        self.inner.known.borrow_mut().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn try_remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(StoreError::io(path, e)),
        }
        self.inner.known.borrow_mut().remove(key);
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.try_get(key).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "store read failed");
            None
        })
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.try_set(key, value) {
            tracing::warn!(key, error = %e, "store write failed");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.try_remove(key) {
            tracing::warn!(key, error = %e, "store remove failed");
        }
    }
}

impl SharedStore for FileStore {
    fn watch(&self, listener: Box<dyn Fn(&StoreChange)>) -> Subscription {
        self.inner.watchers.subscribe(listener)
    }
}

/// Keys become file names verbatim; hidden names are reserved for temp files.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

fn scan(dir: &Path) -> Result<HashMap<String, String>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut values = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let Ok(key) = entry.file_name().into_string() else { continue };
        if !is_valid_key(&key) {
            continue;
        }
        match fs::read_to_string(entry.path()) {
            Ok(value) => {
                values.insert(key, value);
            },
            // Removed between listing and reading.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(StoreError::io(entry.path(), e)),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(store: &FileStore) -> (Rc<RefCell<Vec<StoreChange>>>, Subscription) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let sub = store.watch(Box::new(move |change| l.borrow_mut().push(change.clone())));
        (log, sub)
    }

    #[test]
    fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("KIIP_TOKEN_V1"), None);

        store.set("KIIP_TOKEN_V1", "T1");
        assert_eq!(store.get("KIIP_TOKEN_V1").as_deref(), Some("T1"));

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("KIIP_TOKEN_V1").as_deref(), Some("T1"));

        reopened.remove("KIIP_TOKEN_V1");
        reopened.remove("KIIP_TOKEN_V1");
        assert_eq!(store.get("KIIP_TOKEN_V1"), None);
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = FileStore::open(&nested).unwrap();
        store.set("k", "v");
        assert!(nested.join("k").is_file());
        assert_eq!(store.dir(), nested);
    }

    #[test]
    fn own_writes_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let (log, _sub) = recorder(&store);

        store.set("MASTER_TAB_REQUEST", "0-abcde");
        store.remove("MASTER_TAB_ELECT");
        assert_eq!(store.poll().unwrap(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn other_process_writes_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mine = FileStore::open(dir.path()).unwrap();
        let theirs = FileStore::open(dir.path()).unwrap();
        let (log, _sub) = recorder(&mine);

        theirs.set("MASTER_TAB_ELECT", "1-00000");
        assert_eq!(mine.poll().unwrap(), 1);
        assert_eq!(*log.borrow(), vec![StoreChange {
            key: "MASTER_TAB_ELECT".into(),
            new_value: Some("1-00000".into())
        }]);

        // Unchanged directory reports nothing.
        assert_eq!(mine.poll().unwrap(), 0);

        theirs.remove("MASTER_TAB_ELECT");
        mine.poll().unwrap();
        assert_eq!(log.borrow().last(), Some(&StoreChange { key: "MASTER_TAB_ELECT".into(), new_value: None }));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn unsubscribed_watcher_is_not_called() {
        let dir = tempfile::tempdir().unwrap();
        let mine = FileStore::open(dir.path()).unwrap();
        let theirs = FileStore::open(dir.path()).unwrap();
        let (log, sub) = recorder(&mine);

        sub.unsubscribe();
        theirs.set("k", "v");
        assert_eq!(mine.poll().unwrap(), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        for key in ["", ".hidden", "../escape", "a/b", "spaced key"] {
            store.set(key, "v");
            assert_eq!(store.get(key), None, "{key:?}");
            assert!(matches!(store.try_get(key), Err(StoreError::InvalidKey(_))));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn temp_files_are_not_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let (log, _sub) = recorder(&store);

        fs::write(dir.path().join(".k.42.tmp"), "partial").unwrap();
        assert_eq!(store.poll().unwrap(), 0);
        assert!(log.borrow().is_empty());
    }

    #[tokio::test]
    async fn poller_delivers_changes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let mine = FileStore::open(dir.path()).unwrap();
                let theirs = FileStore::open(dir.path()).unwrap();
                let (log, _sub) = recorder(&mine);

                let poller = mine.spawn_poller(Duration::from_millis(5));
                theirs.set("k", "v");
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(log.borrow().len(), 1);

                drop(mine);
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(poller.is_finished());
            })
            .await;
    }
}
