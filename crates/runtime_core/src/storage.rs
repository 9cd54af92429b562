//! Single-slot storage shared by every invocation of a runtime instance.
//!
//! Writers coordinate through etags instead of locks: the live state is an
//! immutable snapshot behind an [`ArcSwap`], and `set` retries a
//! compare-and-swap until it either lands or one of the etag rules rejects it.
//! Persistence is the only serialized step: one writer at a time replaces the
//! backing file with the snapshot that is live when it gets its turn.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

/// Version tag of the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Etag {
    /// No read has happened since the cell was created or cleared.
    #[default]
    Unread,
    /// A read confirmed the cell is empty.
    Empty,
    Tag(String),
}

impl Etag {
    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Etag::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// JSON view used by handlers: `Unread` has no representation, `Empty`
    /// is `null`.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Etag::Unread => None,
            Etag::Empty => Some(Value::Null),
            Etag::Tag(tag) => Some(Value::String(tag.clone())),
        }
    }
}

/// The etag a writer believes is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedEtag {
    /// Matches only a cell holding no value.
    Empty,
    Tag(String),
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub etag: Option<ExpectedEtag>,
    pub force: bool,
}

impl SetOptions {
    pub fn force() -> Self {
        Self {
            etag: None,
            force: true,
        }
    }

    pub fn expecting(etag: ExpectedEtag) -> Self {
        Self {
            etag: Some(etag),
            force: false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error(
        "When calling storage.set without having called storage.get before, you must specify the .force option."
    )]
    PreconditionRequired,

    #[error("Item was modified since it was read.")]
    Conflict { conflict: Option<Value> },

    #[error("failed to persist storage to {}: {message}", path.display())]
    Persist { path: PathBuf, message: String },

    #[error("failed to serialize storage value: {0}")]
    Serialize(String),
}

#[derive(Debug, Default)]
struct CellState {
    value: Option<Value>,
    etag: Etag,
}

#[derive(Debug)]
pub struct StorageCell {
    state: ArcSwap<CellState>,
    file: Option<PathBuf>,
    persist: Mutex<()>,
}

impl Default for StorageCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageCell {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(CellState::default()),
            file: None,
            persist: Mutex::new(()),
        }
    }

    /// Creates a cell seeded with `initial`, or with the contents of `file`
    /// when no initial value is given. Every later successful `set` rewrites
    /// `file`.
    pub fn open(initial: Option<Value>, file: Option<PathBuf>) -> Result<Self, StorageError> {
        let from_file = match (&initial, &file) {
            (None, Some(path)) => load_file(path),
            _ => None,
        };
        let cell = Self {
            state: ArcSwap::from_pointee(CellState::default()),
            file,
            persist: Mutex::new(()),
        };
        if let Some(seed) = initial.or(from_file).filter(|value| !value.is_null()) {
            let written = cell.swap_in(Some(seed), &SetOptions::force())?;
            if let Some(path) = &cell.file {
                let text = render(written.value.as_ref())?;
                std::fs::write(path, text).map_err(|err| persist_error(path, &err))?;
            }
        }
        Ok(cell)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn etag(&self) -> Etag {
        self.state.load().etag.clone()
    }

    /// Current value and etag, without the side effects of [`StorageCell::get`].
    pub fn peek(&self) -> (Option<Value>, Etag) {
        let state = self.state.load();
        (state.value.clone(), state.etag.clone())
    }

    /// Reads the value. Reading an empty cell records the `Empty` etag, which
    /// is the baseline later writes are checked against.
    pub fn get(&self) -> Option<Value> {
        loop {
            let current = self.state.load();
            if current.value.is_some() || current.etag != Etag::Unread {
                return current.value.clone();
            }
            let confirmed = Arc::new(CellState {
                value: None,
                etag: Etag::Empty,
            });
            let previous = self.state.compare_and_swap(&current, confirmed);
            if Arc::ptr_eq(&*previous, &*current) {
                return None;
            }
        }
    }

    /// Writes `value`; `None` or JSON `null` clears the cell. When a backing
    /// file is configured it is rewritten after the in-memory update, and a
    /// failed write does not roll that update back.
    pub async fn set(&self, value: Option<Value>, options: SetOptions) -> Result<(), StorageError> {
        self.swap_in(value, &options)?;
        let Some(path) = &self.file else {
            return Ok(());
        };

        let _turn = self.persist.lock().await;
        // Whatever is live now includes this write or a later one.
        let current = self.state.load_full();
        let text = render(current.value.as_ref())?;
        let staging = staging_path(path);
        tokio::fs::write(&staging, text)
            .await
            .map_err(|err| persist_error(path, &err))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|err| persist_error(path, &err))?;
        tracing::debug!("storage persisted to {}", path.display());
        Ok(())
    }

    fn swap_in(&self, value: Option<Value>, options: &SetOptions) -> Result<Arc<CellState>, StorageError> {
        let next = match value.filter(|value| !value.is_null()) {
            None => Arc::new(CellState::default()),
            Some(value) => {
                let etag = etag_for(&value)?;
                Arc::new(CellState {
                    value: Some(value),
                    etag: Etag::Tag(etag),
                })
            }
        };

        loop {
            let current = self.state.load();
            if next.value.is_some() {
                check_write(&current, options)?;
            }
            let previous = self.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &*current) {
                return Ok(next);
            }
        }
    }
}

fn check_write(current: &CellState, options: &SetOptions) -> Result<(), StorageError> {
    if current.etag == Etag::Unread && !options.force {
        return Err(StorageError::PreconditionRequired);
    }
    match &options.etag {
        None => Ok(()),
        Some(ExpectedEtag::Empty) if current.value.is_none() => Ok(()),
        Some(ExpectedEtag::Tag(expected)) if current.etag.as_tag() == Some(expected.as_str()) => {
            Ok(())
        }
        Some(_) => Err(StorageError::Conflict {
            conflict: current.value.clone(),
        }),
    }
}

/// Content fingerprint: identical values always produce identical etags.
pub fn etag_for(value: &Value) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(value).map_err(|err| StorageError::Serialize(err.to_string()))?;
    Ok(STANDARD.encode(Sha256::digest(&bytes)))
}

fn render(value: Option<&Value>) -> Result<String, StorageError> {
    serde_json::to_string_pretty(value.unwrap_or(&Value::Null))
        .map_err(|err| StorageError::Serialize(err.to_string()))
}

/// Sibling file the next contents are written to before replacing `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn persist_error(path: &Path, err: &std::io::Error) -> StorageError {
    StorageError::Persist {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn load_file(path: &Path) -> Option<Value> {
    if !path.is_file() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!("Failed to read storage file {}: {}", path.display(), err);
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("Failed to parse storage file {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_read_confirms_empty() {
        let cell = StorageCell::new();
        assert_eq!(cell.etag(), Etag::Unread);
        assert_eq!(cell.get(), None);
        assert_eq!(cell.etag(), Etag::Empty);
        assert_eq!(cell.etag().to_json(), Some(Value::Null));
    }

    #[tokio::test]
    async fn write_without_read_requires_force() {
        let cell = StorageCell::new();
        let err = cell
            .set(Some(json!({ "a": 1 })), SetOptions::default())
            .await
            .expect_err("precondition");
        assert!(matches!(err, StorageError::PreconditionRequired));
        assert_eq!(cell.peek().0, None);

        cell.set(Some(json!({ "a": 1 })), SetOptions::force())
            .await
            .expect("forced write");
        assert_eq!(cell.get(), Some(json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn read_then_write_derives_etag_from_content() {
        let cell = StorageCell::new();
        cell.get();
        let value = json!({ "store": "this" });
        cell.set(Some(value.clone()), SetOptions::default())
            .await
            .expect("write");

        let expected = etag_for(&value).expect("etag");
        assert_eq!(cell.etag(), Etag::Tag(expected));
    }

    #[tokio::test]
    async fn stale_etag_conflicts_with_current_value() {
        let cell = StorageCell::new();
        cell.get();
        cell.set(Some(json!({ "v": 1 })), SetOptions::default())
            .await
            .expect("first");
        let stale = cell.etag().as_tag().expect("tag").to_string();
        cell.set(Some(json!({ "v": 2 })), SetOptions::default())
            .await
            .expect("second");

        let err = cell
            .set(Some(json!({ "v": 3 })), SetOptions::expecting(ExpectedEtag::Tag(stale)))
            .await
            .expect_err("conflict");
        match err {
            StorageError::Conflict { conflict } => assert_eq!(conflict, Some(json!({ "v": 2 }))),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cell.peek().0, Some(json!({ "v": 2 })));
    }

    #[tokio::test]
    async fn empty_expectation_matches_only_an_empty_cell() {
        let cell = StorageCell::new();
        cell.get();
        cell.set(Some(json!(1)), SetOptions::expecting(ExpectedEtag::Empty))
            .await
            .expect("empty cell accepts");
        let err = cell
            .set(Some(json!(2)), SetOptions::expecting(ExpectedEtag::Empty))
            .await
            .expect_err("populated cell rejects");
        assert!(matches!(err, StorageError::Conflict { conflict: Some(_) }));
    }

    #[tokio::test]
    async fn identical_writes_keep_the_same_etag() {
        let cell = StorageCell::new();
        cell.get();
        cell.set(Some(json!({ "same": true })), SetOptions::default())
            .await
            .expect("first");
        let first = cell.etag();
        cell.set(Some(json!({ "same": true })), SetOptions::default())
            .await
            .expect("second");
        assert_eq!(cell.etag(), first);
    }

    #[tokio::test]
    async fn clearing_resets_the_read_baseline() {
        let cell = StorageCell::new();
        cell.get();
        cell.set(Some(json!("x")), SetOptions::default())
            .await
            .expect("write");
        cell.set(None, SetOptions::default()).await.expect("clear");
        assert_eq!(cell.peek(), (None, Etag::Unread));

        cell.set(Some(Value::Null), SetOptions::default())
            .await
            .expect("null clears without precondition");
        assert_eq!(cell.etag(), Etag::Unread);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_with_one_baseline_yield_one_winner() {
        let cell = Arc::new(StorageCell::new());
        cell.get();
        cell.set(Some(json!(0)), SetOptions::default())
            .await
            .expect("seed");
        let baseline = cell.etag().as_tag().expect("tag").to_string();

        let mut tasks = Vec::new();
        for n in 1..=8 {
            let cell = Arc::clone(&cell);
            let expected = ExpectedEtag::Tag(baseline.clone());
            tasks.push(tokio::spawn(async move {
                cell.set(Some(json!(n)), SetOptions::expecting(expected)).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.expect("join").is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn writes_are_persisted_pretty_printed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        let cell = StorageCell::open(None, Some(path.clone())).expect("open");
        cell.get();
        cell.set(Some(json!({ "counter": 3 })), SetOptions::default())
            .await
            .expect("write");

        let on_disk = std::fs::read_to_string(&path).expect("read");
        assert_eq!(on_disk, "{\n  \"counter\": 3\n}");

        let reopened = StorageCell::open(None, Some(path)).expect("reopen");
        assert_eq!(reopened.get(), Some(json!({ "counter": 3 })));
        assert!(reopened.etag().as_tag().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_forced_writes_leave_the_live_value_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        let cell = Arc::new(StorageCell::open(None, Some(path.clone())).expect("open"));

        for round in 0..25 {
            let mut tasks = Vec::new();
            for writer in 0..16 {
                let cell = Arc::clone(&cell);
                let value = json!({ "round": round, "writer": writer, "pad": "x".repeat(writer * 64) });
                tasks.push(tokio::spawn(async move {
                    cell.set(Some(value), SetOptions::force()).await
                }));
            }
            for task in tasks {
                task.await.expect("join").expect("write");
            }

            let on_disk: Value =
                serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("valid json");
            assert_eq!(Some(on_disk), cell.peek().0, "round {round}");
        }
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn explicit_initial_value_wins_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{"from":"file"}"#).expect("write");

        let cell = StorageCell::open(Some(json!({ "from": "seed" })), Some(path.clone())).expect("open");
        assert_eq!(cell.get(), Some(json!({ "from": "seed" })));
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(on_disk, json!({ "from": "seed" }));
    }

    #[test]
    fn unreadable_storage_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{ not json").expect("write");

        let cell = StorageCell::open(None, Some(path)).expect("open");
        assert_eq!(cell.peek(), (None, Etag::Unread));
    }

    #[tokio::test]
    async fn failed_persist_keeps_the_in_memory_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("storage.json");
        let cell = StorageCell::open(None, Some(path)).expect("open");
        cell.get();

        let err = cell
            .set(Some(json!("kept")), SetOptions::default())
            .await
            .expect_err("persist fails");
        assert!(matches!(err, StorageError::Persist { .. }));
        assert_eq!(cell.peek().0, Some(json!("kept")));
    }
}
