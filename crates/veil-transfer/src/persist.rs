//! Session persistence
//!
//! `SessionStore` keeps one JSON snapshot per session in a directory, written
//! atomically (temp file + rename). `SessionPersister` debounces the stream
//! of snapshots a running transfer produces: workers `schedule` the latest
//! snapshot, one writer task writes it after the debounce window, and
//! `flush`/`close`/`Drop` write whatever is still pending.
//!
//! Concurrent workers go through `schedule_with`, which takes the snapshot
//! while holding the pending slot, so the slot only ever moves forward.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use veil_core::{VeilError, VeilResult};

use crate::session::SessionSnapshot;

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn open(dir: &Path) -> VeilResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomic write: key-alias fields stripped, temp file, then rename.
    pub fn write(&self, snapshot: &SessionSnapshot) -> VeilResult<()> {
        validate_id(&snapshot.id)?;
        let json = snapshot.to_json()?;
        let path = self.path_for(&snapshot.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(session = %snapshot.id, phase = %snapshot.phase, completed = snapshot.completed(), "session persisted");
        Ok(())
    }

    pub fn load(&self, id: &str) -> VeilResult<SessionSnapshot> {
        validate_id(id)?;
        let path = self.path_for(id);
        let data = std::fs::read(&path).map_err(|e| {
            VeilError::SessionCorrupt(format!("reading session {id} ({}): {e}", path.display()))
        })?;
        SessionSnapshot::from_json(&data)
    }

    /// All readable snapshots, newest first. Unreadable files are skipped.
    pub fn list(&self) -> VeilResult<Vec<SessionSnapshot>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(VeilError::from)
                .and_then(|d| SessionSnapshot::from_json(&d))
            {
                Ok(snap) => out.push(snap),
                Err(e) => warn!(path = %path.display(), "skipping unreadable session: {e}"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub fn remove(&self, id: &str) -> VeilResult<()> {
        validate_id(id)?;
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Session ids become file names; refuse anything that could escape the dir.
fn validate_id(id: &str) -> VeilResult<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(VeilError::SessionCorrupt(format!("invalid session id {id:?}")));
    }
    Ok(())
}

/// Cloneable scheduling side of a `SessionPersister`, handed to workers.
#[derive(Clone)]
pub struct PersistHandle {
    pending: Arc<Mutex<Option<SessionSnapshot>>>,
    notify: Arc<Notify>,
}

impl PersistHandle {
    /// Replace the pending snapshot and wake the writer. Never blocks on I/O.
    pub fn schedule(&self, snapshot: SessionSnapshot) {
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
        self.notify.notify_one();
    }

    /// Build the snapshot under the pending lock and schedule it. A worker
    /// that snapshots later always lands later.
    pub fn schedule_with(&self, snapshot: impl FnOnce() -> SessionSnapshot) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            *pending = Some(snapshot());
        }
        self.notify.notify_one();
    }
}

/// Debounced single-writer persistence for one session.
pub struct SessionPersister {
    store: Arc<SessionStore>,
    pending: Arc<Mutex<Option<SessionSnapshot>>>,
    /// Held across take + write so the task, `flush` and `Drop` never race.
    write_lock: Arc<Mutex<()>>,
    notify: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SessionPersister {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<SessionStore>, debounce: Duration) -> Self {
        let pending: Arc<Mutex<Option<SessionSnapshot>>> = Arc::new(Mutex::new(None));
        let write_lock = Arc::new(Mutex::new(()));
        let notify = Arc::new(Notify::new());

        let task = {
            let store = store.clone();
            let pending = pending.clone();
            let write_lock = write_lock.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                loop {
                    notify.notified().await;
                    tokio::time::sleep(debounce).await;
                    let (store, pending, write_lock) =
                        (store.clone(), pending.clone(), write_lock.clone());
                    let result = tokio::task::spawn_blocking(move || {
                        write_pending(&store, &pending, &write_lock)
                    })
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("debounced session write failed: {e}"),
                        Err(e) => warn!("session writer join failed: {e}"),
                    }
                }
            })
        };

        Self {
            store,
            pending,
            write_lock,
            notify,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> PersistHandle {
        PersistHandle {
            pending: self.pending.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn schedule(&self, snapshot: SessionSnapshot) {
        self.handle().schedule(snapshot);
    }

    /// Write the pending snapshot now.
    pub async fn flush(&self) -> VeilResult<()> {
        let (store, pending, write_lock) =
            (self.store.clone(), self.pending.clone(), self.write_lock.clone());
        tokio::task::spawn_blocking(move || write_pending(&store, &pending, &write_lock))
            .await
            .map_err(|e| VeilError::Other(anyhow::anyhow!("session flush task failed: {e}")))?
    }

    /// Schedule `snapshot` and write it before returning.
    pub async fn persist_now(&self, snapshot: SessionSnapshot) -> VeilResult<()> {
        self.schedule(snapshot);
        self.flush().await
    }

    /// Flush and stop the writer task.
    pub async fn close(mut self) -> VeilResult<()> {
        let result = self.flush().await;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        result
    }
}

impl Drop for SessionPersister {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Blocking best-effort flush; the snapshot is small.
        if let Err(e) = write_pending(&self.store, &self.pending, &self.write_lock) {
            warn!("failed to flush session on drop: {e}");
        }
    }
}

fn write_pending(
    store: &SessionStore,
    pending: &Mutex<Option<SessionSnapshot>>,
    write_lock: &Mutex<()>,
) -> VeilResult<()> {
    let _guard = write_lock.lock().unwrap_or_else(|p| p.into_inner());
    let snapshot = pending.lock().unwrap_or_else(|p| p.into_inner()).take();
    match snapshot {
        Some(snap) => store.write(&snap),
        None => Ok(()),
    }
}
