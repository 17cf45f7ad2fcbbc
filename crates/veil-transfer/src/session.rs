//! Resumable transfer sessions
//!
//! A `TransferSession` is owned by exactly one upload or download. Its phase
//! and metadata sit behind a mutex touched only by the engine; the per-chunk
//! completion map is lock-free so workers can record results concurrently.
//!
//! Upload:   Created → KeyReady → Uploading → ManifestPublished → [Registered] → Complete
//! Download: FetchingManifest → FetchingChunks → Reassembling → Complete
//!
//! Any non-terminal phase may move to `Aborted`; resuming re-enters the phase
//! the session was aborted from.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use veil_core::{unix_now, ChunkRecord, ContentAddress, EncapsulatedKey, VeilError, VeilResult};

use crate::manifest::ManifestFields;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Field names that could carry a raw symmetric key. Stripped from every
/// snapshot on write and on load.
pub const KEY_ALIAS_FIELDS: &[&str] = &[
    "fileKey",
    "file_key",
    "rawKey",
    "raw_key",
    "symmetricKey",
    "key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Created,
    KeyReady,
    Uploading,
    ManifestPublished,
    Registered,
    FetchingManifest,
    FetchingChunks,
    Reassembling,
    Complete,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Complete
    }

    fn belongs_to(self, direction: Direction) -> bool {
        use SessionPhase::*;
        match self {
            Created | KeyReady | Uploading | ManifestPublished | Registered => {
                direction == Direction::Upload
            }
            FetchingManifest | FetchingChunks | Reassembling => direction == Direction::Download,
            Complete | Aborted => true,
        }
    }

    /// Forward edges of the state machine (abort handled separately).
    fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Created, KeyReady)
                | (KeyReady, Uploading)
                | (Uploading, ManifestPublished)
                | (ManifestPublished, Registered)
                | (ManifestPublished, Complete)
                | (Registered, Complete)
                | (FetchingManifest, FetchingChunks)
                | (FetchingChunks, Reassembling)
                | (Reassembling, Complete)
        )
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Created => "created",
            SessionPhase::KeyReady => "key-ready",
            SessionPhase::Uploading => "uploading",
            SessionPhase::ManifestPublished => "manifest-published",
            SessionPhase::Registered => "registered",
            SessionPhase::FetchingManifest => "fetching-manifest",
            SessionPhase::FetchingChunks => "fetching-chunks",
            SessionPhase::Reassembling => "reassembling",
            SessionPhase::Complete => "complete",
            SessionPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Identity of an upload source, checked again on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFingerprint {
    pub path: PathBuf,
    pub size: u64,
    /// mtime in Unix seconds, when the platform reports one
    pub modified: Option<u64>,
}

impl SourceFingerprint {
    pub fn of(path: &Path) -> VeilResult<Self> {
        let meta = std::fs::metadata(path)?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified,
        })
    }

    /// Fail with `SessionCorrupt` if the file changed since the session began.
    pub fn check_unchanged(&self) -> VeilResult<()> {
        let now = Self::of(&self.path)?;
        if now.size != self.size {
            return Err(VeilError::SessionCorrupt(format!(
                "source {} changed size: {} → {}",
                self.path.display(),
                self.size,
                now.size
            )));
        }
        if let (Some(then), Some(current)) = (self.modified, now.modified) {
            if then != current {
                return Err(VeilError::SessionCorrupt(format!(
                    "source {} was modified since the session began",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Index-addressed write-once cells, one per chunk.
pub struct CompletionMap {
    cells: Vec<OnceLock<ChunkRecord>>,
    done: AtomicUsize,
}

impl CompletionMap {
    pub fn new(total: u64) -> Self {
        Self {
            cells: (0..total).map(|_| OnceLock::new()).collect(),
            done: AtomicUsize::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.cells.len() as u64
    }

    pub fn completed(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    pub fn all_done(&self) -> bool {
        self.completed() == self.cells.len()
    }

    pub fn is_complete(&self, index: u64) -> bool {
        self.cells
            .get(index as usize)
            .is_some_and(|c| c.get().is_some())
    }

    /// Record a finished chunk. Each index may be written once.
    pub fn record(&self, record: ChunkRecord) -> VeilResult<()> {
        let index = record.index;
        let cell = self.cells.get(index as usize).ok_or_else(|| {
            VeilError::SessionCorrupt(format!(
                "chunk index {index} out of range (total {})",
                self.cells.len()
            ))
        })?;
        cell.set(record).map_err(|_| {
            VeilError::SessionCorrupt(format!("chunk {index} recorded twice"))
        })?;
        self.done.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Completed records, ordered by index.
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.cells.iter().filter_map(|c| c.get().cloned()).collect()
    }

    pub fn missing(&self) -> Vec<u64> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.get().is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct SessionState {
    phase: SessionPhase,
    aborted_from: Option<SessionPhase>,
    fields: Option<ManifestFields>,
    owner_key: Option<EncapsulatedKey>,
    manifest_address: Option<ContentAddress>,
    source: Option<SourceFingerprint>,
    destination: Option<PathBuf>,
    owner: Option<String>,
    registered: bool,
    updated_at: u64,
}

pub struct TransferSession {
    id: String,
    direction: Direction,
    principal: String,
    created_at: u64,
    chunks: OnceLock<CompletionMap>,
    state: Mutex<SessionState>,
}

impl TransferSession {
    pub fn new_upload(principal: &str, fields: ManifestFields, source: SourceFingerprint) -> Self {
        let session = Self::blank(Direction::Upload, principal, SessionPhase::Created);
        let _ = session.chunks.set(CompletionMap::new(fields.total_chunks));
        {
            let mut st = session.lock();
            st.fields = Some(fields);
            st.source = Some(source);
        }
        session
    }

    pub fn new_download(
        principal: &str,
        manifest_address: ContentAddress,
        owner: &str,
        destination: &Path,
    ) -> Self {
        let session = Self::blank(Direction::Download, principal, SessionPhase::FetchingManifest);
        {
            let mut st = session.lock();
            st.manifest_address = Some(manifest_address);
            st.owner = Some(owner.to_string());
            st.destination = Some(destination.to_path_buf());
        }
        session
    }

    fn blank(direction: Direction, principal: &str, phase: SessionPhase) -> Self {
        let now = unix_now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            principal: principal.to_string(),
            created_at: now,
            chunks: OnceLock::new(),
            state: Mutex::new(SessionState {
                phase,
                aborted_from: None,
                fields: None,
                owner_key: None,
                manifest_address: None,
                source: None,
                destination: None,
                owner: None,
                registered: false,
                updated_at: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    /// Move forward along the state machine.
    pub fn transition(&self, next: SessionPhase) -> VeilResult<()> {
        let mut st = self.lock();
        if next == SessionPhase::Aborted {
            drop(st);
            return self.abort();
        }
        if !next.belongs_to(self.direction) || !st.phase.can_advance_to(next) {
            return Err(VeilError::SessionCorrupt(format!(
                "illegal {:?} transition {} → {next}",
                self.direction, st.phase
            )));
        }
        st.phase = next;
        st.updated_at = unix_now();
        Ok(())
    }

    /// Park a non-terminal session; completed chunks stay valid.
    pub fn abort(&self) -> VeilResult<()> {
        let mut st = self.lock();
        match st.phase {
            SessionPhase::Complete => Err(VeilError::SessionCorrupt(
                "cannot abort a complete session".into(),
            )),
            SessionPhase::Aborted => Ok(()),
            phase => {
                st.aborted_from = Some(phase);
                st.phase = SessionPhase::Aborted;
                st.updated_at = unix_now();
                Ok(())
            }
        }
    }

    /// Re-enter the phase an aborted session stopped in. A session that was
    /// interrupted without an explicit abort simply keeps its phase.
    pub fn resume(&self) -> VeilResult<SessionPhase> {
        let mut st = self.lock();
        if st.phase != SessionPhase::Aborted {
            return Ok(st.phase);
        }
        let from = st.aborted_from.take().ok_or_else(|| {
            VeilError::SessionCorrupt("aborted session does not record its prior phase".into())
        })?;
        st.phase = from;
        st.updated_at = unix_now();
        Ok(from)
    }

    pub fn chunks(&self) -> VeilResult<&CompletionMap> {
        self.chunks
            .get()
            .ok_or_else(|| VeilError::SessionCorrupt("chunk count not yet known".into()))
    }

    pub fn record(&self, record: ChunkRecord) -> VeilResult<()> {
        self.chunks()?.record(record)
    }

    pub fn fields(&self) -> Option<ManifestFields> {
        self.lock().fields.clone()
    }

    /// Adopt manifest metadata (downloads learn it from the fetched manifest).
    pub fn set_fields(&self, fields: ManifestFields) -> VeilResult<()> {
        let mut st = self.lock();
        if let Some(existing) = &st.fields {
            if existing != &fields {
                return Err(VeilError::SessionCorrupt(
                    "manifest differs from the one this session started with".into(),
                ));
            }
            return Ok(());
        }
        let _ = self.chunks.set(CompletionMap::new(fields.total_chunks));
        st.fields = Some(fields);
        Ok(())
    }

    pub fn owner_key(&self) -> Option<EncapsulatedKey> {
        self.lock().owner_key.clone()
    }

    pub fn set_owner_key(&self, key: EncapsulatedKey) {
        self.lock().owner_key = Some(key);
    }

    pub fn manifest_address(&self) -> Option<ContentAddress> {
        self.lock().manifest_address.clone()
    }

    pub fn set_manifest_address(&self, address: ContentAddress) {
        self.lock().manifest_address = Some(address);
    }

    pub fn source(&self) -> Option<SourceFingerprint> {
        self.lock().source.clone()
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.lock().destination.clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.lock().owner.clone()
    }

    pub fn registered(&self) -> bool {
        self.lock().registered
    }

    pub fn set_registered(&self) {
        self.lock().registered = true;
    }

    /// Serializable view. Carries the owner's `EncapsulatedKey` and never a
    /// `FileKey` (the session does not hold one).
    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.lock().clone();
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            id: self.id.clone(),
            direction: self.direction,
            principal: self.principal.clone(),
            phase: st.phase,
            aborted_from: st.aborted_from,
            manifest_fields: st.fields,
            completed_chunks: self.chunks.get().map(|m| m.records()).unwrap_or_default(),
            owner_encapsulated_key: st.owner_key,
            manifest_address: st.manifest_address,
            source: st.source,
            destination: st.destination,
            owner: st.owner,
            registered: st.registered,
            created_at: self.created_at,
            updated_at: st.updated_at,
        }
    }

    pub fn from_snapshot(snap: SessionSnapshot) -> VeilResult<Self> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(VeilError::SessionCorrupt(format!(
                "unsupported snapshot version {}",
                snap.version
            )));
        }
        if !snap.phase.belongs_to(snap.direction)
            || snap.aborted_from.is_some_and(|p| !p.belongs_to(snap.direction))
        {
            return Err(VeilError::SessionCorrupt(format!(
                "phase {} is not a {:?} phase",
                snap.phase, snap.direction
            )));
        }

        let chunks = OnceLock::new();
        if let Some(fields) = &snap.manifest_fields {
            let map = CompletionMap::new(fields.total_chunks);
            for record in snap.completed_chunks {
                map.record(record)?;
            }
            let _ = chunks.set(map);
        } else if !snap.completed_chunks.is_empty() {
            return Err(VeilError::SessionCorrupt(
                "completed chunks without manifest metadata".into(),
            ));
        }

        Ok(Self {
            id: snap.id,
            direction: snap.direction,
            principal: snap.principal,
            created_at: snap.created_at,
            chunks,
            state: Mutex::new(SessionState {
                phase: snap.phase,
                aborted_from: snap.aborted_from,
                fields: snap.manifest_fields,
                owner_key: snap.owner_encapsulated_key,
                manifest_address: snap.manifest_address,
                source: snap.source,
                destination: snap.destination,
                owner: snap.owner,
                registered: snap.registered,
                updated_at: snap.updated_at,
            }),
        })
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Persisted form of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub version: u32,
    pub id: String,
    pub direction: Direction,
    pub principal: String,
    pub phase: SessionPhase,
    #[serde(default)]
    pub aborted_from: Option<SessionPhase>,
    #[serde(default)]
    pub manifest_fields: Option<ManifestFields>,
    #[serde(default)]
    pub completed_chunks: Vec<ChunkRecord>,
    #[serde(default)]
    pub owner_encapsulated_key: Option<EncapsulatedKey>,
    #[serde(default)]
    pub manifest_address: Option<ContentAddress>,
    #[serde(default)]
    pub source: Option<SourceFingerprint>,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub registered: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SessionSnapshot {
    /// Serialize with key-alias fields stripped.
    pub fn to_json(&self) -> VeilResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| VeilError::SessionCorrupt(format!("serializing snapshot: {e}")))?;
        strip_key_fields(&mut value);
        serde_json::to_vec_pretty(&value)
            .map_err(|e| VeilError::SessionCorrupt(format!("serializing snapshot: {e}")))
    }

    /// Parse, dropping any key-alias field a foreign writer may have added.
    pub fn from_json(data: &[u8]) -> VeilResult<Self> {
        let mut value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| VeilError::SessionCorrupt(format!("parsing snapshot: {e}")))?;
        strip_key_fields(&mut value);
        serde_json::from_value(value)
            .map_err(|e| VeilError::SessionCorrupt(format!("parsing snapshot: {e}")))
    }

    pub fn completed(&self) -> usize {
        self.completed_chunks.len()
    }

    pub fn total_chunks(&self) -> Option<u64> {
        self.manifest_fields.as_ref().map(|f| f.total_chunks)
    }
}

/// Remove every key-alias field, at any depth.
pub fn strip_key_fields(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for alias in KEY_ALIAS_FIELDS {
                map.remove(*alias);
            }
            for v in map.values_mut() {
                strip_key_fields(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                strip_key_fields(v);
            }
        }
        _ => {}
    }
}
