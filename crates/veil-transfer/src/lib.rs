//! veil-transfer: the confidential transfer engine
//!
//! Upload:   unlock keypair → FileKey → encapsulate for owner → WorkerPool(seal + put)
//!           → publish manifest → sign registration → AccessLedger::register_file
//! Download: AccessLedger check → decapsulate → fetch manifest → WorkerPool(fetch + open)
//!           → write at offset into `{dest}.veil-part` → rename
//!
//! Every operation is driven by a `TransferSession` whose snapshots are
//! persisted (without any FileKey) so an interrupted transfer resumes where
//! it stopped.

pub mod engine;
pub mod ledger;
pub mod manifest;
pub mod persist;
pub mod pool;
pub mod session;

pub use engine::{
    DownloadOutcome, ProgressFn, TransferEngine, TransferOptions, UploadOutcome,
};
pub use ledger::{AccessLedger, Clock, LocalLedger, ManualClock, SystemClock};
pub use manifest::{Manifest, ManifestFields};
pub use persist::{PersistHandle, SessionPersister, SessionStore};
pub use pool::{ChunkTask, PoolHooks, PoolReport, WorkerPool};
pub use session::{
    CompletionMap, Direction, SessionPhase, SessionSnapshot, SourceFingerprint, TransferSession,
};
