//! Transfer engine: the one place uploads, downloads and sharing are driven
//!
//! Each operation runs against a `TransferSession` and advances it phase by
//! phase, persisting a snapshot at every boundary. An operation that fails
//! parks its session as `Aborted`; `resume_upload` / `resume_download` pick
//! it up from the phase it stopped in.
//!
//! Every network suspension point (chunk put, blob fetch, ledger call,
//! signature request) runs under an explicit timeout.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use veil_chunks::ChunkPlan;
use veil_core::config::{RejectionPolicy, SignerConfig, TransferConfig, VeilConfig};
use veil_core::{
    unix_now, AccessGrant, ChunkRecord, ContentAddress, EncapsulatedKey, FileRecord, VeilError,
    VeilResult,
};
use veil_crypto::{
    decapsulate, derive_keypair, encapsulate, generate_file_key, reencapsulate, ChunkCipher,
    PrincipalKeypair, Signer, KEY_DERIVATION_CHALLENGE,
};
use veil_storage::{BlobSink, GatewayFetcher};
use x25519_dalek::PublicKey;

use crate::ledger::{AccessLedger, Clock, SystemClock};
use crate::manifest::{guess_mime, Manifest, ManifestFields};
use crate::persist::{SessionPersister, SessionStore};
use crate::pool::{with_retries, ChunkTask, PoolHooks, WorkerPool};
use crate::session::{
    Direction, SessionPhase, SessionSnapshot, SourceFingerprint, TransferSession,
};

/// Suffix of the partial plaintext file a download writes into.
pub const PART_SUFFIX: &str = "veil-part";

/// `(completed, total)` after every recorded chunk.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Set to stop the transfer at the next chunk boundary
    pub cancel: Arc<AtomicBool>,
    pub progress: Option<ProgressFn>,
    /// Overrides the extension-based guess for uploads
    pub mime_type: Option<String>,
    /// Overrides `transfer.concurrency`
    pub concurrency: Option<usize>,
}

impl TransferOptions {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session_id: String,
    pub manifest_address: ContentAddress,
    pub file_size: u64,
    pub total_chunks: u64,
    /// Indices uploaded by this call, sorted
    pub transferred: Vec<u64>,
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub session_id: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub total_chunks: u64,
    /// Indices fetched by this call, sorted
    pub transferred: Vec<u64>,
}

/// Message the owner signs to authorize ledger registration.
pub fn registration_message(address: &ContentAddress) -> Vec<u8> {
    format!("veil register v1\n{address}").into_bytes()
}

/// Partial file for a download destination (`{dest}.veil-part`).
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

pub struct TransferEngine {
    sink: Arc<dyn BlobSink>,
    fetcher: Arc<GatewayFetcher>,
    ledger: Arc<dyn AccessLedger>,
    store: Arc<SessionStore>,
    transfer: TransferConfig,
    signer_cfg: SignerConfig,
    ledger_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl TransferEngine {
    pub fn new(
        sink: Arc<dyn BlobSink>,
        fetcher: Arc<GatewayFetcher>,
        ledger: Arc<dyn AccessLedger>,
        store: Arc<SessionStore>,
        config: &VeilConfig,
    ) -> Self {
        Self {
            sink,
            fetcher,
            ledger,
            store,
            transfer: config.transfer.clone(),
            signer_cfg: config.signer.clone(),
            ledger_timeout: config.ledger.timeout(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used to explain why the ledger reported a grant inactive.
    /// Should be the clock the ledger itself uses.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn AccessLedger> {
        &self.ledger
    }

    pub fn fetcher(&self) -> &Arc<GatewayFetcher> {
        &self.fetcher
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Ask the signer for the derivation signature and rebuild the keypair.
    pub async fn unlock(&self, signer: &dyn Signer) -> VeilResult<PrincipalKeypair> {
        let signature = bounded(
            "key derivation signature",
            self.signer_cfg.timeout(),
            signer.sign(KEY_DERIVATION_CHALLENGE),
        )
        .await?;
        derive_keypair(signer.principal(), &signature)
    }

    // ── upload ──────────────────────────────────────────────────────────

    pub async fn upload(
        &self,
        path: &Path,
        signer: &dyn Signer,
        opts: &TransferOptions,
    ) -> VeilResult<UploadOutcome> {
        let source = SourceFingerprint::of(path)?;
        let plan = ChunkPlan::new(source.size, self.transfer.chunk_size)?;
        let fields = ManifestFields {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".into()),
            mime_type: opts
                .mime_type
                .clone()
                .unwrap_or_else(|| guess_mime(path).to_string()),
            file_size: source.size,
            chunk_size: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
            uploader: signer.principal().to_string(),
        };

        let keypair = self.unlock(signer).await?;
        let session = Arc::new(TransferSession::new_upload(signer.principal(), fields, source));
        info!(
            session = %session.id(),
            path = %path.display(),
            size = plan.file_size(),
            chunks = plan.total_chunks(),
            "upload started"
        );

        let persister = self.persister();
        persister.persist_now(session.snapshot()).await?;
        let result = self
            .advance_upload(&session, &keypair, signer, opts, &persister)
            .await;
        self.settle(&session, persister, result).await
    }

    pub async fn resume_upload(
        &self,
        session_id: &str,
        signer: &dyn Signer,
        opts: &TransferOptions,
    ) -> VeilResult<UploadOutcome> {
        let session = Arc::new(self.load_session(session_id, Direction::Upload, signer)?);
        let phase = session.resume()?;
        if matches!(
            phase,
            SessionPhase::Created | SessionPhase::KeyReady | SessionPhase::Uploading
        ) {
            if let Some(source) = session.source() {
                source.check_unchanged()?;
            }
        }
        info!(
            session = %session.id(),
            phase = %phase,
            completed = session.chunks()?.completed(),
            "resuming upload"
        );

        let keypair = self.unlock(signer).await?;
        let persister = self.persister();
        persister.persist_now(session.snapshot()).await?;
        let result = self
            .advance_upload(&session, &keypair, signer, opts, &persister)
            .await;
        self.settle(&session, persister, result).await
    }

    async fn advance_upload(
        &self,
        session: &Arc<TransferSession>,
        keypair: &PrincipalKeypair,
        signer: &dyn Signer,
        opts: &TransferOptions,
        persister: &SessionPersister,
    ) -> VeilResult<UploadOutcome> {
        let fields = session
            .fields()
            .ok_or_else(|| VeilError::SessionCorrupt("upload session has no file metadata".into()))?;
        let mut transferred = Vec::new();
        let mut cipher = None;

        if session.phase() == SessionPhase::Created {
            let file_key = generate_file_key();
            session.set_owner_key(encapsulate(&file_key, &keypair.public_key())?);
            session.transition(SessionPhase::KeyReady)?;
            // The wrapped key must be durable before any chunk is sealed with it.
            persister.persist_now(session.snapshot()).await?;
            cipher = Some(ChunkCipher::new(file_key));
        }

        if matches!(session.phase(), SessionPhase::KeyReady | SessionPhase::Uploading) {
            let cipher = match cipher {
                Some(c) => c,
                None => {
                    let owner_key = session.owner_key().ok_or_else(|| {
                        VeilError::KeyUnavailable("session holds no encapsulated owner key".into())
                    })?;
                    ChunkCipher::new(decapsulate(&owner_key, keypair)?)
                }
            };
            if session.phase() == SessionPhase::KeyReady {
                session.transition(SessionPhase::Uploading)?;
                persister.schedule(session.snapshot());
            }

            let source = session
                .source()
                .ok_or_else(|| VeilError::SessionCorrupt("upload session has no source".into()))?;
            let task = Arc::new(UploadChunk {
                path: source.path,
                plan: fields.plan()?,
                cipher,
                sink: self.sink.clone(),
            });
            let report = self
                .pool(opts)
                .run(session.clone(), task, self.hooks(session, persister, opts))
                .await?;
            transferred = report.processed;
            ensure_all_done(session)?;

            let manifest = Manifest::assemble(&fields, session.chunks()?.records(), unix_now())?;
            let bytes = manifest.to_bytes()?;
            let address = with_retries(
                &self.transfer,
                || opts.is_cancelled(),
                "publish manifest",
                || self.sink.put(bytes.clone()),
            )
            .await?;
            session.set_manifest_address(address.clone());
            session.transition(SessionPhase::ManifestPublished)?;
            persister.persist_now(session.snapshot()).await?;
            info!(
                session = %session.id(),
                manifest = %address.short(),
                chunks = manifest.total_chunks,
                uploaded = transferred.len(),
                "manifest published"
            );
        }

        if session.phase() == SessionPhase::ManifestPublished {
            self.register(session, signer, persister).await?;
        }
        if session.phase() == SessionPhase::Registered {
            session.transition(SessionPhase::Complete)?;
            persister.persist_now(session.snapshot()).await?;
        }
        if session.phase() != SessionPhase::Complete {
            return Err(VeilError::SessionCorrupt(format!(
                "upload stopped in phase {}",
                session.phase()
            )));
        }

        let manifest_address = session
            .manifest_address()
            .ok_or_else(|| VeilError::SessionCorrupt("complete upload has no manifest".into()))?;
        info!(
            session = %session.id(),
            manifest = %manifest_address,
            registered = session.registered(),
            "upload complete"
        );
        Ok(UploadOutcome {
            session_id: session.id().to_string(),
            manifest_address,
            file_size: fields.file_size,
            total_chunks: fields.total_chunks,
            transferred,
            registered: session.registered(),
        })
    }

    /// Sign the registration and record the file on the ledger. A declined
    /// signature follows `signer.on_rejected`.
    async fn register(
        &self,
        session: &TransferSession,
        signer: &dyn Signer,
        persister: &SessionPersister,
    ) -> VeilResult<()> {
        let address = session
            .manifest_address()
            .ok_or_else(|| VeilError::SessionCorrupt("no manifest to register".into()))?;
        let owner_key = session
            .owner_key()
            .ok_or_else(|| VeilError::KeyUnavailable("no owner key to register".into()))?;

        let signed = bounded(
            "registration signature",
            self.signer_cfg.timeout(),
            signer.sign(&registration_message(&address)),
        )
        .await;

        match signed {
            Ok(signature) => {
                bounded(
                    "ledger register_file",
                    self.ledger_timeout,
                    self.ledger
                        .register_file(session.principal(), &address, &owner_key, &signature),
                )
                .await?;
                session.set_registered();
                session.transition(SessionPhase::Registered)?;
            }
            Err(VeilError::RejectedBySigner(reason)) => match self.signer_cfg.on_rejected {
                RejectionPolicy::Abort => return Err(VeilError::RejectedBySigner(reason)),
                RejectionPolicy::ContinueUnregistered => {
                    warn!(
                        session = %session.id(),
                        manifest = %address.short(),
                        "registration declined ({reason}); completing unregistered"
                    );
                    session.transition(SessionPhase::Complete)?;
                }
            },
            Err(e) => return Err(e),
        }
        persister.persist_now(session.snapshot()).await
    }

    // ── download ────────────────────────────────────────────────────────

    pub async fn download(
        &self,
        manifest_address: &ContentAddress,
        owner: &str,
        dest: &Path,
        signer: &dyn Signer,
        opts: &TransferOptions,
    ) -> VeilResult<DownloadOutcome> {
        let keypair = self.unlock(signer).await?;
        let session = Arc::new(TransferSession::new_download(
            signer.principal(),
            manifest_address.clone(),
            owner,
            dest,
        ));
        info!(
            session = %session.id(),
            manifest = %manifest_address.short(),
            owner = %owner,
            dest = %dest.display(),
            "download started"
        );

        let persister = self.persister();
        persister.persist_now(session.snapshot()).await?;
        let result = self.advance_download(&session, &keypair, opts, &persister).await;
        self.settle(&session, persister, result).await
    }

    pub async fn resume_download(
        &self,
        session_id: &str,
        signer: &dyn Signer,
        opts: &TransferOptions,
    ) -> VeilResult<DownloadOutcome> {
        let session = Arc::new(self.load_session(session_id, Direction::Download, signer)?);
        let phase = session.resume()?;
        info!(session = %session.id(), phase = %phase, "resuming download");

        let keypair = self.unlock(signer).await?;
        let persister = self.persister();
        persister.persist_now(session.snapshot()).await?;
        let result = self.advance_download(&session, &keypair, opts, &persister).await;
        self.settle(&session, persister, result).await
    }

    async fn advance_download(
        &self,
        session: &Arc<TransferSession>,
        keypair: &PrincipalKeypair,
        opts: &TransferOptions,
        persister: &SessionPersister,
    ) -> VeilResult<DownloadOutcome> {
        let address = session
            .manifest_address()
            .ok_or_else(|| VeilError::SessionCorrupt("download session has no manifest".into()))?;
        let owner = session
            .owner()
            .ok_or_else(|| VeilError::SessionCorrupt("download session has no owner".into()))?;
        let dest = session
            .destination()
            .ok_or_else(|| VeilError::SessionCorrupt("download session has no destination".into()))?;
        let part = part_path(&dest);
        let mut transferred = Vec::new();

        if matches!(
            session.phase(),
            SessionPhase::FetchingManifest | SessionPhase::FetchingChunks
        ) {
            let resumed_chunks = session.chunks().map(|m| m.completed()).unwrap_or(0);
            if resumed_chunks > 0 && !part.exists() {
                return Err(VeilError::SessionCorrupt(format!(
                    "{} is missing; {resumed_chunks} recorded chunks cannot be trusted",
                    part.display()
                )));
            }

            // Re-checked on every run, immediately before decapsulation.
            let wrapped = self.authorize(&address, &owner, session.principal()).await?;
            let cipher = ChunkCipher::new(decapsulate(&wrapped, keypair)?);

            let manifest = Arc::new(self.fetch_manifest(&address, opts).await?);
            session.set_fields(manifest.fields())?;
            if session.phase() == SessionPhase::FetchingManifest {
                session.transition(SessionPhase::FetchingChunks)?;
                persister.persist_now(session.snapshot()).await?;
            }

            if let Some(parent) = part.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&part)
                .await?;

            let task = Arc::new(DownloadChunk {
                plan: manifest.fields().plan()?,
                manifest: manifest.clone(),
                fetcher: self.fetcher.clone(),
                cipher,
                part: tokio::sync::Mutex::new(file),
            });
            let report = self
                .pool(opts)
                .run(session.clone(), task, self.hooks(session, persister, opts))
                .await?;
            transferred = report.processed;
            ensure_all_done(session)?;

            session.transition(SessionPhase::Reassembling)?;
            persister.persist_now(session.snapshot()).await?;
        }

        let fields = session
            .fields()
            .ok_or_else(|| VeilError::SessionCorrupt("download session has no file metadata".into()))?;

        if session.phase() == SessionPhase::Reassembling {
            finalize_part(&part, &dest, fields.file_size)?;
            session.transition(SessionPhase::Complete)?;
            persister.persist_now(session.snapshot()).await?;
        }
        if session.phase() != SessionPhase::Complete {
            return Err(VeilError::SessionCorrupt(format!(
                "download stopped in phase {}",
                session.phase()
            )));
        }

        info!(
            session = %session.id(),
            dest = %dest.display(),
            bytes = fields.file_size,
            fetched = transferred.len(),
            "download complete"
        );
        Ok(DownloadOutcome {
            session_id: session.id().to_string(),
            path: dest,
            file_size: fields.file_size,
            total_chunks: fields.total_chunks,
            transferred,
        })
    }

    /// Resolve the encapsulated key `principal` may use, asking the ledger.
    async fn authorize(
        &self,
        address: &ContentAddress,
        owner: &str,
        principal: &str,
    ) -> VeilResult<EncapsulatedKey> {
        let denied = || VeilError::AccessDenied {
            grantee: principal.to_string(),
            address: address.to_string(),
        };
        let record = self.file_record(address).await?.ok_or_else(denied)?;
        if record.owner != owner {
            return Err(denied());
        }
        if record.revoked {
            return Err(VeilError::AccessRevoked {
                address: address.to_string(),
            });
        }
        if record.owner == principal {
            return Ok(record.owner_encapsulated_key);
        }

        let grant = bounded(
            "ledger get_access",
            self.ledger_timeout,
            self.ledger.get_access(owner, address, principal),
        )
        .await?;
        let active = bounded(
            "ledger is_access_active",
            self.ledger_timeout,
            self.ledger.is_access_active(owner, address, principal),
        )
        .await?;
        if !active {
            grant.check_active_at(self.clock.now(), address)?;
            return Err(denied());
        }
        debug!(grantee = %principal, manifest = %address.short(), "grant active");
        Ok(grant.grantee_encapsulated_key)
    }

    async fn fetch_manifest(
        &self,
        address: &ContentAddress,
        opts: &TransferOptions,
    ) -> VeilResult<Manifest> {
        let fetched = with_retries(
            &self.transfer,
            || opts.is_cancelled(),
            "fetch manifest",
            || self.fetcher.fetch(address),
        )
        .await?;
        debug!(manifest = %address.short(), source = %fetched.source, "manifest fetched");
        Manifest::from_bytes(&fetched.bytes)
    }

    // ── sharing ─────────────────────────────────────────────────────────

    /// Grant `grantee` read access for `[valid_from, valid_to)`.
    pub async fn share(
        &self,
        address: &ContentAddress,
        grantee: &str,
        grantee_public: &PublicKey,
        valid_from: u64,
        valid_to: u64,
        signer: &dyn Signer,
    ) -> VeilResult<AccessGrant> {
        if valid_from >= valid_to {
            return Err(VeilError::Config(format!(
                "grant window [{valid_from}, {valid_to}) is empty"
            )));
        }
        let record = self.owned_record(address, signer.principal()).await?;
        let keypair = self.unlock(signer).await?;
        let grantee_key = reencapsulate(&record.owner_encapsulated_key, &keypair, grantee_public)?;

        bounded(
            "ledger grant_access",
            self.ledger_timeout,
            self.ledger.grant_access(
                signer.principal(),
                grantee,
                address,
                &grantee_key,
                valid_from,
                valid_to,
            ),
        )
        .await?;
        info!(grantee = %grantee, manifest = %address.short(), valid_from, valid_to, "shared");

        Ok(AccessGrant {
            grantee: grantee.to_string(),
            grantee_encapsulated_key: grantee_key,
            valid_from,
            valid_to,
            revoked: false,
        })
    }

    pub async fn revoke_access(
        &self,
        address: &ContentAddress,
        grantee: &str,
        caller: &str,
    ) -> VeilResult<()> {
        bounded(
            "ledger revoke_access",
            self.ledger_timeout,
            self.ledger.revoke_access(caller, address, grantee),
        )
        .await
    }

    pub async fn revoke_file(&self, address: &ContentAddress, caller: &str) -> VeilResult<()> {
        bounded(
            "ledger revoke_file",
            self.ledger_timeout,
            self.ledger.revoke_file(caller, address),
        )
        .await
    }

    /// Re-wrap the owner's file key under a fresh ephemeral key, or for a
    /// new owner public key, and store it on the ledger.
    pub async fn rotate_owner_key(
        &self,
        address: &ContentAddress,
        signer: &dyn Signer,
        new_owner_public: Option<PublicKey>,
    ) -> VeilResult<EncapsulatedKey> {
        let record = self.owned_record(address, signer.principal()).await?;
        let keypair = self.unlock(signer).await?;
        let target = new_owner_public.unwrap_or_else(|| keypair.public_key());
        let rotated = reencapsulate(&record.owner_encapsulated_key, &keypair, &target)?;

        bounded(
            "ledger update_key",
            self.ledger_timeout,
            self.ledger.update_key(signer.principal(), address, &rotated),
        )
        .await?;
        info!(manifest = %address.short(), "owner key rotated");
        Ok(rotated)
    }

    async fn file_record(&self, address: &ContentAddress) -> VeilResult<Option<FileRecord>> {
        bounded(
            "ledger file_record",
            self.ledger_timeout,
            self.ledger.file_record(address),
        )
        .await
    }

    async fn owned_record(&self, address: &ContentAddress, caller: &str) -> VeilResult<FileRecord> {
        let record = self
            .file_record(address)
            .await?
            .ok_or_else(|| VeilError::Ledger(format!("{} is not registered", address.short())))?;
        if record.owner != caller {
            return Err(VeilError::AccessDenied {
                grantee: caller.to_string(),
                address: address.to_string(),
            });
        }
        if record.revoked {
            return Err(VeilError::AccessRevoked {
                address: address.to_string(),
            });
        }
        Ok(record)
    }

    // ── sessions ────────────────────────────────────────────────────────

    pub fn sessions(&self) -> VeilResult<Vec<SessionSnapshot>> {
        self.store.list()
    }

    pub fn session(&self, id: &str) -> VeilResult<SessionSnapshot> {
        self.store.load(id)
    }

    /// Park a session so it is not resumed by accident; it stays resumable.
    pub fn abort_session(&self, id: &str) -> VeilResult<()> {
        let session = TransferSession::from_snapshot(self.store.load(id)?)?;
        session.abort()?;
        self.store.write(&session.snapshot())
    }

    pub fn remove_session(&self, id: &str) -> VeilResult<()> {
        self.store.remove(id)
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn persister(&self) -> SessionPersister {
        SessionPersister::spawn(self.store.clone(), self.transfer.persist_debounce())
    }

    fn pool(&self, opts: &TransferOptions) -> WorkerPool {
        let pool = WorkerPool::from_config(&self.transfer);
        match opts.concurrency {
            Some(c) => pool.with_concurrency(c),
            None => pool,
        }
    }

    fn hooks(
        &self,
        session: &Arc<TransferSession>,
        persister: &SessionPersister,
        opts: &TransferOptions,
    ) -> PoolHooks {
        let handle = persister.handle();
        let session = session.clone();
        let progress = opts.progress.clone();
        PoolHooks {
            cancel: opts.cancel.clone(),
            on_record: Some(Arc::new(move |_record: &ChunkRecord| {
                handle.schedule_with(|| session.snapshot());
                if let (Some(progress), Ok(map)) = (&progress, session.chunks()) {
                    progress(map.completed() as u64, map.total());
                }
            })),
        }
    }

    fn load_session(
        &self,
        id: &str,
        direction: Direction,
        signer: &dyn Signer,
    ) -> VeilResult<TransferSession> {
        let session = TransferSession::from_snapshot(self.store.load(id)?)?;
        if session.direction() != direction {
            return Err(VeilError::SessionCorrupt(format!(
                "session {id} is a {:?} session",
                session.direction()
            )));
        }
        if session.principal() != signer.principal() {
            return Err(VeilError::SessionCorrupt(format!(
                "session {id} belongs to {}",
                session.principal()
            )));
        }
        Ok(session)
    }

    /// Close the persister; on failure park the session as `Aborted` first.
    async fn settle<T>(
        &self,
        session: &TransferSession,
        persister: SessionPersister,
        result: VeilResult<T>,
    ) -> VeilResult<T> {
        match result {
            Ok(v) => {
                persister.close().await?;
                Ok(v)
            }
            Err(e) => {
                if !session.phase().is_terminal() {
                    if let Err(abort_err) = session.abort() {
                        warn!(session = %session.id(), "abort failed: {abort_err}");
                    }
                }
                persister.schedule(session.snapshot());
                if let Err(flush_err) = persister.close().await {
                    warn!(session = %session.id(), "could not persist aborted session: {flush_err}");
                }
                warn!(session = %session.id(), "transfer stopped: {e}");
                Err(e)
            }
        }
    }
}

/// Run a fallible future under a deadline.
async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> VeilResult<T>
where
    F: Future<Output = VeilResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| VeilError::timeout(operation, limit))?
}

fn ensure_all_done(session: &TransferSession) -> VeilResult<()> {
    let map = session.chunks()?;
    if !map.all_done() {
        return Err(VeilError::SessionCorrupt(format!(
            "worker pool finished with chunks missing: {:?}",
            map.missing()
        )));
    }
    Ok(())
}

/// Trim the partial file to its final size and move it into place.
fn finalize_part(part: &Path, dest: &Path, file_size: u64) -> VeilResult<()> {
    if !part.exists() {
        if dest.exists() {
            return Ok(());
        }
        return Err(VeilError::SessionCorrupt(format!(
            "{} vanished before reassembly",
            part.display()
        )));
    }
    let file = std::fs::OpenOptions::new().write(true).open(part)?;
    file.set_len(file_size)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(part, dest)?;
    Ok(())
}

/// Read one plaintext span, seal it, store it.
struct UploadChunk {
    path: PathBuf,
    plan: ChunkPlan,
    cipher: ChunkCipher,
    sink: Arc<dyn BlobSink>,
}

#[async_trait]
impl ChunkTask for UploadChunk {
    async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
        let span = self
            .plan
            .span(index)
            .ok_or_else(|| VeilError::SessionCorrupt(format!("chunk {index} is not in the plan")))?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(span.offset)).await?;
        let mut plaintext = vec![0u8; span.length as usize];
        file.read_exact(&mut plaintext).await?;

        let packed = self.cipher.seal(index, &plaintext)?;
        let size = packed.len() as u64;
        let content_address = self.sink.put(packed).await?;
        Ok(ChunkRecord {
            index,
            content_address,
            size,
        })
    }
}

/// Fetch one chunk, open it, write the plaintext at its offset.
struct DownloadChunk {
    manifest: Arc<Manifest>,
    plan: ChunkPlan,
    fetcher: Arc<GatewayFetcher>,
    cipher: ChunkCipher,
    part: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
impl ChunkTask for DownloadChunk {
    async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
        let record = self
            .manifest
            .chunks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| VeilError::SessionCorrupt(format!("manifest has no chunk {index}")))?;
        let span = self
            .plan
            .span(index)
            .ok_or_else(|| VeilError::SessionCorrupt(format!("chunk {index} is not in the plan")))?;

        let fetched = self.fetcher.fetch(&record.content_address).await?;
        let plaintext = self.cipher.open(index, &fetched.bytes)?;
        if plaintext.len() as u64 != span.length {
            return Err(VeilError::SessionCorrupt(format!(
                "chunk {index} decrypted to {} bytes, manifest expects {}",
                plaintext.len(),
                span.length
            )));
        }

        let mut file = self.part.lock().await;
        file.seek(SeekFrom::Start(span.offset)).await?;
        file.write_all(&plaintext).await?;
        // Data must be on disk before the completion is recorded.
        file.sync_data().await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/out/report.pdf")),
            PathBuf::from("/tmp/out/report.pdf.veil-part")
        );
    }

    #[test]
    fn test_registration_message_names_address() {
        let addr = veil_chunks::address_of(b"m");
        let msg = String::from_utf8(registration_message(&addr)).unwrap();
        assert!(msg.ends_with(addr.as_str()));
    }

    #[test]
    fn test_finalize_trims_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let part = part_path(&dest);
        std::fs::write(&part, b"hello world, trailing junk").unwrap();

        finalize_part(&part, &dest, 11).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!part.exists());
        // Already finalized: idempotent
        finalize_part(&part, &dest, 11).unwrap();
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded("slow ledger", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, VeilError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VeilError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
