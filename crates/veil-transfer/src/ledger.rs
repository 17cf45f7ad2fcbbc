//! Access ledger: the authoritative registry of files and grants
//!
//! The transfer engine only consumes the call contract (`AccessLedger`).
//! `LocalLedger` implements it over a JSON file for single-machine use and
//! tests; a networked ledger would implement the same trait.
//!
//! Grant validity (`valid_from <= now < valid_to && !revoked`, and the file
//! itself not revoked) is evaluated here and nowhere else.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};
use veil_core::{unix_now, AccessGrant, ContentAddress, EncapsulatedKey, FileRecord, VeilError, VeilResult};
use veil_crypto::KeyBlob;

#[async_trait]
pub trait AccessLedger: Send + Sync {
    /// Record `caller` as owner of `address`. `authorization` is the
    /// caller's signature over the registration message.
    async fn register_file(
        &self,
        caller: &str,
        address: &ContentAddress,
        owner_key: &EncapsulatedKey,
        authorization: &[u8],
    ) -> VeilResult<()>;

    /// Replace the owner's encapsulated key.
    async fn update_key(
        &self,
        caller: &str,
        address: &ContentAddress,
        new_owner_key: &EncapsulatedKey,
    ) -> VeilResult<()>;

    /// Revoke the file; every grant on it becomes inactive.
    async fn revoke_file(&self, caller: &str, address: &ContentAddress) -> VeilResult<()>;

    async fn grant_access(
        &self,
        caller: &str,
        grantee: &str,
        address: &ContentAddress,
        grantee_key: &EncapsulatedKey,
        valid_from: u64,
        valid_to: u64,
    ) -> VeilResult<()>;

    async fn revoke_access(
        &self,
        caller: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<()>;

    async fn is_access_active(
        &self,
        owner: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<bool>;

    /// The stored grant, active or not. `AccessDenied` if none exists.
    async fn get_access(
        &self,
        owner: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<AccessGrant>;

    async fn file_record(&self, address: &ContentAddress) -> VeilResult<Option<FileRecord>>;
}

/// Source of ledger time (Unix seconds).
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        unix_now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredGrant {
    #[serde(deserialize_with = "key_blob")]
    key: EncapsulatedKey,
    valid_from: u64,
    valid_to: u64,
    revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFile {
    owner: String,
    #[serde(deserialize_with = "key_blob")]
    owner_key: EncapsulatedKey,
    registered_at: u64,
    revoked: bool,
    /// Hex signature the owner supplied at registration
    authorization: String,
    #[serde(default)]
    grants: BTreeMap<String, StoredGrant>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerState {
    #[serde(default)]
    files: BTreeMap<ContentAddress, StoredFile>,
}

/// Accept an encapsulated key in any shape `KeyBlob` recognises.
fn key_blob<'de, D: Deserializer<'de>>(d: D) -> Result<EncapsulatedKey, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    KeyBlob::from_json_value(&value)
        .decode()
        .map_err(serde::de::Error::custom)
}

/// JSON-file ledger. `path = None` keeps everything in memory.
pub struct LocalLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
    clock: Arc<dyn Clock>,
}

impl LocalLedger {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
            clock,
        }
    }

    /// Load or create a ledger file.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> VeilResult<Self> {
        let state = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| VeilError::Ledger(format!("parsing {}: {e}", path.display())))?
        } else {
            LedgerState::default()
        };
        debug!(path = %path.display(), files = state.files.len(), "ledger loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomic write (temp + rename). Callers hold the state lock.
    fn persist(&self, state: &LedgerState) -> VeilResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| VeilError::Ledger(format!("serializing ledger: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply `change` to a copy of the state. The copy replaces the live
    /// state only after it has been written.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut LedgerState) -> VeilResult<T>,
    ) -> VeilResult<T> {
        let mut state = self.lock();
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn owned_mut<'a>(
        state: &'a mut LedgerState,
        caller: &str,
        address: &ContentAddress,
    ) -> VeilResult<&'a mut StoredFile> {
        let file = state
            .files
            .get_mut(address)
            .ok_or_else(|| VeilError::Ledger(format!("{} is not registered", address.short())))?;
        if file.owner != caller {
            return Err(VeilError::AccessDenied {
                grantee: caller.to_string(),
                address: address.to_string(),
            });
        }
        if file.revoked {
            return Err(VeilError::AccessRevoked {
                address: address.to_string(),
            });
        }
        Ok(file)
    }
}

#[async_trait]
impl AccessLedger for LocalLedger {
    async fn register_file(
        &self,
        caller: &str,
        address: &ContentAddress,
        owner_key: &EncapsulatedKey,
        authorization: &[u8],
    ) -> VeilResult<()> {
        if authorization.is_empty() {
            return Err(VeilError::Ledger("registration is not signed".into()));
        }
        let now = self.clock.now();
        // A retry by the owner refreshes key and signature, keeping grants.
        let refreshed = self.commit(|state| match state.files.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if existing.owner != caller {
                    return Err(VeilError::Ledger(format!(
                        "{} is already registered to another owner",
                        address.short()
                    )));
                }
                if existing.revoked {
                    return Err(VeilError::AccessRevoked {
                        address: address.to_string(),
                    });
                }
                existing.owner_key = owner_key.clone();
                existing.authorization = hex::encode(authorization);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredFile {
                    owner: caller.to_string(),
                    owner_key: owner_key.clone(),
                    registered_at: now,
                    revoked: false,
                    authorization: hex::encode(authorization),
                    grants: BTreeMap::new(),
                });
                Ok(false)
            }
        })?;
        info!(owner = %caller, address = %address.short(), refreshed, "file registered");
        Ok(())
    }

    async fn update_key(
        &self,
        caller: &str,
        address: &ContentAddress,
        new_owner_key: &EncapsulatedKey,
    ) -> VeilResult<()> {
        self.commit(|state| {
            Self::owned_mut(state, caller, address)?.owner_key = new_owner_key.clone();
            Ok(())
        })?;
        info!(owner = %caller, address = %address.short(), "owner key updated");
        Ok(())
    }

    async fn revoke_file(&self, caller: &str, address: &ContentAddress) -> VeilResult<()> {
        self.commit(|state| {
            Self::owned_mut(state, caller, address)?.revoked = true;
            Ok(())
        })?;
        info!(owner = %caller, address = %address.short(), "file revoked");
        Ok(())
    }

    async fn grant_access(
        &self,
        caller: &str,
        grantee: &str,
        address: &ContentAddress,
        grantee_key: &EncapsulatedKey,
        valid_from: u64,
        valid_to: u64,
    ) -> VeilResult<()> {
        if valid_from >= valid_to {
            return Err(VeilError::Ledger(format!(
                "empty grant window [{valid_from}, {valid_to})"
            )));
        }
        self.commit(|state| {
            Self::owned_mut(state, caller, address)?.grants.insert(
                grantee.to_string(),
                StoredGrant {
                    key: grantee_key.clone(),
                    valid_from,
                    valid_to,
                    revoked: false,
                },
            );
            Ok(())
        })?;
        info!(
            owner = %caller,
            grantee = %grantee,
            address = %address.short(),
            valid_from,
            valid_to,
            "access granted"
        );
        Ok(())
    }

    async fn revoke_access(
        &self,
        caller: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<()> {
        self.commit(|state| {
            let grant = Self::owned_mut(state, caller, address)?
                .grants
                .get_mut(grantee)
                .ok_or_else(|| VeilError::AccessDenied {
                    grantee: grantee.to_string(),
                    address: address.to_string(),
                })?;
            grant.revoked = true;
            Ok(())
        })?;
        info!(owner = %caller, grantee = %grantee, address = %address.short(), "access revoked");
        Ok(())
    }

    async fn is_access_active(
        &self,
        owner: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<bool> {
        let now = self.clock.now();
        let state = self.lock();
        let active = match state.files.get(address) {
            Some(file) if file.owner == owner && !file.revoked => file
                .grants
                .get(grantee)
                .map(|g| to_grant(grantee, g).is_active_at(now))
                .unwrap_or(false),
            _ => false,
        };
        Ok(active)
    }

    async fn get_access(
        &self,
        owner: &str,
        address: &ContentAddress,
        grantee: &str,
    ) -> VeilResult<AccessGrant> {
        let state = self.lock();
        let denied = || VeilError::AccessDenied {
            grantee: grantee.to_string(),
            address: address.to_string(),
        };
        let file = state
            .files
            .get(address)
            .filter(|f| f.owner == owner)
            .ok_or_else(denied)?;
        let mut grant = file.grants.get(grantee).map(|g| to_grant(grantee, g)).ok_or_else(denied)?;
        // A revoked file revokes every grant on it.
        grant.revoked |= file.revoked;
        Ok(grant)
    }

    async fn file_record(&self, address: &ContentAddress) -> VeilResult<Option<FileRecord>> {
        let state = self.lock();
        Ok(state.files.get(address).map(|f| FileRecord {
            owner: f.owner.clone(),
            content_address: address.clone(),
            owner_encapsulated_key: f.owner_key.clone(),
            registered_at: f.registered_at,
            revoked: f.revoked,
        }))
    }
}

fn to_grant(grantee: &str, g: &StoredGrant) -> AccessGrant {
    AccessGrant {
        grantee: grantee.to_string(),
        grantee_encapsulated_key: g.key.clone(),
        valid_from: g.valid_from,
        valid_to: g.valid_to,
        revoked: g.revoked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use veil_chunks::address_of;

    fn key() -> EncapsulatedKey {
        EncapsulatedKey {
            ephemeral_public_key: [7u8; 32],
            nonce: [9u8; 24],
            ciphertext: vec![1u8; 48],
        }
    }

    fn ledger_at(now: u64) -> (LocalLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (LocalLedger::in_memory(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (ledger, _) = ledger_at(1_000);
        let addr = address_of(b"manifest");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();

        let record = ledger.file_record(&addr).await.unwrap().unwrap();
        assert_eq!(record.owner, "alice");
        assert_eq!(record.registered_at, 1_000);
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn test_unsigned_registration_rejected() {
        let (ledger, _) = ledger_at(0);
        let addr = address_of(b"m");
        assert!(ledger.register_file("alice", &addr, &key(), b"").await.is_err());
    }

    #[tokio::test]
    async fn test_only_owner_mutates() {
        let (ledger, _) = ledger_at(0);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();

        assert!(ledger.register_file("mallory", &addr, &key(), b"sig").await.is_err());
        assert!(matches!(
            ledger.grant_access("mallory", "mallory", &addr, &key(), 0, 10).await,
            Err(VeilError::AccessDenied { .. })
        ));
        assert!(ledger.update_key("mallory", &addr, &key()).await.is_err());
        assert!(ledger.revoke_file("mallory", &addr).await.is_err());
    }

    #[tokio::test]
    async fn test_access_window() {
        let (ledger, clock) = ledger_at(50);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.unwrap();

        assert!(!ledger.is_access_active("alice", &addr, "bob").await.unwrap());
        clock.set(100);
        assert!(ledger.is_access_active("alice", &addr, "bob").await.unwrap());
        clock.set(199);
        assert!(ledger.is_access_active("alice", &addr, "bob").await.unwrap());
        clock.set(200);
        assert!(!ledger.is_access_active("alice", &addr, "bob").await.unwrap());

        // Wrong owner or unknown grantee is never active
        clock.set(150);
        assert!(!ledger.is_access_active("mallory", &addr, "bob").await.unwrap());
        assert!(!ledger.is_access_active("alice", &addr, "carol").await.unwrap());
    }

    #[tokio::test]
    async fn test_revocations() {
        let (ledger, _) = ledger_at(150);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.unwrap();
        ledger.grant_access("alice", "carol", &addr, &key(), 100, 200).await.unwrap();

        ledger.revoke_access("alice", &addr, "bob").await.unwrap();
        assert!(!ledger.is_access_active("alice", &addr, "bob").await.unwrap());
        assert!(ledger.get_access("alice", &addr, "bob").await.unwrap().revoked);
        assert!(ledger.is_access_active("alice", &addr, "carol").await.unwrap());

        ledger.revoke_file("alice", &addr).await.unwrap();
        assert!(!ledger.is_access_active("alice", &addr, "carol").await.unwrap());
        assert!(ledger.get_access("alice", &addr, "carol").await.unwrap().revoked);
        assert!(ledger.file_record(&addr).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn test_owner_reregistration_keeps_grants() {
        let (ledger, clock) = ledger_at(100);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.unwrap();

        clock.set(150);
        let mut rotated = key();
        rotated.nonce = [3u8; 24];
        ledger.register_file("alice", &addr, &rotated, b"sig2").await.unwrap();

        let record = ledger.file_record(&addr).await.unwrap().unwrap();
        assert_eq!(record.registered_at, 100);
        assert_eq!(record.owner_encapsulated_key, rotated);
        assert!(ledger.is_access_active("alice", &addr, "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoked_file_cannot_be_reregistered() {
        let (ledger, _) = ledger_at(150);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.unwrap();
        ledger.revoke_file("alice", &addr).await.unwrap();

        assert!(matches!(
            ledger.register_file("alice", &addr, &key(), b"sig").await,
            Err(VeilError::AccessRevoked { .. })
        ));
        assert!(ledger.file_record(&addr).await.unwrap().unwrap().revoked);
        assert!(!ledger.is_access_active("alice", &addr, "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(150));
        let addr = address_of(b"m");
        let ledger = LocalLedger::open(&path, clock).unwrap();
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();

        // A directory in the ledger's place makes the final rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        assert!(ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.is_err());
        assert!(!ledger.is_access_active("alice", &addr, "bob").await.unwrap());
        assert!(matches!(
            ledger.get_access("alice", &addr, "bob").await,
            Err(VeilError::AccessDenied { .. })
        ));

        assert!(ledger.revoke_file("alice", &addr).await.is_err());
        assert!(!ledger.file_record(&addr).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn test_empty_window_rejected() {
        let (ledger, _) = ledger_at(0);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        assert!(ledger.grant_access("alice", "bob", &addr, &key(), 10, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_grant_is_denied() {
        let (ledger, _) = ledger_at(0);
        let addr = address_of(b"m");
        ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
        assert!(matches!(
            ledger.get_access("alice", &addr, "bob").await,
            Err(VeilError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(120));
        let addr = address_of(b"m");
        {
            let ledger = LocalLedger::open(&path, clock.clone()).unwrap();
            ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
            ledger.grant_access("alice", "bob", &addr, &key(), 100, 200).await.unwrap();
        }
        let reopened = LocalLedger::open(&path, clock).unwrap();
        assert!(reopened.is_access_active("alice", &addr, "bob").await.unwrap());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_loads_legacy_key_encodings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let addr = address_of(b"m");
        let packed_hex = hex::encode(key().to_packed());
        let json_text = serde_json::to_string(&key()).unwrap();
        let doc = serde_json::json!({
            "files": {
                (addr.to_string()): {
                    "owner": "alice",
                    "ownerKey": packed_hex,
                    "registeredAt": 1,
                    "revoked": false,
                    "authorization": "00",
                    "grants": {
                        "bob": {
                            "key": json_text,
                            "validFrom": 0,
                            "validTo": 10,
                            "revoked": false
                        }
                    }
                }
            }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let ledger = LocalLedger::open(&path, Arc::new(ManualClock::new(5))).unwrap();
        let record = ledger.file_record(&addr).await.unwrap().unwrap();
        assert_eq!(record.owner_encapsulated_key, key());
        let grant = ledger.get_access("alice", &addr, "bob").await.unwrap();
        assert_eq!(grant.grantee_encapsulated_key, key());
    }

    #[tokio::test]
    async fn test_unrecognized_key_encoding_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let addr = address_of(b"m");
        let doc = serde_json::json!({
            "files": {
                (addr.to_string()): {
                    "owner": "alice",
                    "ownerKey": "not a key",
                    "registeredAt": 1,
                    "revoked": false,
                    "authorization": "00"
                }
            }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            LocalLedger::open(&path, Arc::new(SystemClock)),
            Err(VeilError::Ledger(_))
        ));
    }

    proptest! {
        #[test]
        fn validity_matches_half_open_window(
            from in 0u64..1_000,
            len in 1u64..1_000,
            now in 0u64..3_000,
            revoked in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (ledger, clock) = ledger_at(now);
                let addr = address_of(b"prop");
                ledger.register_file("alice", &addr, &key(), b"sig").await.unwrap();
                ledger.grant_access("alice", "bob", &addr, &key(), from, from + len).await.unwrap();
                if revoked {
                    ledger.revoke_access("alice", &addr, "bob").await.unwrap();
                }
                clock.set(now);
                let active = ledger.is_access_active("alice", &addr, "bob").await.unwrap();
                let expected = !revoked && from <= now && now < from + len;
                assert_eq!(active, expected);
            });
        }
    }
}
