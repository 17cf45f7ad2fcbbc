//! Transfer manifest: the immutable, content-addressed description of an
//! uploaded file.
//!
//! Wire format (JSON, camelCase):
//! ```json
//! {
//!   "filename": "report.pdf", "mimeType": "application/pdf",
//!   "fileSize": 10485760, "chunkSize": 2097152, "totalChunks": 5,
//!   "uploader": "alice", "uploadedAt": 1767225600,
//!   "chunks": [{"index": 0, "contentAddress": "…", "size": 2097180}, …]
//! }
//! ```
//! The manifest's own BLAKE3 address is the file's content address on the
//! ledger.

use std::path::Path;

use serde::{Deserialize, Serialize};
use veil_chunks::ChunkPlan;
use veil_core::{ChunkRecord, VeilError, VeilResult};
use veil_crypto::CHUNK_OVERHEAD;

/// File metadata known before any chunk is transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFields {
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploader: String,
}

impl ManifestFields {
    pub fn plan(&self) -> VeilResult<ChunkPlan> {
        let plan = ChunkPlan::new(self.file_size, self.chunk_size)?;
        if plan.total_chunks() != self.total_chunks {
            return Err(invalid(format!(
                "totalChunks {} does not match fileSize {} / chunkSize {}",
                self.total_chunks, self.file_size, self.chunk_size
            )));
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploader: String,
    pub uploaded_at: u64,
    pub chunks: Vec<ChunkRecord>,
}

impl Manifest {
    /// Assemble from completed records (any order) and validate.
    pub fn assemble(
        fields: &ManifestFields,
        mut records: Vec<ChunkRecord>,
        uploaded_at: u64,
    ) -> VeilResult<Self> {
        records.sort_by_key(|r| r.index);
        let manifest = Self {
            filename: fields.filename.clone(),
            mime_type: fields.mime_type.clone(),
            file_size: fields.file_size,
            chunk_size: fields.chunk_size,
            total_chunks: fields.total_chunks,
            uploader: fields.uploader.clone(),
            uploaded_at,
            chunks: records,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn fields(&self) -> ManifestFields {
        ManifestFields {
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            uploader: self.uploader.clone(),
        }
    }

    /// Every index `0..totalChunks` appears exactly once, in order, and each
    /// record's size matches its plaintext span plus AEAD overhead.
    pub fn validate(&self) -> VeilResult<()> {
        let plan = self.fields().plan()?;
        if self.chunks.len() as u64 != self.total_chunks {
            return Err(invalid(format!(
                "{} chunk records for {} chunks",
                self.chunks.len(),
                self.total_chunks
            )));
        }
        for (position, (record, span)) in self.chunks.iter().zip(plan.spans()).enumerate() {
            if record.index != position as u64 {
                return Err(invalid(format!(
                    "chunk at position {position} has index {}",
                    record.index
                )));
            }
            let expected = span.length + CHUNK_OVERHEAD as u64;
            if record.size != expected {
                return Err(invalid(format!(
                    "chunk {} is {} bytes, expected {expected}",
                    record.index, record.size
                )));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> VeilResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| VeilError::Other(anyhow::anyhow!("serializing manifest: {e}")))
    }

    /// Parse and validate manifest bytes.
    pub fn from_bytes(data: &[u8]) -> VeilResult<Self> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| invalid(format!("not a manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

fn invalid(msg: String) -> VeilError {
    VeilError::Other(anyhow::anyhow!("invalid manifest: {msg}"))
}

/// Best-effort MIME type from the file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        _ => "application/octet-stream",
    }
}
