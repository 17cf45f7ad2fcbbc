//! OpenDAL Operator factory for the ingestion backend

use anyhow::{Context, Result};
use opendal::Operator;
use veil_core::config::{expand_tilde, StorageConfig, StorageScheme};

/// S3 credentials, loaded from the environment by the caller.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build the operator for `cfg.scheme`.
///
/// S3 uses path-style addressing (the opendal 0.55 default), which MinIO and
/// SeaweedFS require.
pub fn build_operator(cfg: &StorageConfig, creds: Option<&S3Credentials>) -> Result<Operator> {
    let op = match cfg.scheme {
        StorageScheme::Fs => {
            let root = expand_tilde(&cfg.root);
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        StorageScheme::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        StorageScheme::S3 => {
            let creds = creds.context(
                "S3 storage needs credentials: export AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY",
            )?;
            let builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);
            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish()
        }
    };
    Ok(op)
}

/// Build an operator after applying the TLS policy.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an
/// error. Otherwise a warning is logged for non-HTTPS endpoints.
pub fn build_from_config(storage: &StorageConfig, creds: Option<&S3Credentials>) -> Result<Operator> {
    if storage.scheme == StorageScheme::S3 && storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }
    build_operator(storage, creds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> S3Credentials {
        S3Credentials {
            access_key_id: "test-key".into(),
            secret_access_key: "test-secret".into(),
        }
    }

    #[test]
    fn test_build_memory_operator() {
        let cfg = StorageConfig {
            scheme: StorageScheme::Memory,
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_ok());
    }

    #[test]
    fn test_build_fs_operator() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            scheme: StorageScheme::Fs,
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_ok());
    }

    #[test]
    fn test_s3_requires_credentials() {
        let cfg = StorageConfig {
            scheme: StorageScheme::S3,
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_err());
        assert!(build_operator(&cfg, Some(&creds())).is_ok());
    }

    #[test]
    fn test_http_endpoint_with_enforce_tls_fails() {
        let storage = StorageConfig {
            scheme: StorageScheme::S3,
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let result = build_from_config(&storage, Some(&creds()));
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(result.unwrap_err().to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_https_endpoint_with_enforce_tls() {
        let storage = StorageConfig {
            scheme: StorageScheme::S3,
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_from_config(&storage, Some(&creds())).is_ok());
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let dbg = format!("{:?}", creds());
        assert!(!dbg.contains("test-secret"));
    }
}
