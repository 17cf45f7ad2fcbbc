//! Multi-endpoint blob retrieval
//!
//! `GatewayFetcher` tries an ordered list of endpoints for each address:
//! - every attempt runs under its own deadline
//! - failures are classified (`FetchErrorKind`) and the next endpoint is tried,
//!   except after a non-retryable client error, which ends the fetch
//! - a payload that does not hash to its address counts as `Corrupt` and is
//!   never returned
//! - endpoints are ranked by recent health; configured order breaks ties
//!
//! When every candidate fails the caller gets `AllEndpointsFailed` with one
//! entry per attempted endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use opendal::{ErrorKind, Operator};
use tracing::{debug, warn};
use veil_chunks::verify_address;
use veil_core::config::{EndpointConfig, GatewayConfig};
use veil_core::{ContentAddress, EndpointFailure, FetchErrorKind, VeilError, VeilResult};

use crate::sink::blob_dir;

/// Weight of the newest latency sample in the moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// One place blobs can be read from.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    op: Operator,
    /// Prepended to the address to form the object path
    path_prefix: String,
}

impl Endpoint {
    /// Wrap an operator whose root holds blobs directly under their address.
    pub fn new(name: impl Into<String>, op: Operator) -> Self {
        Self {
            name: name.into(),
            op,
            path_prefix: String::new(),
        }
    }

    /// Read back from the ingestion backend (`{prefix}/blobs/{address}`).
    pub fn storage_readback(op: Operator, prefix: &str) -> Self {
        Self {
            name: "storage".into(),
            op,
            path_prefix: blob_dir(prefix),
        }
    }

    /// Build from config: `http(s)://` gateways or `file://` mirrors.
    pub fn from_config(cfg: &EndpointConfig, enforce_tls: bool) -> VeilResult<Self> {
        let url = cfg.url.trim_end_matches('/');
        let op = if let Some(dir) = url.strip_prefix("file://") {
            let builder = opendal::services::Fs::default().root(dir);
            Operator::new(builder)
                .map_err(|e| VeilError::Config(format!("endpoint {}: {e}", cfg.name)))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        } else if url.starts_with("https://") || url.starts_with("http://") {
            if enforce_tls && url.starts_with("http://") {
                return Err(VeilError::Config(format!(
                    "endpoint {} uses plaintext HTTP ({url}), but enforce_tls is enabled",
                    cfg.name
                )));
            }
            // No RetryLayer: fallback to the next endpoint is the retry policy.
            let builder = opendal::services::Http::default().endpoint(url);
            Operator::new(builder)
                .map_err(|e| VeilError::Config(format!("endpoint {}: {e}", cfg.name)))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        } else {
            return Err(VeilError::Config(format!(
                "endpoint {}: unsupported url {url:?} (expected http(s):// or file://)",
                cfg.name
            )));
        };
        Ok(Self::new(cfg.name.clone(), op))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn path_for(&self, address: &ContentAddress) -> String {
        format!("{}{}", self.path_prefix, address)
    }
}

/// Rolling health of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndpointHealth {
    pub consecutive_failures: u32,
    /// Moving average of successful fetch latency; `None` until first success
    pub latency_ms: Option<f64>,
}

impl EndpointHealth {
    fn record_success(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.consecutive_failures = 0;
        self.latency_ms = Some(match self.latency_ms {
            Some(prev) => prev + LATENCY_EWMA_ALPHA * (sample - prev),
            None => sample,
        });
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// A verified payload and the endpoint that served it.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub source: String,
}

pub struct GatewayFetcher {
    endpoints: Vec<Endpoint>,
    health: Mutex<Vec<EndpointHealth>>,
    attempt_timeout: Duration,
    rank_by_health: bool,
}

impl GatewayFetcher {
    pub fn new(endpoints: Vec<Endpoint>, cfg: &GatewayConfig) -> VeilResult<Self> {
        if endpoints.is_empty() {
            return Err(VeilError::Config("no retrieval endpoints configured".into()));
        }
        let health = vec![EndpointHealth::default(); endpoints.len()];
        Ok(Self {
            endpoints,
            health: Mutex::new(health),
            attempt_timeout: cfg.attempt_timeout(),
            rank_by_health: cfg.rank_by_health,
        })
    }

    /// Endpoints from `cfg`, or `fallback` when none are configured.
    pub fn from_config(
        cfg: &GatewayConfig,
        enforce_tls: bool,
        fallback: Option<Endpoint>,
    ) -> VeilResult<Self> {
        let mut endpoints = cfg
            .endpoints
            .iter()
            .map(|e| Endpoint::from_config(e, enforce_tls))
            .collect::<VeilResult<Vec<_>>>()?;
        if endpoints.is_empty() {
            endpoints.extend(fallback);
        }
        Self::new(endpoints, cfg)
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }

    /// Snapshot of per-endpoint health, in configured order.
    pub fn health(&self) -> Vec<(String, EndpointHealth)> {
        let health = self.lock_health();
        self.endpoints
            .iter()
            .zip(health.iter())
            .map(|(e, h)| (e.name.clone(), *h))
            .collect()
    }

    /// Order in which endpoints will be tried for the next fetch.
    pub fn candidate_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.endpoints.len()).collect();
        if !self.rank_by_health {
            return order;
        }
        let health = self.lock_health();
        // Stable sort keeps configured order among equals.
        order.sort_by(|&a, &b| {
            let (ha, hb) = (&health[a], &health[b]);
            ha.consecutive_failures
                .cmp(&hb.consecutive_failures)
                .then_with(|| {
                    let la = ha.latency_ms.unwrap_or(0.0);
                    let lb = hb.latency_ms.unwrap_or(0.0);
                    la.total_cmp(&lb)
                })
        });
        order
    }

    /// Fetch and verify the blob at `address`.
    pub async fn fetch(&self, address: &ContentAddress) -> VeilResult<Fetched> {
        let mut failures = Vec::new();

        for idx in self.candidate_order() {
            let endpoint = &self.endpoints[idx];
            let started = Instant::now();

            match self.attempt(endpoint, address).await {
                Ok(bytes) => {
                    self.lock_health()[idx].record_success(started.elapsed());
                    debug!(
                        endpoint = %endpoint.name,
                        address = %address.short(),
                        bytes = bytes.len(),
                        "fetched"
                    );
                    return Ok(Fetched {
                        bytes,
                        source: endpoint.name.clone(),
                    });
                }
                Err((kind, message)) => {
                    self.lock_health()[idx].record_failure();
                    warn!(
                        endpoint = %endpoint.name,
                        address = %address.short(),
                        kind = %kind,
                        "fetch attempt failed: {message}"
                    );
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        kind,
                        message,
                    });
                    if !kind.continues_to_next() {
                        break;
                    }
                }
            }
        }

        Err(VeilError::AllEndpointsFailed {
            address: address.to_string(),
            failures,
        })
    }

    /// Try `address` against every endpoint in configured order, without
    /// falling through. Used by health checks; results feed the ranking.
    pub async fn probe(
        &self,
        address: &ContentAddress,
    ) -> Vec<(String, Result<Duration, EndpointFailure>)> {
        let mut results = Vec::with_capacity(self.endpoints.len());
        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            let started = Instant::now();
            let outcome = match self.attempt(endpoint, address).await {
                Ok(_) => {
                    let elapsed = started.elapsed();
                    self.lock_health()[idx].record_success(elapsed);
                    Ok(elapsed)
                }
                Err((kind, message)) => {
                    self.lock_health()[idx].record_failure();
                    Err(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        kind,
                        message,
                    })
                }
            };
            results.push((endpoint.name.clone(), outcome));
        }
        results
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        address: &ContentAddress,
    ) -> Result<Vec<u8>, (FetchErrorKind, String)> {
        let path = endpoint.path_for(address);
        let buf = match tokio::time::timeout(self.attempt_timeout, endpoint.op.read(&path)).await {
            Err(_) => {
                return Err((
                    FetchErrorKind::Timeout,
                    format!("no response within {:?}", self.attempt_timeout),
                ))
            }
            Ok(Err(e)) => return Err((classify_error(&e), e.to_string())),
            Ok(Ok(buf)) => buf,
        };

        let bytes = buf.to_vec();
        if !verify_address(address, &bytes) {
            return Err((
                FetchErrorKind::Corrupt,
                format!("payload of {} bytes does not hash to the requested address", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, Vec<EndpointHealth>> {
        self.health.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Map an OpenDAL error onto the retrieval taxonomy.
pub fn classify_error(e: &opendal::Error) -> FetchErrorKind {
    match e.kind() {
        ErrorKind::NotFound => FetchErrorKind::NotFound,
        ErrorKind::RateLimited => FetchErrorKind::TransientServer,
        ErrorKind::PermissionDenied
        | ErrorKind::ConfigInvalid
        | ErrorKind::Unsupported
        | ErrorKind::IsADirectory
        | ErrorKind::RangeNotSatisfied => FetchErrorKind::NonRetryableClient,
        _ if e.is_temporary() => FetchErrorKind::TransientServer,
        _ => FetchErrorKind::Network,
    }
}
