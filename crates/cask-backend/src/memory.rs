//! In-process bucket.
//!
//! Clones share one bucket, so two clones behave like two clients of the same
//! remote store. Every write gets a strictly increasing timestamp, which keeps
//! "newer than" decisions deterministic even when writes land within the same
//! clock tick.
//!
//! Test hooks:
//! - [`MemoryBackend::counts`]: per-operation call counters
//! - [`MemoryBackend::set_transfer_latency`]: sleep inside upload/download
//! - [`MemoryBackend::set_unavailable`]: fail every call as transient

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::signing::UrlSigner;
use crate::{validate_key, Backend, BackendError, BackendResult, Grantee, HttpMethod, Timestamp};

/// URI scheme for in-memory buckets.
pub const SCHEME: &str = "mem";

/// Snapshot of backend call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub upload: u64,
    pub download: u64,
    pub delete: u64,
    pub timestamp: u64,
    pub signed_url: u64,
    pub grant_access: u64,
}

impl CallCounts {
    /// Calls that move object bytes across the wire.
    pub fn transfers(&self) -> u64 {
        self.upload + self.download
    }
}

#[derive(Debug, Default)]
struct Counters {
    upload: AtomicU64,
    download: AtomicU64,
    delete: AtomicU64,
    timestamp: AtomicU64,
    signed_url: AtomicU64,
    grant_access: AtomicU64,
}

#[derive(Debug)]
struct StoredObject {
    bytes: Arc<Vec<u8>>,
    updated: Timestamp,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    grants: HashMap<String, Vec<Grantee>>,
    last_write: Option<Timestamp>,
    created: bool,
}

#[derive(Debug)]
struct Inner {
    container: String,
    signer: UrlSigner,
    state: Mutex<State>,
    counters: Counters,
    transfer_latency: Mutex<Duration>,
    unavailable: AtomicBool,
}

/// Shared in-memory bucket.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new(container: impl Into<String>) -> Self {
        Self::with_signer(container, UrlSigner::generate())
    }

    /// Bucket issuing URLs signed with `signer`.
    pub fn with_signer(container: impl Into<String>, signer: UrlSigner) -> Self {
        Self {
            inner: Arc::new(Inner {
                container: container.into(),
                signer,
                state: Mutex::new(State::default()),
                counters: Counters::default(),
                transfer_latency: Mutex::new(Duration::ZERO),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Builder form of [`set_transfer_latency`](Self::set_transfer_latency).
    pub fn with_transfer_latency(self, latency: Duration) -> Self {
        self.set_transfer_latency(latency);
        self
    }

    /// Sleep for `latency` in every upload and download.
    pub fn set_transfer_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.inner.transfer_latency.lock() {
            *current = latency;
        }
    }

    /// While set, every call fails with [`BackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn counts(&self) -> CallCounts {
        let c = &self.inner.counters;
        CallCounts {
            upload: c.upload.load(Ordering::SeqCst),
            download: c.download.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            timestamp: c.timestamp.load(Ordering::SeqCst),
            signed_url: c.signed_url.load(Ordering::SeqCst),
            grant_access: c.grant_access.load(Ordering::SeqCst),
        }
    }

    pub fn reset_counts(&self) {
        let c = &self.inner.counters;
        for counter in [
            &c.upload,
            &c.download,
            &c.delete,
            &c.timestamp,
            &c.signed_url,
            &c.grant_access,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Raw object bytes, bypassing instrumentation.
    pub fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state().ok()?;
        state.objects.get(key).map(|o| o.bytes.as_ref().clone())
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grants recorded for `key`.
    pub fn grants(&self, key: &str) -> Vec<Grantee> {
        self.state()
            .ok()
            .and_then(|s| s.grants.get(key).cloned())
            .unwrap_or_default()
    }

    /// Whether the container has been created by a first call.
    pub fn is_created(&self) -> bool {
        self.state().map(|s| s.created).unwrap_or(false)
    }

    /// Resolve a signed URL and return the object bytes.
    pub fn fetch(&self, url: &str) -> BackendResult<Vec<u8>> {
        let signed = self
            .inner
            .signer
            .verify(url, HttpMethod::Get, Utc::now())
            .map_err(|e| BackendError::AccessDenied(e.to_string()))?;
        if signed.scheme != SCHEME || signed.container != self.inner.container {
            return Err(BackendError::AccessDenied(format!(
                "URL is for {}://{}",
                signed.scheme, signed.container
            )));
        }
        self.object_bytes(&signed.key)
            .ok_or(BackendError::ObjectNotFound { key: signed.key })
    }

    fn state(&self) -> BackendResult<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|_| BackendError::unavailable("bucket state lock poisoned"))
    }

    /// Common entry for every contract call: count it, honor fault
    /// injection, create the container on first use.
    fn enter(&self, counter: &AtomicU64) -> BackendResult<MutexGuard<'_, State>> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable(format!(
                "{}://{} is unreachable",
                SCHEME, self.inner.container
            )));
        }
        let mut state = self.state()?;
        if !state.created {
            tracing::info!(container = %self.inner.container, "container missing, creating");
            state.created = true;
        }
        Ok(state)
    }

    fn simulate_transfer(&self) {
        let latency = self
            .inner
            .transfer_latency
            .lock()
            .map(|l| *l)
            .unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    fn next_timestamp(state: &mut State) -> Timestamp {
        let now = Utc::now();
        let ts = match state.last_write {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        state.last_write = Some(ts);
        ts
    }
}

impl Backend for MemoryBackend {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn container(&self) -> BackendResult<String> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("container unreachable"));
        }
        let mut state = self.state()?;
        state.created = true;
        Ok(self.inner.container.clone())
    }

    fn upload(&self, key: &str, local_path: &Path) -> BackendResult<Timestamp> {
        validate_key(key)?;
        drop(self.enter(&self.inner.counters.upload)?);

        let bytes = fs::read(local_path)
            .map_err(|e| BackendError::unavailable(format!("upload {}: {}", key, e)))?;
        self.simulate_transfer();

        let mut state = self.state()?;
        let updated = Self::next_timestamp(&mut state);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                bytes: Arc::new(bytes),
                updated,
            },
        );
        tracing::debug!(key, container = %self.inner.container, "uploaded object");
        Ok(updated)
    }

    fn download(&self, key: &str, local_path: &Path) -> BackendResult<()> {
        validate_key(key)?;
        let bytes = {
            let state = self.enter(&self.inner.counters.download)?;
            state
                .objects
                .get(key)
                .map(|o| Arc::clone(&o.bytes))
                .ok_or_else(|| BackendError::ObjectNotFound {
                    key: key.to_string(),
                })?
        };
        self.simulate_transfer();

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::unavailable(format!("download {}: {}", key, e)))?;
        }
        fs::write(local_path, bytes.as_slice())
            .map_err(|e| BackendError::unavailable(format!("download {}: {}", key, e)))?;
        tracing::debug!(key, container = %self.inner.container, "downloaded object");
        Ok(())
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        validate_key(key)?;
        let mut state = self.enter(&self.inner.counters.delete)?;
        state.objects.remove(key);
        state.grants.remove(key);
        Ok(())
    }

    fn timestamp(&self, key: &str) -> BackendResult<Option<Timestamp>> {
        validate_key(key)?;
        let state = self.enter(&self.inner.counters.timestamp)?;
        Ok(state.objects.get(key).map(|o| o.updated))
    }

    fn signed_url(&self, key: &str, method: HttpMethod, ttl: Duration) -> BackendResult<String> {
        validate_key(key)?;
        drop(self.enter(&self.inner.counters.signed_url)?);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BackendError::unavailable(format!("invalid ttl: {}", e)))?;
        Ok(self
            .inner
            .signer
            .sign(SCHEME, &self.inner.container, key, method, Utc::now() + ttl))
    }

    fn grant_access(&self, key: &str, grantee: &Grantee) -> BackendResult<()> {
        validate_key(key)?;
        let mut state = self.enter(&self.inner.counters.grant_access)?;
        if !state.objects.contains_key(key) {
            return Err(BackendError::ObjectNotFound {
                key: key.to_string(),
            });
        }
        let grants = state.grants.entry(key.to_string()).or_default();
        if !grants.contains(grantee) {
            grants.push(grantee.clone());
        }
        Ok(())
    }
}
