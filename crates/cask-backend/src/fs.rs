//! Filesystem-backed bucket.
//!
//! Layout under `<root>/<container>/`:
//! - `objects/<key>`: object bytes; mtime is the object timestamp
//! - `acl/<key>.json`: access grants
//! - `.tmp/`: in-flight uploads, renamed into place when complete

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::signing::UrlSigner;
use crate::{validate_key, Backend, BackendError, BackendResult, Grantee, HttpMethod, Timestamp};

/// URI scheme for filesystem buckets.
pub const SCHEME: &str = "file";

#[derive(Debug, Default, Serialize, Deserialize)]
struct AclRecord {
    grants: Vec<AclGrant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AclGrant {
    grantee: Grantee,
    role: String,
}

/// Bucket stored in a local directory.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    container: String,
    signer: UrlSigner,
    /// Container directory, set once it is known to exist
    container_dir: OnceLock<PathBuf>,
}

impl FsBackend {
    /// Bucket `container` under `root`. Nothing touches the disk until first use.
    pub fn new(root: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container: container.into(),
            signer: UrlSigner::generate(),
            container_dir: OnceLock::new(),
        }
    }

    /// Use `signer` for signed URLs instead of a per-process key.
    pub fn with_signer(mut self, signer: UrlSigner) -> Self {
        self.signer = signer;
        self
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Resolve a signed URL and return the object bytes, as an HTTP GET of
    /// the URL would.
    pub fn fetch(&self, url: &str) -> BackendResult<Vec<u8>> {
        let signed = self
            .signer
            .verify(url, HttpMethod::Get, Utc::now())
            .map_err(|e| BackendError::AccessDenied(e.to_string()))?;
        if signed.scheme != SCHEME || signed.container != self.container {
            return Err(BackendError::AccessDenied(format!(
                "URL is for {}://{}",
                signed.scheme, signed.container
            )));
        }

        let path = self.object_path(&signed.key)?;
        let mut bytes = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| BackendError::from_io(&signed.key, e))?;
        Ok(bytes)
    }

    /// Grants recorded for `key`.
    pub fn grants(&self, key: &str) -> BackendResult<Vec<Grantee>> {
        let record = self.read_acl(key)?;
        Ok(record.grants.into_iter().map(|g| g.grantee).collect())
    }

    /// Container directory, created on first use.
    fn ensure_container(&self) -> BackendResult<&Path> {
        if let Some(dir) = self.container_dir.get() {
            return Ok(dir.as_path());
        }

        let dir = self.root.join(&self.container);
        if !dir.exists() {
            tracing::info!(container = %self.container, root = %self.root.display(), "container missing, creating");
        }
        fs::create_dir_all(dir.join("objects"))
            .and_then(|_| fs::create_dir_all(dir.join("acl")))
            .and_then(|_| fs::create_dir_all(dir.join(".tmp")))
            .map_err(|e| BackendError::unavailable(format!("cannot create container {}: {}", self.container, e)))?;

        Ok(self.container_dir.get_or_init(|| dir).as_path())
    }

    fn object_path(&self, key: &str) -> BackendResult<PathBuf> {
        validate_key(key)?;
        Ok(self.ensure_container()?.join("objects").join(key))
    }

    fn acl_path(&self, key: &str) -> BackendResult<PathBuf> {
        validate_key(key)?;
        Ok(self.ensure_container()?.join("acl").join(format!("{}.json", key)))
    }

    fn read_acl(&self, key: &str) -> BackendResult<AclRecord> {
        let path = self.acl_path(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| BackendError::unavailable(format!("corrupt ACL for {}: {}", key, e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(AclRecord::default()),
            Err(e) => Err(BackendError::from_io(key, e)),
        }
    }
}

impl Backend for FsBackend {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn container(&self) -> BackendResult<String> {
        self.ensure_container()?;
        Ok(self.container.clone())
    }

    fn upload(&self, key: &str, local_path: &Path) -> BackendResult<Timestamp> {
        let object = self.object_path(key)?;
        let temp = self
            .ensure_container()?
            .join(".tmp")
            .join(format!(".tmp.{}", uuid::Uuid::new_v4()));

        // Stream into a new file so the object's mtime is the upload time.
        // The mtime is read from our own handle; rename keeps it.
        let result = (|| -> io::Result<SystemTime> {
            let mut src = File::open(local_path)?;
            let mut dst = File::create(&temp)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
            let modified = dst.metadata()?.modified()?;
            drop(dst);
            if let Some(parent) = object.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&temp, &object)?;
            Ok(modified)
        })();

        match result {
            Ok(modified) => {
                tracing::debug!(key, container = %self.container, "uploaded object");
                Ok(Timestamp::from(modified))
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                // A missing local file is the caller's problem, not a missing object
                Err(BackendError::unavailable(format!("upload {}: {}", key, e)))
            }
        }
    }

    fn download(&self, key: &str, local_path: &Path) -> BackendResult<()> {
        let object = self.object_path(key)?;
        if !object.is_file() {
            return Err(BackendError::ObjectNotFound {
                key: key.to_string(),
            });
        }
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackendError::unavailable(format!("download {}: {}", key, e)))?;
        }
        fs::copy(&object, local_path).map_err(|e| BackendError::from_io(key, e))?;

        tracing::debug!(key, container = %self.container, "downloaded object");
        Ok(())
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        let object = self.object_path(key)?;
        match fs::remove_file(&object) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackendError::from_io(key, e)),
        }
        match fs::remove_file(self.acl_path(key)?) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackendError::from_io(key, e)),
        }
        Ok(())
    }

    fn timestamp(&self, key: &str) -> BackendResult<Option<Timestamp>> {
        let object = self.object_path(key)?;
        match fs::metadata(&object) {
            Ok(meta) if meta.is_file() => {
                let modified = meta.modified().map_err(|e| BackendError::from_io(key, e))?;
                Ok(Some(Timestamp::from(modified)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::from_io(key, e)),
        }
    }

    fn signed_url(&self, key: &str, method: HttpMethod, ttl: Duration) -> BackendResult<String> {
        validate_key(key)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BackendError::unavailable(format!("invalid ttl: {}", e)))?;
        Ok(self
            .signer
            .sign(SCHEME, &self.container()?, key, method, Utc::now() + ttl))
    }

    fn grant_access(&self, key: &str, grantee: &Grantee) -> BackendResult<()> {
        if self.timestamp(key)?.is_none() {
            return Err(BackendError::ObjectNotFound {
                key: key.to_string(),
            });
        }

        let mut record = self.read_acl(key)?;
        let grant = AclGrant {
            grantee: grantee.clone(),
            role: "owner".to_string(),
        };
        if record.grants.contains(&grant) {
            return Ok(());
        }
        record.grants.push(grant);

        let path = self.acl_path(key)?;
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| BackendError::unavailable(format!("serialize ACL for {}: {}", key, e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackendError::from_io(key, e))?;
        }
        fs::write(&path, json).map_err(|e| BackendError::from_io(key, e))?;

        tracing::info!(key, %grantee, "granted owner access");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> FsBackend {
        FsBackend::new(dir.path().join("buckets"), "test-bucket")
    }

    fn local_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_container_created_lazily() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);

        assert!(!dir.path().join("buckets/test-bucket").exists());
        assert_eq!(b.container().unwrap(), "test-bucket");
        assert!(dir.path().join("buckets/test-bucket/objects").is_dir());
    }

    #[test]
    fn test_upload_download() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        let src = local_file(&dir, "in.txt", "payload");

        b.upload("tests/obj.txt", &src).unwrap();
        let out = dir.path().join("out/obj.txt");
        b.download("tests/obj.txt", &out).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "payload");
    }

    #[test]
    fn test_download_missing() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);

        let err = b.download("missing", &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, BackendError::ObjectNotFound { .. }));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_timestamp_and_delete() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        let src = local_file(&dir, "in.txt", "payload");

        assert!(b.timestamp("k").unwrap().is_none());
        let uploaded_at = b.upload("k", &src).unwrap();
        assert_eq!(b.timestamp("k").unwrap(), Some(uploaded_at));

        b.delete("k").unwrap();
        assert!(b.timestamp("k").unwrap().is_none());
        b.delete("k").unwrap();
    }

    #[test]
    fn test_upload_missing_local_file_is_not_object_not_found() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);

        let err = b.upload("k", &dir.path().join("nope")).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_signed_url_fetch() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        let src = local_file(&dir, "in.txt", "signed bytes");
        b.upload("k.txt", &src).unwrap();

        let url = b.signed_url("k.txt", HttpMethod::Get, Duration::from_secs(60)).unwrap();
        assert!(url.starts_with("file://test-bucket/k.txt?"));
        assert_eq!(b.fetch(&url).unwrap(), b"signed bytes");

        let put_url = b.signed_url("k.txt", HttpMethod::Put, Duration::from_secs(60)).unwrap();
        assert!(matches!(b.fetch(&put_url), Err(BackendError::AccessDenied(_))));
    }

    #[test]
    fn test_grant_access() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        let src = local_file(&dir, "in.txt", "x");

        let err = b.grant_access("k", &Grantee::Public).unwrap_err();
        assert!(matches!(err, BackendError::ObjectNotFound { .. }));

        b.upload("k", &src).unwrap();
        b.grant_access("k", &Grantee::User("alice".to_string())).unwrap();
        b.grant_access("k", &Grantee::Public).unwrap();
        b.grant_access("k", &Grantee::Public).unwrap();

        let grants = b.grants("k").unwrap();
        assert_eq!(
            grants,
            vec![Grantee::User("alice".to_string()), Grantee::Public]
        );
    }

    #[test]
    fn test_qualified_location() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        assert_eq!(
            b.qualified_location("a/b.tgz").unwrap(),
            "file://test-bucket/a/b.tgz"
        );
    }

    #[test]
    fn test_invalid_key_rejected() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir);
        let err = b.timestamp("../escape").unwrap_err();
        assert!(matches!(err, BackendError::InvalidKey { .. }));
    }
}
