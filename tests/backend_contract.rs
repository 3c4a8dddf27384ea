//! Backend contract suite, run against every in-tree adapter.

use std::fs;
use std::path::Path;
use std::time::Duration;

use cask::{Backend, BackendError, FsBackend, Grantee, HttpMethod, MemoryBackend};
use cask_backend::BackendResult;
use tempfile::TempDir;

fn write_local(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// Exercise every contract operation. `fetch` resolves a signed URL.
fn run_contract(
    backend: &dyn Backend,
    scheme: &str,
    container: &str,
    fetch: &dyn Fn(&str) -> BackendResult<Vec<u8>>,
) {
    let temp = TempDir::new().unwrap();
    let key = "runs/42/output.tgz";

    // Container and location
    assert_eq!(backend.scheme(), scheme);
    assert_eq!(backend.container().unwrap(), container);
    assert_eq!(
        backend.qualified_location(key).unwrap(),
        format!("{}://{}/{}", scheme, container, key)
    );

    // Absent object
    assert!(backend.timestamp(key).unwrap().is_none());
    assert!(matches!(
        backend.download(key, &temp.path().join("nothing")),
        Err(BackendError::ObjectNotFound { .. })
    ));
    backend.delete(key).unwrap();

    // Upload / download
    let v1 = write_local(temp.path(), "v1", b"first version");
    let first = backend.upload(key, &v1).unwrap();
    assert_eq!(backend.timestamp(key).unwrap(), Some(first));

    let out = temp.path().join("nested/out");
    backend.download(key, &out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"first version");

    // Overwrite moves the timestamp forward (fs mtime may share a tick)
    std::thread::sleep(Duration::from_millis(20));
    let v2 = write_local(temp.path(), "v2", b"second version");
    let second = backend.upload(key, &v2).unwrap();
    assert_eq!(backend.timestamp(key).unwrap(), Some(second));
    assert!(second >= first);
    backend.download(key, &out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"second version");

    // Signed URL
    let url = backend.signed_url(key, HttpMethod::Get, Duration::from_secs(60)).unwrap();
    assert!(url.starts_with(&format!("{}://{}/{}?", scheme, container, key)));
    assert_eq!(fetch(&url).unwrap(), b"second version");
    let put_url = backend.signed_url(key, HttpMethod::Put, Duration::from_secs(60)).unwrap();
    assert!(matches!(fetch(&put_url), Err(BackendError::AccessDenied(_))));

    // Grants
    backend.grant_access(key, &Grantee::Public).unwrap();
    backend
        .grant_access(key, &Grantee::User("alice".to_string()))
        .unwrap();
    assert!(matches!(
        backend.grant_access("missing", &Grantee::Public),
        Err(BackendError::ObjectNotFound { .. })
    ));

    // Delete, twice
    backend.delete(key).unwrap();
    backend.delete(key).unwrap();
    assert!(backend.timestamp(key).unwrap().is_none());

    // Keys that cannot name an object
    for bad in ["", "/abs", "a/../../b"] {
        assert!(matches!(
            backend.upload(bad, &v1),
            Err(BackendError::InvalidKey { .. })
        ));
    }
}

#[test]
fn test_fs_backend_contract() {
    let temp = TempDir::new().unwrap();
    let backend = FsBackend::new(temp.path(), "fs-bucket");
    run_contract(&backend, "file", "fs-bucket", &|url| backend.fetch(url));

    let grants_after_delete = backend.grants("runs/42/output.tgz").unwrap();
    assert!(grants_after_delete.is_empty());
}

#[test]
fn test_memory_backend_contract() {
    let backend = MemoryBackend::new("mem-bucket");
    run_contract(&backend, "mem", "mem-bucket", &|url| backend.fetch(url));

    let counts = backend.counts();
    assert!(counts.upload >= 2);
    assert!(counts.download >= 2);
    assert_eq!(counts.signed_url, 2);
    assert!(backend.grants("runs/42/output.tgz").is_empty());
}

#[test]
fn test_fs_backend_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let local = write_local(temp.path(), "obj", b"persisted");

    FsBackend::new(temp.path(), "bucket")
        .upload("k", &local)
        .unwrap();

    let reopened = FsBackend::new(temp.path(), "bucket");
    let out = temp.path().join("out");
    reopened.download("k", &out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"persisted");
}
