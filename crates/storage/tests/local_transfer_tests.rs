//! Local filesystem and mixed local/remote transfer tests.

use bytes::Bytes;
use nwp_common::{Locator, NwpError, Scheme};
use storage::{ObjectStorage, ObjectStorageConfig, ObjectStoreHandle};
use tempfile::TempDir;

fn storage() -> ObjectStorage {
    ObjectStorage::new(ObjectStorageConfig::default())
}

fn file_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

/// Several megabytes, so every path moves it in many chunks.
fn large_payload() -> Vec<u8> {
    (0..12 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// transfer() dispatch
// ============================================================================

#[tokio::test]
async fn test_transfer_remote_to_local_creates_parents() {
    let dir = TempDir::new().unwrap();
    let storage = storage();
    let src = Locator::remote(Scheme::Memory, "noaa", "gfs.20240101/00/atmos/f000");
    storage
        .write_bytes(&src, Bytes::from_static(b"GRIB....7777"))
        .await
        .unwrap();

    let dst = Locator::local(dir.path().join("gfs/0p25/20240101/00/f000"));
    let n = storage.transfer(&src, &dst).await.unwrap();

    assert_eq!(n, 12);
    assert!(storage.exists(&dst).await.unwrap());
    let on_disk = std::fs::read(dst.as_local_path().unwrap()).unwrap();
    assert_eq!(on_disk, b"GRIB....7777");
}

#[tokio::test]
async fn test_transfer_local_to_remote() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("out.zarr/.zgroup");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"{\"zarr_format\": 2}").unwrap();

    let storage = storage();
    let dst = Locator::remote(Scheme::Memory, "outputs", "run/out.zarr/.zgroup");
    storage.transfer(&Locator::local(&file), &dst).await.unwrap();

    assert!(storage.exists(&dst).await.unwrap());
    assert_eq!(
        storage.read_bytes(&dst).await.unwrap(),
        Bytes::from_static(b"{\"zarr_format\": 2}")
    );
}

#[tokio::test]
async fn test_transfer_across_buckets() {
    let storage = storage();
    let src = Locator::remote(Scheme::Memory, "source", "a.grib");
    let dst = Locator::remote(Scheme::Memory, "dest", "copied/a.grib");
    storage.write_bytes(&src, Bytes::from_static(b"abc")).await.unwrap();

    assert_eq!(storage.transfer(&src, &dst).await.unwrap(), 3);
    assert!(storage.exists(&dst).await.unwrap());
}

#[tokio::test]
async fn test_local_write_leaves_no_partial_file() {
    let dir = TempDir::new().unwrap();
    let storage = storage();
    let dst = Locator::local(dir.path().join("f003"));

    storage.write_bytes(&dst, Bytes::from_static(b"x")).await.unwrap();

    assert_eq!(file_names(dir.path()), vec!["f003".to_string()]);
}

// ============================================================================
// Streamed transfers
// ============================================================================

#[tokio::test]
async fn test_large_object_streams_through_every_path() {
    let dir = TempDir::new().unwrap();
    let storage = storage();
    let payload = large_payload();
    let src = Locator::remote(Scheme::Memory, "noaa", "gfs.20240101/00/atmos/f384");
    storage
        .write_bytes(&src, Bytes::from(payload.clone()))
        .await
        .unwrap();

    // remote -> local
    let local = Locator::local(dir.path().join("f384"));
    let n = storage.transfer(&src, &local).await.unwrap();
    assert_eq!(n, payload.len() as u64);
    assert_eq!(std::fs::read(dir.path().join("f384")).unwrap(), payload);
    assert_eq!(file_names(dir.path()), vec!["f384".to_string()]);

    // local -> remote
    let uploaded = Locator::remote(Scheme::Memory, "outputs", "run/f384");
    let n = storage.transfer(&local, &uploaded).await.unwrap();
    assert_eq!(n, payload.len() as u64);
    assert_eq!(storage.read_bytes(&uploaded).await.unwrap(), Bytes::from(payload.clone()));

    // remote -> remote, different bucket
    let mirrored = Locator::remote(Scheme::Memory, "mirror", "gfs/f384");
    let n = storage.transfer(&src, &mirrored).await.unwrap();
    assert_eq!(n, payload.len() as u64);
    assert_eq!(storage.read_bytes(&mirrored).await.unwrap(), Bytes::from(payload));
}

#[tokio::test]
async fn test_failed_download_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let storage = storage();
    let src = Locator::remote(Scheme::Memory, "noaa", "gfs.20240101/00/atmos/f999");
    let dst = Locator::local(dir.path().join("gfs/f999"));

    let err = storage.transfer(&src, &dst).await.unwrap_err();

    assert!(matches!(err, NwpError::NotFound(_)));
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test]
async fn test_local_copy_goes_through_partial_file() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("incoming/f006");
    std::fs::create_dir_all(src.parent().unwrap()).unwrap();
    std::fs::write(&src, b"GRIB-f006-7777").unwrap();

    let storage = storage();
    let dst = dir.path().join("archive/gfs/f006");
    let n = storage
        .transfer(&Locator::local(&src), &Locator::local(&dst))
        .await
        .unwrap();

    assert_eq!(n, 14);
    assert_eq!(std::fs::read(&dst).unwrap(), b"GRIB-f006-7777");
    assert_eq!(file_names(dst.parent().unwrap()), vec!["f006".to_string()]);
}

#[tokio::test]
async fn test_failed_local_copy_leaves_no_partial() {
    let dir = TempDir::new().unwrap();
    let storage = storage();
    let dst = dir.path().join("archive/f012");

    let err = storage
        .transfer(
            &Locator::local(dir.path().join("missing")),
            &Locator::local(&dst),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, NwpError::NotFound(_)));
    assert!(file_names(dst.parent().unwrap()).is_empty());
}

// ============================================================================
// list() / delete()
// ============================================================================

#[tokio::test]
async fn test_list_local_is_recursive_and_sorted() {
    let dir = TempDir::new().unwrap();
    for rel in ["b/2", "a/1", "a/nested/3"] {
        let p = dir.path().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"x").unwrap();
    }

    let listed = storage().list(&Locator::local(dir.path())).await.unwrap();
    let rel: Vec<_> = listed
        .iter()
        .map(|l| {
            l.as_local_path()
                .unwrap()
                .strip_prefix(dir.path())
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    assert_eq!(rel, vec!["a/1", "a/nested/3", "b/2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_list_local_runs_off_the_async_workers() {
    let dir = TempDir::new().unwrap();
    for i in 0..50 {
        std::fs::write(dir.path().join(format!("f{:03}", i)), b"x").unwrap();
    }

    let storage = std::sync::Arc::new(storage());
    let root = Locator::local(dir.path());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let storage = storage.clone();
            let root = root.clone();
            tokio::spawn(async move { storage.list(&root).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 50);
    }
}

#[tokio::test]
async fn test_list_missing_local_dir_is_empty() {
    let dir = TempDir::new().unwrap();
    let listed = storage()
        .list(&Locator::local(dir.path().join("absent")))
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_delete_local_then_missing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("f000");
    std::fs::write(&path, b"x").unwrap();

    let storage = storage();
    let loc = Locator::local(&path);
    storage.delete(&loc).await.unwrap();
    assert!(!storage.exists(&loc).await.unwrap());
    assert!(matches!(storage.delete(&loc).await, Err(NwpError::NotFound(_))));
}
