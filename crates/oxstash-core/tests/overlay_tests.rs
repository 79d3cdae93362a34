//! End-to-end tests of the encrypted filesystem over the in-memory backend.
//!
//! Focus areas:
//! - Keys are deterministic and never contain cleartext
//! - Content and sizes survive the round trip
//! - Written files are discoverable from every ancestor
//! - Removal cascades through emptied directories, never past the root

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    MaskedListingBackend, encrypted_memory, init_tracing, names, sized_content, test_config,
};
use oxstash_core::backend::{
    EntryType, MemoryBackend, Metadata, RemoveOptions, StorageBackend, Visitor,
};
use oxstash_core::cache::MemoryCache;
use oxstash_core::overlay::{EncryptedClient, EncryptionConfig};
use oxstash_core::stream::ByteSource;
use oxstash_core::{StorageError, StoragePath};

async fn read_all(fs: &EncryptedClient, path: &str) -> Bytes {
    ByteSource::from_stream(fs.read(path).await.expect("read"))
        .collect()
        .await
        .expect("read stream")
}

#[tokio::test]
async fn test_keys_are_deterministic_across_instances() {
    init_tracing();
    let (store, fs) = encrypted_memory();
    fs.write("docs/report.txt", "quarterly".into()).await.unwrap();

    let reopened = EncryptedClient::uncached(store.clone(), &test_config()).unwrap();
    assert_eq!(
        fs.codec().encrypt_path("docs/report.txt"),
        reopened.codec().encrypt_path("/docs/report.txt/")
    );
    assert_eq!(read_all(&reopened, "docs/report.txt").await, "quarterly");
}

#[tokio::test]
async fn test_backend_never_sees_cleartext() {
    let (store, fs) = encrypted_memory();
    fs.write("secret-folder/secret-file.txt", "secret-content".into())
        .await
        .unwrap();

    let keys = store.keys().await;
    // Two dirent entries, one content object, one sidecar
    assert_eq!(keys.len(), 4);
    for key in keys {
        assert!(!key.contains("secret"), "cleartext in key {key}");
        let raw = store.raw(&key).await.unwrap();
        assert!(
            !raw.windows(6).any(|w| w == b"secret"),
            "cleartext in object {key}"
        );
    }
}

#[tokio::test]
async fn test_round_trip_and_size() {
    let (_store, fs) = encrypted_memory();
    for (path, size) in [("empty.bin", 0), ("small.bin", 5), ("large.bin", 300_000)] {
        let content = sized_content(size);
        let written = fs.write(path, content.clone().into()).await.unwrap();
        assert_eq!(written, size as u64);
        assert_eq!(read_all(&fs, path).await, content);

        let meta = fs.metadata(path).await.unwrap();
        assert_eq!(meta.size, Some(size as u64));
        assert_eq!(meta.entry_type, EntryType::File);
    }
}

#[tokio::test]
async fn test_write_from_chunks_and_channel() {
    let (_store, fs) = encrypted_memory();

    let chunks = vec![Bytes::from_static(b"abc"), Bytes::new(), Bytes::from_static(b"defg")];
    let written = fs.write("pulled", ByteSource::from_chunks(chunks)).await.unwrap();
    assert_eq!(written, 7);
    assert_eq!(read_all(&fs, "pulled").await, "abcdefg");

    let (sink, source) = ByteSource::channel(2);
    let producer = tokio::spawn(async move {
        for i in 0..10u8 {
            sink.send(vec![i; 1000]).await.unwrap();
        }
        sink.finish();
    });
    let written = fs.write("pushed", source).await.unwrap();
    producer.await.unwrap();
    assert_eq!(written, 10_000);
    let data = read_all(&fs, "pushed").await;
    assert_eq!(data.len(), 10_000);
    assert_eq!(data[9_999], 9);
}

#[tokio::test]
async fn test_failed_source_fails_write() {
    let (_store, fs) = encrypted_memory();
    let (sink, source) = ByteSource::channel(1);
    tokio::spawn(async move {
        sink.send("partial").await.unwrap();
        sink.fail(StorageError::backend("producer crashed", Default::default()))
            .await;
    });
    let err = fs.write("broken", source).await.unwrap_err();
    assert!(matches!(err, StorageError::Backend { .. }), "{err}");
}

#[tokio::test]
async fn test_directory_discoverability() {
    let (_store, fs) = encrypted_memory();
    fs.write("/a/b/c.txt", "hello".into()).await.unwrap();

    let in_b = fs.list("/a/b", false, None).await.unwrap();
    assert_eq!(names(&in_b), vec!["c.txt"]);
    assert_eq!(in_b[0].name, "a/b/c.txt");

    let in_a = fs.list("/a", false, None).await.unwrap();
    assert_eq!(in_a, vec![Metadata::dir("a/b").with_mtime(in_a[0].mtime)]);

    let root = fs.list("", false, None).await.unwrap();
    assert_eq!(names(&root), vec!["a"]);
    assert!(root[0].is_dir());
}

#[tokio::test]
async fn test_listing_is_sorted_and_mixed() {
    let (_store, fs) = encrypted_memory();
    for path in ["d/zeta", "d/alpha", "d/mid/x", "d/beta"] {
        fs.write(path, "x".into()).await.unwrap();
    }
    let listing = fs.list("d", false, None).await.unwrap();
    let listed: Vec<&str> = listing.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(listed, vec!["d/alpha", "d/beta", "d/mid", "d/zeta"]);
    assert!(listing[2].is_dir());
}

#[tokio::test]
async fn test_scenario_x_y_z() {
    let (_store, fs) = encrypted_memory();
    assert_eq!(fs.write("x/y/z", "hello".into()).await.unwrap(), 5);

    let meta = fs.metadata("x/y/z").await.unwrap();
    assert_eq!(meta.size, Some(5));
    assert_eq!(meta.entry_type, EntryType::File);

    assert_eq!(names(&fs.list("x/y", false, None).await.unwrap()), vec!["z"]);

    fs.remove("x/y/z", RemoveOptions::default()).await.unwrap();
    let in_x = safe_names(&fs, "x").await;
    assert!(!in_x.contains(&"y".to_string()));
}

#[tokio::test]
async fn test_single_file_listing_uses_parent() {
    let (_store, fs) = encrypted_memory();
    fs.write("a/b/c.txt", "hello".into()).await.unwrap();
    fs.write("a/b/other.txt", "world!".into()).await.unwrap();

    let listing = fs.list("/a/b/c.txt", false, None).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0], fs.metadata("a/b/c.txt").await.unwrap());

    // Also for a top-level file, whose parent is the root
    fs.write("top.txt", "t".into()).await.unwrap();
    assert_eq!(names(&fs.list("top.txt", false, None).await.unwrap()), vec!["top.txt"]);
}

#[tokio::test]
async fn test_duplicate_entries_are_inconsistent() {
    let (store, fs) = encrypted_memory();
    fs.write("d/f", "x".into()).await.unwrap();
    fs.write("d/g", "y".into()).await.unwrap();

    // A second dirent file naming d/f
    let entry = fs.codec().dirent_entry(&StoragePath::new("d/f")).unwrap();
    let sealed = store.raw(&entry).await.unwrap();
    let copy = format!("{}/{}", fs.codec().dirent_dir("d"), "copy");
    store.write(&copy, sealed.into()).await.unwrap();

    let err = fs.list("d/f", false, None).await.unwrap_err();
    assert!(matches!(err, StorageError::Consistency { .. }), "{err}");
    assert!(err.to_string().contains("2 entries"), "{err}");
    assert_eq!(names(&fs.list("d/g", false, None).await.unwrap()), vec!["g"]);
}

#[tokio::test]
async fn test_missing_paths() {
    let (_store, fs) = encrypted_memory();
    assert_eq!(fs.list("", false, None).await.unwrap(), Vec::new());
    assert!(fs.metadata("").await.unwrap().is_dir());

    assert!(fs.list("nope", false, None).await.unwrap_err().is_not_found());
    assert!(fs.list("no/such/dir", true, None).await.unwrap_err().is_not_found());
    assert!(fs.metadata("nope").await.unwrap_err().is_not_found());
    assert!(matches!(fs.read("nope").await, Err(ref e) if e.is_not_found()));

    fs.write("a/file", "x".into()).await.unwrap();
    assert!(fs.list("a/missing", false, None).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_other_key_sees_nothing() {
    let (store, fs) = encrypted_memory();
    fs.write("a/b.txt", "hello".into()).await.unwrap();

    let stranger = EncryptedClient::uncached(store, &EncryptionConfig::new("another key")).unwrap();
    assert!(matches!(stranger.read("a/b.txt").await, Err(ref e) if e.is_not_found()));
    assert_eq!(stranger.list("", false, None).await.unwrap(), Vec::new());
}

#[tokio::test]
async fn test_overwrite_updates_size() {
    let (_store, fs) = encrypted_memory();
    fs.write("f", "first version".into()).await.unwrap();
    fs.write("f", "v2".into()).await.unwrap();
    assert_eq!(fs.metadata("f").await.unwrap().size, Some(2));
    assert_eq!(read_all(&fs, "f").await, "v2");
    assert_eq!(fs.list("", false, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unicode_forms_address_same_file() {
    let (_store, fs) = encrypted_memory();
    // "é" precomposed vs. "e" + combining acute accent
    fs.write("caf\u{e9}/menu", "x".into()).await.unwrap();
    assert_eq!(read_all(&fs, "cafe\u{301}/menu").await, "x");
}

#[tokio::test]
async fn test_invalid_writes() {
    let (_store, fs) = encrypted_memory();
    assert!(matches!(
        fs.write("", "x".into()).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert!(matches!(
        fs.write("/", "x".into()).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert!(matches!(
        fs.write("a/../b", "x".into()).await,
        Err(StorageError::InvalidPath { .. })
    ));
}

#[tokio::test]
async fn test_cascading_delete_keeps_root() {
    let (store, fs) = encrypted_memory();
    fs.write("/a/b/only.txt", "x".into()).await.unwrap();
    fs.write("/keep.txt", "y".into()).await.unwrap();

    let removed = fs.remove("a/b/only.txt", RemoveOptions::default()).await.unwrap();
    assert_eq!(removed, vec!["a/b/only.txt"]);

    assert!(fs.list("a/b", false, None).await.unwrap_err().is_not_found());
    assert!(fs.list("a", false, None).await.unwrap_err().is_not_found());
    assert_eq!(names(&fs.list("", false, None).await.unwrap()), vec!["keep.txt"]);

    fs.remove("keep.txt", RemoveOptions::default()).await.unwrap();
    assert_eq!(fs.list("", false, None).await.unwrap(), Vec::new());
    assert!(fs.metadata("").await.unwrap().is_dir());
    assert!(store.is_empty().await, "leftover keys: {:?}", store.keys().await);
}

#[tokio::test]
async fn test_cascade_stops_at_non_empty_directory() {
    let (_store, fs) = encrypted_memory();
    fs.write("a/b/c.txt", "x".into()).await.unwrap();
    fs.write("a/sibling.txt", "y".into()).await.unwrap();

    fs.remove("a/b/c.txt", RemoveOptions::default()).await.unwrap();
    assert_eq!(names(&fs.list("a", false, None).await.unwrap()), vec!["sibling.txt"]);
    assert_eq!(names(&fs.list("", false, None).await.unwrap()), vec!["a"]);
}

#[tokio::test]
async fn test_quiet_remove_is_idempotent() {
    let (_store, fs) = encrypted_memory();
    fs.write("a/f", "x".into()).await.unwrap();

    fs.remove("a/f", RemoveOptions::default()).await.unwrap();
    let quiet = RemoveOptions::default().quiet();
    assert_eq!(fs.remove("a/f", quiet).await.unwrap(), Vec::<String>::new());
    assert_eq!(fs.remove("never/was", quiet).await.unwrap(), Vec::<String>::new());

    let err = fs.remove("a/f", RemoveOptions::default()).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(
        fs.remove("gone", RemoveOptions::recursive())
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(fs.remove("gone", RemoveOptions::recursive().quiet()).await.is_ok());
}

#[tokio::test]
async fn test_non_recursive_remove_refuses_directories() {
    let (_store, fs) = encrypted_memory();
    fs.write("dir/f", "x".into()).await.unwrap();
    assert!(matches!(
        fs.remove("dir", RemoveOptions::default()).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert!(matches!(
        fs.remove("", RemoveOptions::default()).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert_eq!(names(&fs.list("dir", false, None).await.unwrap()), vec!["f"]);
}

#[tokio::test]
async fn test_recursive_listing() {
    let (_store, fs) = encrypted_memory();
    for path in ["t/a.txt", "t/sub/b.txt", "t/sub/deeper/c.txt", "other/d.txt"] {
        fs.write(path, "x".into()).await.unwrap();
    }

    let mut visited = Vec::new();
    let mut visitor = |m: &Metadata| {
        visited.push(m.name.clone());
        Ok::<(), StorageError>(())
    };
    let listing = fs.list("t", true, Some(&mut visitor)).await.unwrap();
    let mut listed: Vec<String> = listing.iter().map(|m| m.name.clone()).collect();
    listed.sort();
    assert_eq!(
        listed,
        vec!["t/a.txt", "t/sub", "t/sub/b.txt", "t/sub/deeper", "t/sub/deeper/c.txt"]
    );
    visited.sort();
    assert_eq!(visited, listed);

    let everything = fs.list("", true, None).await.unwrap();
    assert_eq!(everything.len(), 8);
}

/// Removes `target` as soon as the walk reaches `trigger`.
struct RemoveOnVisit {
    fs: Arc<EncryptedClient>,
    trigger: &'static str,
    target: &'static str,
}

#[async_trait]
impl Visitor for RemoveOnVisit {
    async fn visit(&mut self, entry: &Metadata) -> Result<(), StorageError> {
        if entry.name == self.trigger {
            self.fs.remove(self.target, RemoveOptions::default()).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_recursive_listing_fails_when_directory_vanishes() {
    let store = Arc::new(MemoryBackend::new());
    let fs = Arc::new(
        EncryptedClient::new(store, &test_config(), Arc::new(MemoryCache::with_defaults()))
            .unwrap(),
    );
    fs.write("t/a.txt", "x".into()).await.unwrap();
    fs.write("t/sub/b.txt", "y".into()).await.unwrap();

    // Removing its only file takes t/sub away before the walk expands it
    let mut visitor = RemoveOnVisit {
        fs: Arc::clone(&fs),
        trigger: "t/sub",
        target: "t/sub/b.txt",
    };
    let err = fs.list("t", true, Some(&mut visitor)).await.unwrap_err();
    assert!(err.is_not_found_at("t/sub"), "{err}");

    // The failure is not remembered as "t does not exist"
    let listing = fs.list("t", true, None).await.unwrap();
    assert_eq!(names(&listing), vec!["a.txt"]);
}

#[tokio::test]
async fn test_recursive_remove() {
    let (store, fs) = encrypted_memory();
    for path in ["t/a.txt", "t/sub/b.txt", "t/sub/deeper/c.txt", "other/d.txt"] {
        fs.write(path, "x".into()).await.unwrap();
    }

    let mut removed = fs.remove("t", RemoveOptions::recursive()).await.unwrap();
    removed.sort();
    assert_eq!(
        removed,
        vec!["t", "t/a.txt", "t/sub", "t/sub/b.txt", "t/sub/deeper", "t/sub/deeper/c.txt"]
    );
    assert_eq!(names(&fs.list("", false, None).await.unwrap()), vec!["other"]);
    assert!(fs.metadata("t/sub/b.txt").await.unwrap_err().is_not_found());

    fs.remove("", RemoveOptions::recursive()).await.unwrap();
    assert_eq!(fs.list("", true, None).await.unwrap(), Vec::new());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_recursive_remove_of_vanishing_directory() {
    let backend = Arc::new(MaskedListingBackend::new(Arc::new(MemoryBackend::new())));
    let fs = EncryptedClient::uncached(backend.clone(), &test_config()).unwrap();
    fs.write("t/a.txt", "x".into()).await.unwrap();
    fs.write("t/sub/b.txt", "y".into()).await.unwrap();

    // t/sub is still listed under t, but its own index is gone
    backend.hide_listing(&fs.codec().dirent_dir("t/sub"));

    let err = fs.remove("t", RemoveOptions::recursive()).await.unwrap_err();
    assert!(err.is_not_found_at("t/sub"), "{err}");

    let mut removed = fs.remove("t", RemoveOptions::recursive().quiet()).await.unwrap();
    removed.sort();
    assert_eq!(removed, vec!["t", "t/sub"]);
    assert_eq!(fs.list("", false, None).await.unwrap(), Vec::new());
}

#[tokio::test]
async fn test_recursive_remove_reports_only_removed_paths() {
    let (store, fs) = encrypted_memory();
    fs.write("t/a.txt", "x".into()).await.unwrap();

    // t has an index but no entry of its own in the root
    let entry = fs.codec().dirent_entry(&StoragePath::new("t")).unwrap();
    store.remove(&entry, RemoveOptions::default()).await.unwrap();

    let removed = fs.remove("t", RemoveOptions::recursive()).await.unwrap();
    assert_eq!(removed, vec!["t/a.txt"]);
    assert!(store.is_empty().await, "leftover keys: {:?}", store.keys().await);
}

#[tokio::test]
async fn test_recursive_remove_of_file() {
    let (_store, fs) = encrypted_memory();
    fs.write("a/f", "x".into()).await.unwrap();
    let removed = fs.remove("a/f", RemoveOptions::recursive()).await.unwrap();
    assert_eq!(removed, vec!["a/f"]);
    assert!(fs.list("a", false, None).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_entries_carry_logical_paths() {
    let (_store, fs) = encrypted_memory();
    fs.write("n/file.txt", "x".into()).await.unwrap();
    let entry = &fs.list("n", false, None).await.unwrap()[0];
    assert_eq!(StoragePath::new(&entry.name), StoragePath::new("n/file.txt"));
    assert!(entry.mtime.is_some());
    assert_eq!(entry.size, Some(1));
}

/// Base names under `dir`, treating a missing directory as empty.
async fn safe_names(fs: &EncryptedClient, dir: &str) -> Vec<String> {
    match fs.list(dir, false, None).await {
        Ok(entries) => names(&entries),
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => panic!("listing {dir} failed: {e}"),
    }
}

#[tokio::test]
async fn test_uncached_client_is_shareable() {
    let (_store, fs) = encrypted_memory();
    let fs = Arc::new(fs);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            fs.write(&format!("shared/f{i}"), format!("{i}").into()).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(fs.list("shared", false, None).await.unwrap().len(), 8);
}
