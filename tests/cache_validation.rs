//! Integration tests for reconciling the image cache with a catalog.

use restor::core::{
    CacheOutcome, Catalog, HashAlgorithm, Image, ImageCache, checksum, hasher_for,
};
use std::path::Path;
use tempfile::tempdir;

fn digest(algorithm: HashAlgorithm, content: &[u8]) -> String {
    let mut hasher = hasher_for(algorithm);
    hasher.update(content);
    hasher.finalize()
}

fn image(name: &str, content: &[u8]) -> Image {
    Image {
        name: name.to_string(),
        url: format!("https://images.example.com/{}", name),
        sha256: digest(HashAlgorithm::Sha256, content),
        sha512: digest(HashAlgorithm::Sha512, content),
    }
}

fn files_in(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_matching_file_is_cached_and_orphan_removed() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("base"), b"base image bytes").unwrap();
    std::fs::write(root.join("old"), b"forgotten image").unwrap();

    let catalog = Catalog::new(vec![image("base", b"base image bytes")]).unwrap();
    let cache = ImageCache::new(root);
    let report = cache.validate(&catalog).await.unwrap();

    let path = report.local_path("base").expect("base should be cached");
    assert_eq!(path.as_path(), root.join("base"));
    assert_eq!(report.removed_orphans, vec![root.join("old")]);
    assert_eq!(files_in(root), vec!["base"]);
}

#[tokio::test]
async fn test_mismatched_file_is_deleted() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("base"), b"tampered bytes").unwrap();

    let catalog = Catalog::new(vec![image("base", b"base image bytes")]).unwrap();
    let report = ImageCache::new(root).validate(&catalog).await.unwrap();

    assert_eq!(report.entries.get("base"), Some(&CacheOutcome::Corrupt));
    assert!(report.local_path("base").is_none());
    assert!(files_in(root).is_empty());
}

#[tokio::test]
async fn test_missing_images_are_reported() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::new(vec![
        image("base", b"base"),
        image("recovery", b"recovery"),
    ])
    .unwrap();
    std::fs::write(dir.path().join("recovery"), b"recovery").unwrap();

    let report = ImageCache::new(dir.path()).validate(&catalog).await.unwrap();

    assert_eq!(report.entries.get("base"), Some(&CacheOutcome::Missing));
    assert!(report.local_path("recovery").is_some());
    assert_eq!(report.cached_count(), 1);
}

#[tokio::test]
async fn test_validation_is_idempotent() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("base"), b"base").unwrap();
    std::fs::write(root.join("recovery"), b"wrong").unwrap();
    std::fs::write(root.join(".download-abc123"), b"partial").unwrap();

    let catalog = Catalog::new(vec![
        image("base", b"base"),
        image("recovery", b"recovery"),
    ])
    .unwrap();
    let cache = ImageCache::new(root);

    let first = cache.validate(&catalog).await.unwrap();
    let after_first = files_in(root);
    let second = cache.validate(&catalog).await.unwrap();

    assert_eq!(after_first, vec!["base"]);
    assert_eq!(files_in(root), after_first);
    assert!(second.removed_orphans.is_empty());
    assert_eq!(second.entries.get("recovery"), Some(&CacheOutcome::Missing));
    assert_eq!(
        first.local_path("base").map(|p| p.as_path().to_path_buf()),
        second.local_path("base").map(|p| p.as_path().to_path_buf())
    );
}

#[tokio::test]
async fn test_subdirectories_are_left_alone() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("nested")).unwrap();
    std::fs::write(root.join("nested").join("base"), b"base").unwrap();

    let catalog = Catalog::new(vec![image("base", b"base")]).unwrap();
    let report = ImageCache::new(root).validate(&catalog).await.unwrap();

    assert_eq!(report.entries.get("base"), Some(&CacheOutcome::Missing));
    assert!(root.join("nested").join("base").exists());
}

#[tokio::test]
async fn test_cached_path_matches_catalog_digest() {
    let dir = tempdir().unwrap();
    let content = vec![7u8; 300 * 1024];
    std::fs::write(dir.path().join("large"), &content).unwrap();

    let catalog = Catalog::new(vec![image("large", &content)]).unwrap();
    let report = ImageCache::new(dir.path()).validate(&catalog).await.unwrap();
    let path = report.local_path("large").unwrap();

    assert_eq!(
        checksum(path.as_path(), HashAlgorithm::Sha256).unwrap(),
        catalog.get("large").unwrap().sha256
    );
}

#[tokio::test]
async fn test_catalog_rejects_path_like_names() {
    let mut bad = image("base", b"base");
    bad.name = "../etc/passwd".to_string();
    assert!(Catalog::new(vec![bad]).is_err());
}
