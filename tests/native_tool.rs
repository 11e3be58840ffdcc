//! Integration tests for the native write-and-verify pipeline.
//!
//! A regular file stands in for the target disk.

use restor::core::imaging_tool::{ApplyRequest, ImagingTool, NativeTool};
use restor::core::{Disk, HashAlgorithm, Image, ImagingEvent, ImagingStage, hasher_for};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn digest(algorithm: HashAlgorithm, content: &[u8]) -> String {
    let mut hasher = hasher_for(algorithm);
    hasher.update(content);
    hasher.finalize()
}

/// Writes `content` as the source image and an empty file as the disk.
fn prepare(dir: &Path, content: &[u8]) -> (ApplyRequest, PathBuf) {
    let source = dir.join("base.img");
    let disk = dir.join("disk");
    std::fs::write(&source, content).unwrap();
    std::fs::write(&disk, b"").unwrap();

    let request = ApplyRequest {
        image: Image {
            name: "base".to_string(),
            url: "https://images.example.com/base".to_string(),
            sha256: digest(HashAlgorithm::Sha256, content),
            sha512: digest(HashAlgorithm::Sha512, content),
        },
        source,
        disk: Disk::new(disk.to_string_lossy()),
        verify: true,
        post_script: None,
    };
    (request, disk)
}

async fn run(
    tool: &NativeTool,
    request: &ApplyRequest,
    cancel: CancellationToken,
) -> (anyhow::Result<()>, Vec<ImagingEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let result = tool.apply(request, tx, cancel).await;
    (result, collector.await.unwrap())
}

fn stage_of(event: &ImagingEvent) -> ImagingStage {
    match event {
        ImagingEvent::Progress { stage, .. } | ImagingEvent::StageStarted { stage } => *stage,
        ImagingEvent::Finished { .. } => ImagingStage::Complete,
    }
}

#[tokio::test]
async fn test_write_and_verify() {
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let (request, disk) = prepare(dir.path(), &content);
    let tool = NativeTool { buffer_size: 1024 };

    let (result, events) = run(&tool, &request, CancellationToken::new()).await;

    result.unwrap();
    assert_eq!(std::fs::read(&disk).unwrap(), content);

    assert_eq!(events.first(), Some(&ImagingEvent::imaging(0)));
    assert!(events.contains(&ImagingEvent::imaging(100)));
    assert_eq!(events.last(), Some(&ImagingEvent::verifying(100)));
    assert!(events.iter().all(|e| !e.is_terminal()));

    // Stages only move forward and percentages only grow within a stage.
    for pair in events.windows(2) {
        assert!(stage_of(&pair[0]) <= stage_of(&pair[1]));
        if let (
            ImagingEvent::Progress { stage: a, percent: p },
            ImagingEvent::Progress { stage: b, percent: q },
        ) = (&pair[0], &pair[1])
            && a == b
        {
            assert!(p <= q);
        }
    }
}

#[tokio::test]
async fn test_post_script_runs_between_write_and_verify() {
    let dir = tempdir().unwrap();
    let (mut request, _) = prepare(dir.path(), b"small image");

    let script = dir.path().join("post.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    request.post_script = Some(script);

    let (result, events) = run(&NativeTool::default(), &request, CancellationToken::new()).await;
    result.unwrap();

    let post = events
        .iter()
        .position(|e| *e == ImagingEvent::post_script_started())
        .expect("post script stage missing");
    let last_imaging = events
        .iter()
        .rposition(|e| stage_of(e) == ImagingStage::Imaging)
        .unwrap();
    let first_verifying = events
        .iter()
        .position(|e| stage_of(e) == ImagingStage::Verifying)
        .unwrap();
    assert!(last_imaging < post && post < first_verifying);
}

#[tokio::test]
async fn test_verification_detects_mismatch() {
    let dir = tempdir().unwrap();
    let (mut request, _) = prepare(dir.path(), b"the real image");
    request.image.sha256 = digest(HashAlgorithm::Sha256, b"some other image");

    let (result, _) = run(&NativeTool::default(), &request, CancellationToken::new()).await;

    let err = result.unwrap_err().to_string();
    assert!(err.contains("Verification failed"), "unexpected error: {err}");
}

#[tokio::test]
async fn test_skips_verification_when_disabled() {
    let dir = tempdir().unwrap();
    let (mut request, _) = prepare(dir.path(), b"the real image");
    request.verify = false;
    request.image.sha256 = digest(HashAlgorithm::Sha256, b"ignored");

    let (result, events) = run(&NativeTool::default(), &request, CancellationToken::new()).await;

    result.unwrap();
    assert!(events.iter().all(|e| stage_of(e) == ImagingStage::Imaging));
}

#[tokio::test]
async fn test_cancelled_before_start_writes_nothing() {
    let dir = tempdir().unwrap();
    let (request, disk) = prepare(dir.path(), &vec![1u8; 64 * 1024]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (result, _) = run(&NativeTool { buffer_size: 4096 }, &request, cancel).await;

    assert!(result.is_err());
    assert!(std::fs::read(&disk).unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_disk_is_an_error() {
    let dir = tempdir().unwrap();
    let (mut request, _) = prepare(dir.path(), b"image");
    request.disk = Disk::new(dir.path().join("absent").join("disk").to_string_lossy());

    let (result, _) = run(&NativeTool::default(), &request, CancellationToken::new()).await;
    assert!(result.is_err());
}
