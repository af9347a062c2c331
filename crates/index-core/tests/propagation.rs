//! Integration tests for index propagation.
//!
//! Drives a `Model` over an in-memory folder and observes what a connected
//! peer receives through a recording connection.

use std::sync::Arc;
use std::time::Duration;

use index_core::{
    DeviceId, DistributorConfig, EventBus, FileRecord, FileSystem, FolderConfig, InMemoryFs,
    IndexKind, IndexMessage, MemoryDatabase, Model, ModelConfig, RecordingConnection,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const LOCAL: u64 = 0x1000;
const PEER: u64 = 0x2000;
const FOLDER: &str = "default";

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    model: Model,
    fs: Arc<InMemoryFs>,
}

fn fixture(max_batch_files: usize) -> Fixture {
    let model = Model::new(
        ModelConfig {
            device_id: DeviceId::from(LOCAL),
            distributor: DistributorConfig {
                coalesce_window: Duration::from_millis(20),
                max_batch_files,
            },
            ..ModelConfig::default()
        },
        Arc::new(MemoryDatabase::new()),
        Arc::new(EventBus::new()),
    );
    let fs = Arc::new(InMemoryFs::new());
    model
        .start_folder(
            FolderConfig::new(FOLDER).shared_with(DeviceId::from(PEER)),
            fs.clone(),
        )
        .expect("folder should start");
    Fixture { model, fs }
}

fn connect(model: &Model) -> UnboundedReceiver<IndexMessage> {
    let (conn, rx) = RecordingConnection::new(DeviceId::from(PEER));
    model.add_connection(conn);
    rx
}

async fn recv(rx: &mut UnboundedReceiver<IndexMessage>) -> IndexMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for index message")
        .expect("connection channel closed")
}

/// Files of the next message that carries any.
async fn next_files(rx: &mut UnboundedReceiver<IndexMessage>) -> Vec<FileRecord> {
    loop {
        let msg = recv(rx).await;
        if !msg.files.is_empty() {
            return msg.files;
        }
    }
}

/// Assert that nothing arrives for a while.
async fn assert_quiet(rx: &mut UnboundedReceiver<IndexMessage>) {
    if let Ok(Some(msg)) = timeout(Duration::from_millis(300), rx.recv()).await {
        panic!("unexpected index message: {:?}", msg);
    }
}

// ============================================================================
// Tests
// ============================================================================

/// A file ignored, deleted while ignored, then unignored must reach the
/// peer as a tombstone with an empty version.
#[tokio::test]
async fn test_ignore_delete_unignore() {
    let Fixture { model, fs } = fixture(1000);
    let mut rx = connect(&model);
    let baseline = recv(&mut rx).await;
    assert_eq!(baseline.kind, IndexKind::Full);
    assert!(baseline.files.is_empty());

    fs.write("foobar", b"whatever").await.unwrap();
    model.scan_folder(FOLDER).await.unwrap();
    let files = next_files(&mut rx).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "foobar");
    assert!(!files[0].invalid && !files[0].deleted);
    let original = files[0].version.clone();

    model
        .set_ignores(FOLDER, vec!["foobar".to_string()])
        .await
        .unwrap();
    let files = next_files(&mut rx).await;
    assert_eq!(files.len(), 1);
    assert!(files[0].invalid);
    assert_eq!(files[0].version, original);

    fs.delete("foobar").await.unwrap();
    model.set_ignores(FOLDER, Vec::new()).await.unwrap();
    let files = next_files(&mut rx).await;
    assert_eq!(files.len(), 1);
    assert!(!files[0].invalid);
    assert!(files[0].deleted);
    assert!(
        files[0].version.is_empty(),
        "expected empty version, got {}",
        files[0].version
    );
}

#[tokio::test]
async fn test_unchanged_rescan_sends_nothing() {
    let Fixture { model, fs } = fixture(1000);
    fs.write("a", b"1").await.unwrap();
    fs.write("b", b"2").await.unwrap();
    model.scan_folder(FOLDER).await.unwrap();

    let mut rx = connect(&model);
    assert_eq!(recv(&mut rx).await.files.len(), 2);

    let report = model.scan_folder(FOLDER).await.unwrap();
    assert!(!report.has_changes());
    model
        .set_ignores(FOLDER, Vec::new())
        .await
        .unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_per_file_versions_arrive_in_order() {
    let Fixture { model, fs } = fixture(1000);
    let mut rx = connect(&model);
    recv(&mut rx).await;

    for i in 0..5u8 {
        fs.write("doc", &[i]).await.unwrap();
        fs.write(&format!("other{}", i), b"x").await.unwrap();
        model.scan_folder(FOLDER).await.unwrap();
    }

    let local = DeviceId::from(LOCAL);
    let mut seen = Vec::new();
    while seen.last() != Some(&5) {
        for file in next_files(&mut rx).await {
            if file.name == "doc" {
                seen.push(file.version.counter(local));
            }
        }
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seen);
}

#[tokio::test]
async fn test_baseline_matches_index() {
    let Fixture { model, fs } = fixture(7);
    for i in 0..30 {
        fs.write(&format!("dir{}/f{:02}", i % 3, i), b"data").await.unwrap();
    }
    fs.write("ignored.tmp", b"x").await.unwrap();
    model
        .set_ignores(FOLDER, vec!["*.tmp".to_string()])
        .await
        .unwrap();
    model.scan_folder(FOLDER).await.unwrap();
    let index = model.get_folder_index(FOLDER).unwrap();
    assert_eq!(index.len(), 31);

    let mut rx = connect(&model);
    let first = recv(&mut rx).await;
    assert_eq!(first.kind, IndexKind::Full);
    let mut received = first.files;
    while received.len() < index.len() {
        let msg = recv(&mut rx).await;
        assert_eq!(msg.kind, IndexKind::Update);
        assert!(msg.files.len() <= 7);
        received.extend(msg.files);
    }
    assert_eq!(received, index);
}

#[tokio::test]
async fn test_reconnect_starts_from_fresh_baseline() {
    let Fixture { model, fs } = fixture(1000);
    fs.write("a", b"1").await.unwrap();
    model.scan_folder(FOLDER).await.unwrap();

    let mut first = connect(&model);
    assert_eq!(recv(&mut first).await.files.len(), 1);
    model.connection_closed(DeviceId::from(PEER));

    fs.write("b", b"2").await.unwrap();
    model.scan_folder(FOLDER).await.unwrap();

    let mut second = connect(&model);
    let baseline = recv(&mut second).await;
    assert_eq!(baseline.kind, IndexKind::Full);
    let names: Vec<_> = baseline.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_unshared_device_receives_nothing() {
    let Fixture { model, .. } = fixture(1000);
    let (conn, mut rx) = RecordingConnection::new(DeviceId::from(0x3000));
    model.add_connection(conn);
    assert_quiet(&mut rx).await;
    assert!(model.shared_folders(DeviceId::from(0x3000)).is_empty());
}
