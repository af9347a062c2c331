//! End-to-end tests for index-daemon.
//!
//! Runs a full daemon on a temporary folder and talks to it over WebSocket:
//! handshakes, baseline indexes, watcher-driven updates and `.syncignore`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use index_core::{DeviceId, FolderConfig, IndexKind, IndexMessage};
use index_daemon::{Daemon, DaemonConfig, FolderEntry, HelloMessage, Role, WebSocketServer};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message,
};

const DAEMON: u64 = 0xd000;
const CLIENT: u64 = 0xc000;
const FOLDER: &str = "default";

/// Test client that connects to the daemon.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to the daemon and complete handshake.
    async fn connect(addr: SocketAddr, device: u64) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        let mut client = Self { ws };

        let hello = HelloMessage::new(DeviceId::from(device), Role::Client);
        client.send_binary(&hello.to_binary()).await;

        let server_hello = client.expect_hello().await;
        assert_eq!(server_hello.role, Role::Server);
        assert_eq!(server_hello.device_id, DeviceId::from(DAEMON));
        client
    }

    async fn expect_hello(&mut self) -> HelloMessage {
        let msg = self.recv_message().await.expect("Stream ended before hello");
        HelloMessage::from_binary(&msg).expect("Expected hello message")
    }

    /// Receive binary message, `None` once the connection is closed.
    async fn recv_message(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Some(data.to_vec()),
                Some(Ok(Message::Text(text))) => return Some(text.as_bytes().to_vec()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    }

    async fn recv_index(&mut self) -> IndexMessage {
        let msg = timeout(Duration::from_secs(10), self.recv_message())
            .await
            .expect("Timeout waiting for index message")
            .expect("Connection closed unexpectedly");
        IndexMessage::from_json(&msg).expect("Expected index message")
    }

    /// Wait for an update that mentions `name`.
    async fn recv_update_for(&mut self, name: &str) -> index_core::FileRecord {
        loop {
            let msg = self.recv_index().await;
            if let Some(file) = msg.files.into_iter().find(|f| f.name == name) {
                return file;
            }
        }
    }

    async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .expect("Failed to send message");
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct RunningDaemon {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningDaemon {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("Daemon did not stop")
            .expect("Daemon task panicked")
            .expect("Daemon returned an error");
    }
}

fn config(folder: &Path, data: &Path) -> DaemonConfig {
    DaemonConfig {
        listen: "127.0.0.1:0".into(),
        device_id: Some(DeviceId::from(DAEMON)),
        data_dir: data.to_path_buf(),
        folders: vec![FolderEntry {
            path: folder.to_path_buf(),
            folder: FolderConfig::new(FOLDER).shared_with(DeviceId::from(CLIENT)),
        }],
        coalesce_ms: 20,
        ..DaemonConfig::default()
    }
}

async fn spawn_daemon(config: DaemonConfig) -> RunningDaemon {
    let listener = WebSocketServer::bind(&config.listen)
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let daemon = Daemon::start(config).await.expect("Daemon failed to start");

    let (shutdown, rx) = oneshot::channel();
    let handle = tokio::spawn(daemon.run(listener, async {
        let _ = rx.await;
    }));
    // Let the watcher register before tests touch the folder
    tokio::time::sleep(Duration::from_millis(200)).await;

    RunningDaemon {
        addr,
        shutdown,
        handle,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_client_receives_baseline() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("hello.txt"), b"hello world").unwrap();
    std::fs::create_dir_all(folder.path().join("notes")).unwrap();
    std::fs::write(folder.path().join("notes/today.md"), b"# Today").unwrap();

    let daemon = spawn_daemon(config(folder.path(), data.path())).await;
    let mut client = TestClient::connect(daemon.addr, CLIENT).await;

    let baseline = client.recv_index().await;
    assert_eq!(baseline.folder, FOLDER);
    assert_eq!(baseline.kind, IndexKind::Full);
    let names: Vec<_> = baseline.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["hello.txt", "notes/today.md"]);

    let hello = &baseline.files[0];
    assert!(!hello.deleted && !hello.invalid);
    assert_eq!(hello.size, 11);
    assert_eq!(hello.version.counter(DeviceId::from(DAEMON)), 1);

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_file_changes_propagate() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("a.txt"), b"one").unwrap();

    let daemon = spawn_daemon(config(folder.path(), data.path())).await;
    let mut client = TestClient::connect(daemon.addr, CLIENT).await;
    assert_eq!(client.recv_index().await.files.len(), 1);

    std::fs::write(folder.path().join("b.txt"), b"two").unwrap();
    let added = client.recv_update_for("b.txt").await;
    assert!(!added.deleted);

    std::fs::remove_file(folder.path().join("a.txt")).unwrap();
    let removed = client.recv_update_for("a.txt").await;
    assert!(removed.deleted);
    assert_eq!(removed.version.counter(DeviceId::from(DAEMON)), 2);

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_syncignore_change_invalidates_file() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("secret.key"), b"hunter2").unwrap();

    let daemon = spawn_daemon(config(folder.path(), data.path())).await;
    let mut client = TestClient::connect(daemon.addr, CLIENT).await;
    let baseline = client.recv_index().await;
    let original = baseline.files[0].version.clone();

    std::fs::write(folder.path().join(".syncignore"), b"*.key\n").unwrap();
    let ignored = client.recv_update_for("secret.key").await;
    assert!(ignored.invalid);
    assert_eq!(ignored.version, original);

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_syncignore_applies_at_startup() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join(".syncignore"), b"build/\n").unwrap();
    std::fs::create_dir_all(folder.path().join("build")).unwrap();
    std::fs::write(folder.path().join("build/out.bin"), b"\x00\x01").unwrap();
    std::fs::write(folder.path().join("src.rs"), b"fn main() {}").unwrap();

    let daemon = Daemon::start(config(folder.path(), data.path()))
        .await
        .expect("Daemon failed to start");
    assert_eq!(daemon.model().get_ignores(FOLDER).unwrap(), vec!["build/"]);

    let out = daemon
        .model()
        .get_file(FOLDER, "build/out.bin")
        .unwrap()
        .expect("ignored file should be indexed as invalid");
    assert!(out.invalid);
    assert!(out.version.is_empty());
    assert!(!daemon.model().get_file(FOLDER, "src.rs").unwrap().unwrap().invalid);

    daemon.model().shutdown().await;
}

#[tokio::test]
async fn test_malformed_syncignore_falls_back_to_config() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join(".syncignore"), b"a{b\n").unwrap();
    std::fs::write(folder.path().join("debug.log"), b"noise").unwrap();

    let mut config = config(folder.path(), data.path());
    config.folders[0].folder.ignore_patterns = vec!["*.log".into()];
    let daemon = Daemon::start(config).await.expect("Daemon failed to start");

    assert_eq!(daemon.model().get_ignores(FOLDER).unwrap(), vec!["*.log"]);
    assert!(daemon.model().get_file(FOLDER, "debug.log").unwrap().unwrap().invalid);
    daemon.model().shutdown().await;
}

#[tokio::test]
async fn test_index_survives_restart() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("a.txt"), b"one").unwrap();

    let first = Daemon::start(config(folder.path(), data.path()))
        .await
        .expect("Daemon failed to start");
    let before = first.model().get_folder_index(FOLDER).unwrap();
    first.model().shutdown().await;
    drop(first);

    let second = Daemon::start(config(folder.path(), data.path()))
        .await
        .expect("Daemon failed to restart");
    let after = second.model().get_folder_index(FOLDER).unwrap();
    assert_eq!(before, after, "unchanged folder must not bump versions");
    second.model().shutdown().await;
}

#[tokio::test]
async fn test_unshared_device_gets_no_index() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("a.txt"), b"one").unwrap();

    let daemon = spawn_daemon(config(folder.path(), data.path())).await;
    let mut client = TestClient::connect(daemon.addr, 0xe000).await;

    let result = timeout(Duration::from_millis(500), client.recv_message()).await;
    assert!(result.is_err(), "unshared device received a message");

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_non_hello_first_message_is_rejected() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    let daemon = spawn_daemon(config(folder.path(), data.path())).await;
    let url = format!("ws://{}", daemon.addr);
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    let mut client = TestClient { ws };

    client.send_binary(b"{\"type\":\"index\"}").await;
    client.expect_hello().await;
    let next = timeout(Duration::from_secs(5), client.recv_message())
        .await
        .expect("Server did not close the connection");
    assert!(next.is_none());

    daemon.stop().await;
}

#[tokio::test]
async fn test_daemon_dials_configured_peer() {
    let folder = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(folder.path().join("a.txt"), b"one").unwrap();

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(folder.path(), data.path());
    config.peers = vec![format!("ws://{}", peer.local_addr().unwrap())];
    let daemon = spawn_daemon(config).await;

    let (stream, _) = timeout(Duration::from_secs(5), peer.accept())
        .await
        .expect("Daemon did not dial")
        .unwrap();
    let ws = accept_async(MaybeTlsStream::Plain(stream)).await.unwrap();
    let mut client = TestClient { ws };

    let hello = client.expect_hello().await;
    assert_eq!(hello.role, Role::Client);
    assert_eq!(hello.device_id, DeviceId::from(DAEMON));
    let reply = HelloMessage::new(DeviceId::from(CLIENT), Role::Server);
    client.send_binary(&reply.to_binary()).await;

    let baseline = client.recv_index().await;
    assert_eq!(baseline.kind, IndexKind::Full);
    assert_eq!(baseline.files[0].name, "a.txt");

    client.close().await;
    daemon.stop().await;
}
