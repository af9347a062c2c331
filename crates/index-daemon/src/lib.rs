//! index-daemon library: native collaborators for index-core.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod ignore_file;
pub mod message;
pub mod native_fs;
pub mod outgoing;
pub mod persistence;
pub mod rescan;
pub mod server;
pub mod watcher;

// Re-export key types for convenience
pub use config::{DaemonConfig, FolderEntry};
pub use connection::{ConnectionEvent, WsConnection};
pub use daemon::Daemon;
pub use message::{HelloMessage, MAX_MESSAGE_SIZE, Role};
pub use native_fs::NativeFs;
pub use outgoing::{Dialer, ReconnectConfig};
pub use persistence::JsonIndexDatabase;
pub use rescan::{RescanHandle, Rescanner, WatchedFolder};
pub use server::WebSocketServer;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
