//! index-core: folder indexing, ignore reconciliation and index propagation.
//!
//! This crate provides the core functionality for:
//! - Version vectors and per-file index records
//! - Gitignore-style ignore rules with atomic reload
//! - A per-folder index store with change notification
//! - The reconciler that turns scans and ignore changes into index updates
//! - Per-peer distributors that stream index deltas
//! - FileSystem, IndexDatabase and PeerConnection trait abstractions

pub mod db;
pub mod device_id;
pub mod distributor;
pub mod events;
pub mod fs;
pub mod ignore;
pub mod model;
pub mod protocol;
pub mod reconciler;
pub mod record;
pub mod scanner;
pub mod store;
pub mod transport;
pub mod version;

pub use crate::ignore::{IgnoreError, IgnoreMatcher, IgnoreSnapshot, MatchResult};
pub use db::{DbError, IndexDatabase, MemoryDatabase};
pub use device_id::{DeviceId, DeviceIdError};
pub use distributor::{DistributorConfig, DistributorError, IndexDistributor};
pub use events::{EventBus, FolderEvent, Subscription};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use model::{FolderConfig, Model, ModelConfig, ModelError};
pub use protocol::{IndexKind, IndexMessage};
pub use reconciler::{ReconcileError, ReconcileReport};
pub use record::FileRecord;
pub use scanner::{Listing, ScanError, ScanResult, Scanner};
pub use store::{IndexChange, IndexStore, StoreError, StoreSnapshot};
pub use transport::{PeerConnection, RecordingConnection, TransportError};
pub use version::{Counter, VectorOrdering, VersionVector};
