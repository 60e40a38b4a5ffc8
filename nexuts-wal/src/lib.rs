//! Write-ahead log (C4) and snapshot manager (C5) backing the IC's
//! [`nexuts_tree::MergeTree`] (spec.md [MODULE C4]/[MODULE C5]).

pub mod error;
pub mod snapshot;
pub mod wal;

pub use error::{WalError, WalResult};
pub use snapshot::{SnapshotConfig, SnapshotManager};
pub use wal::{WalConfig, WalEntry, WalManager};
