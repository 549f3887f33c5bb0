// Download lifecycle: control, progress, cleanup and the cross-process bridge
pub mod adapter;
pub mod bridge;
pub mod channel;
pub mod cleanup;
pub mod controller;
pub mod inbox;
pub mod signal;

pub use adapter::{AdapterConfig, ByteLedger, FetchAdapter, MAX_CHECKPOINT_INTERVAL};
pub use bridge::{check_freshness, BridgeReader, ObservedStatus, StateSyncBridge};
pub use channel::ProgressChannel;
pub use cleanup::{cleanup_partial_artifacts, is_incomplete_artifact, CleanupReport, CleanupScope};
pub use controller::{ControllerConfig, DownloadController};
pub use inbox::ControlInbox;
pub use signal::ControlCell;
