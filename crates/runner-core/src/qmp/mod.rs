pub mod client;
pub mod messages;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use client::QmpClient;
pub use messages::Command;

/// Shared slot holding the current QMP connection, if any. Controllers read
/// through this rather than owning the client directly, since the
/// connection is established (and re-established across QEMU restarts)
/// after controllers are registered with the dispatcher.
pub type QmpHandle = Arc<RwLock<Option<Arc<QmpClient>>>>;

pub fn new_handle() -> QmpHandle {
    Arc::new(RwLock::new(None))
}
