// Reconciliation layer: the status state machine, the transport fallback
// ladder, and the watcher event loop that ties them to real transports.

pub mod ladder;
pub mod reconciler;
pub mod watcher;

pub use watcher::{run, WatchContext, WatchSettings, WatchSummary};
