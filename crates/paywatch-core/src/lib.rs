// Shared domain layer: payment status model, UI protocol, configuration, and
// the SQLite attempt ledger.

pub mod config;
pub mod db;
pub mod protocol;
pub mod status;
