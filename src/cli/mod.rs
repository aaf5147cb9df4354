//! Admin CLI: site registration, admission, status, purge, reconciliation,
//! and worker pools.

mod commands;

pub use commands::{is_verbose, run};
