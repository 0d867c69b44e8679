//! Background maintenance workers.
//!
//! Each worker runs a single pass function in a loop at a configured interval
//! and logs the outcome of every pass.

mod cleanup;

pub use cleanup::{CleanupRunResult, run_spend_cleanup, start_spend_cleanup_worker};
