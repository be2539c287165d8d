//! Cooperative cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken, triggered on interrupt and observed by every stage
//! - CleanupGuard for removing partial output when an attempt ends early

mod cleanup;
mod token;

pub use cleanup::{remove_on_drop, CleanupGuard};
pub use token::CancellationToken;
