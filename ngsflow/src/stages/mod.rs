//! Stage execution for one target.
//!
//! A stage runs at most once per target per invocation. [`StageRunner`]
//! decides between `Exists`, `Success`, `Error` and `Skipped`; the lock, gather
//! and transform helpers keep concurrent runs and run-scoped inputs consistent.

mod gather;
mod lock;
mod runner;
mod transform;

pub use gather::{compile, members_match, members_path, write_members, GatherInput, MEMBERS_SUFFIX};
pub use lock::{lock_path, LockError, LockSettings, StageLock};
pub use runner::{DependencyState, StageRunner};
pub use transform::apply as apply_transform;
