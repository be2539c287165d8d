//! Event sinks for observing a run.
//!
//! Event types emitted by the orchestrator and stage runner:
//!
//! | Event              | Data                                   |
//! |--------------------|----------------------------------------|
//! | `run.started`      | `run_id`, `panel`, `datadir`           |
//! | `sample.started`   | `sample`                               |
//! | `stage.started`    | `sample`, `stage`, `tool`              |
//! | `stage.completed`  | `sample`, `stage`, `status`, `duration_ms` |
//! | `stage.skipped`    | `sample`, `stage`, `reason`            |
//! | `stage.failed`     | `sample`, `stage`, `error`, `message`  |
//! | `sample.completed` | `sample`, `success`                    |
//! | `run.barrier`      | `samples`                              |
//! | `run.completed`    | `run_id`, `success`                    |

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// The invocation started.
    pub const RUN_STARTED: &str = "run.started";
    /// A sample's stage graph started.
    pub const SAMPLE_STARTED: &str = "sample.started";
    /// A stage tool is about to be invoked.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage reached `Exists` or `Success`.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage was not attempted.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A sample's stage graph finished.
    pub const SAMPLE_COMPLETED: &str = "sample.completed";
    /// Every sample finished; run-scoped stages may start.
    pub const RUN_BARRIER: &str = "run.barrier";
    /// The invocation finished.
    pub const RUN_COMPLETED: &str = "run.completed";
}
