//! External tool plumbing.
//!
//! This module provides:
//! - Command and artifact path templates rendered per target
//! - The `ToolInvoker` seam and its process-backed implementation

mod invoker;
mod template;

#[cfg(test)]
pub use invoker::MockToolInvoker;
pub use invoker::{
    duration_millis, partial_path, InvokeError, Invocation, ProcessInvoker, ToolInvoker, ToolRun,
    OUTPUT_TAIL_BYTES, PARTIAL_SUFFIX,
};
pub use template::{
    placeholders, CommandTemplate, RenderedCommand, TemplateContext, TemplateError,
    READS_PLACEHOLDER, SCALAR_PLACEHOLDERS,
};
