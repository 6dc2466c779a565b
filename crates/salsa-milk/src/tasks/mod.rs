//! Web processing tasks: shared registry and background execution

mod registry;
mod worker;

pub use registry::{TaskRegistry, TaskSnapshot, TaskState, TaskStatus, UPLOAD_COMPLETE_MESSAGE};
pub use worker::{run_task, spawn_sweeper, spawn_task};
