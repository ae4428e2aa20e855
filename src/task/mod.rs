//! Background task records and the in-memory registry that owns them.

pub mod registry;
pub mod state;

pub use registry::TaskRegistry;
pub use state::{Task, TaskProgress, TaskStatus};
