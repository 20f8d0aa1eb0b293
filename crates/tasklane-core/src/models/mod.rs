pub mod message;
pub mod task;

pub use message::Message;
pub use task::{Priority, Task, TaskBuilder, TaskConfig, TaskState};
