// タスクモデル
pub mod id;
pub mod types;

pub use id::{IdGeneratorError, TaskIdGenerator, MAX_PROCESS_ID};
pub use types::{
    FileLocation, Task, TaskError, TaskId, TaskResult, TaskStatus, TaskType, Tier, WorkerId,
    UNASSIGNED,
};
