use crate::task::{Task, TaskId};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Tasks collected between two schedules
///
/// A batch is ready once it holds `max_tasks` tasks or `timer` has passed
/// since the last dispatch. Redelivered tasks (same task id) are dropped.
#[derive(Debug)]
pub struct Batch {
    tasks: Vec<Task>,
    seen: HashSet<TaskId>,
    max_tasks: usize,
    timer: Duration,
    since: Instant,
}

impl Batch {
    pub fn new(max_tasks: usize, timer: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            seen: HashSet::new(),
            max_tasks: max_tasks.max(1),
            timer,
            since: Instant::now(),
        }
    }

    /// Add a task. Returns `false` for a duplicate delivery
    pub fn push(&mut self, task: Task) -> bool {
        if !self.seen.insert(task.task_id) {
            return false;
        }
        self.tasks.push(task);
        true
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        !self.tasks.is_empty()
            && (self.tasks.len() >= self.max_tasks || self.since.elapsed() >= self.timer)
    }

    /// How long a receive may block before the timer would fire
    pub fn time_left(&self, poll: Duration) -> Duration {
        if self.tasks.is_empty() {
            return poll;
        }
        self.timer.saturating_sub(self.since.elapsed()).min(poll)
    }

    /// Hand out the collected tasks and restart the timer
    pub fn take(&mut self) -> Vec<Task> {
        self.seen.clear();
        self.since = Instant::now();
        std::mem::take(&mut self.tasks)
    }
}
