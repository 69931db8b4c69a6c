//! A group of in-flight tasks awaited together.

use super::Task;

/// Tasks split into `pending` and `ready`.
///
/// A task lives in exactly one of the two. `successful` and `failed` are
/// views over `ready`, split on [`Task::has_exception`], so they can never
/// overlap.
#[derive(Debug, Default)]
pub struct TaskCollection {
    pending: Vec<Task>,
    ready: Vec<Task>,
}

impl TaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the pending side.
    pub fn push(&mut self, task: Task) {
        self.pending.push(task);
    }

    pub fn pending(&self) -> &[Task] {
        &self.pending
    }

    /// Resolved tasks in resolution order.
    pub fn ready(&self) -> &[Task] {
        &self.ready
    }

    pub fn successful(&self) -> impl Iterator<Item = &Task> {
        self.ready.iter().filter(|task| !task.has_exception())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Task> {
        self.ready.iter().filter(|task| task.has_exception())
    }

    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the resolved tasks, leaving pending ones in place.
    pub fn take_ready(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.ready)
    }

    /// Removes and returns the pending tasks matching `predicate`.
    pub(crate) fn detach_pending<F>(&mut self, mut predicate: F) -> Vec<Task>
    where
        F: FnMut(&Task) -> bool,
    {
        let (detached, kept): (Vec<Task>, Vec<Task>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|task| predicate(task));
        self.pending = kept;
        detached
    }

    pub(crate) fn resolve(&mut self, task: Task) {
        self.ready.push(task);
    }
}

impl FromIterator<Task> for TaskCollection {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            pending: iter.into_iter().collect(),
            ready: Vec::new(),
        }
    }
}
