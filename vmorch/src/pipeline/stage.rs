//! Stage definition for ordered pipeline execution.

/// A named group of tasks.
///
/// Stages run in order and the tasks inside a stage run one after another.
/// Nothing inside a pipeline is concurrent: each task may depend on every
/// task before it having completed.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(name: &'static str, tasks: Vec<T>) -> Self {
        Self { name, tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
