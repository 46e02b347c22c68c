use std::collections::{BTreeMap, HashMap};

use super::{Task, builtin_tasks};
use crate::error::{GraphloadError, Result};

const UNGROUPED: &str = "Other Tasks";

/// Named tasks in registration order.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the token tasks.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        for task in builtin_tasks() {
            registry.register(task)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(GraphloadError::DuplicateTask(task.name));
        }

        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Task> {
        self.index
            .get(name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| GraphloadError::UnknownTask(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks whose name starts with `prefix`, in registration order.
    ///
    /// The iterator borrows the registry, so each call sees every task
    /// registered so far.
    pub fn find_by_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks
            .iter()
            .filter(move |task| task.name.starts_with(prefix))
    }

    pub fn find_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |task| task.tags.contains(tag))
    }

    /// Tasks bucketed by group name, each bucket in registration order.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&Task>> {
        let mut groups: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in &self.tasks {
            let group = task.group.as_deref().unwrap_or(UNGROUPED);
            groups.entry(group).or_default().push(task);
        }
        groups
    }
}
