use std::{collections::HashMap, sync::Arc};

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::{
    error::{GraphloadError, Result},
    gsql::GsqlRunner,
    http::{HttpTaskRunner, Transport},
    output::OutputMode,
    settings::Settings,
    task::{DependencyGraph, Task, TaskAction, TaskRegistry},
    token::TokenProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not run because a dependency did not succeed.
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// Collaborators shared by every task of a run.
pub struct TaskContext {
    settings: Arc<Settings>,
    tokens: TokenProvider,
    http: HttpTaskRunner,
    gsql: GsqlRunner,
}

impl TaskContext {
    pub fn new(
        settings: Arc<Settings>,
        transport: Arc<dyn Transport>,
        output_mode: OutputMode,
    ) -> Self {
        Self {
            tokens: TokenProvider::new(Arc::clone(&settings), Arc::clone(&transport)),
            http: HttpTaskRunner::new(Arc::clone(&settings), transport),
            gsql: GsqlRunner::new(Arc::clone(&settings), output_mode),
            settings,
        }
    }

    pub async fn run_action(&self, task: &Task) -> Result<()> {
        match &task.action {
            TaskAction::FetchToken => self.tokens.get_token().await.map(|_| ()),
            TaskAction::DeleteToken => self.tokens.delete_token().await,
            TaskAction::Aggregate(_) => Ok(()),
            TaskAction::Gsql(script) => self.gsql.run(&task.name, script).await,
            action @ (TaskAction::Http(_)
            | TaskAction::Load(_)
            | TaskAction::Query { .. }
            | TaskAction::Version) => {
                let spec = action.request(&self.settings.graph_name).ok_or_else(|| {
                    GraphloadError::Config(format!(
                        "Task '{}': {} action has no request to send",
                        task.name,
                        action.kind()
                    ))
                })?;
                let token = self.tokens.get_token().await?;
                self.http
                    .execute(&task.name, &spec, &token)
                    .await
                    .map(|_| ())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    order: Vec<String>,
    states: HashMap<String, TaskState>,
    errors: Vec<(String, GraphloadError)>,
}

impl RunReport {
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.states.get(task_id).copied()
    }

    #[cfg(test)]
    pub fn error(&self, task_id: &str) -> Option<&GraphloadError> {
        self.errors
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, err)| err)
    }

    pub fn is_success(&self) -> bool {
        self.order
            .iter()
            .all(|id| self.state(id) == Some(TaskState::Succeeded))
    }

    pub fn summary(&self) -> String {
        let count = |wanted: TaskState| {
            self.order
                .iter()
                .filter(|id| self.state(id) == Some(wanted))
                .count()
        };
        format!(
            "{} succeeded, {} failed, {} skipped, {} not run",
            count(TaskState::Succeeded),
            count(TaskState::Failed),
            count(TaskState::Skipped),
            count(TaskState::Pending)
        )
    }

    /// The first task failure, if any.
    pub fn into_result(self) -> Result<()> {
        match self.errors.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionLevel {
    pub level: usize,
    pub task_ids: Vec<String>,
}

/// Groups execution segments into levels whose tasks only depend on
/// earlier levels. Within a level, tasks keep their relative order.
///
/// Each segment starts above every level used by the segments before it,
/// so tasks reached from a later root never run alongside an earlier root's
/// tasks.
pub fn calculate_dependency_levels(
    segments: &[Vec<String>],
    graph: &DependencyGraph,
) -> Vec<ExecutionLevel> {
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut execution_levels: Vec<ExecutionLevel> = Vec::new();

    for segment in segments {
        let floor = execution_levels.len();

        for task_id in segment {
            let level = graph
                .dependencies(task_id)
                .iter()
                .filter_map(|dep| levels.get(dep.as_str()))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0)
                .max(floor);
            levels.insert(task_id.as_str(), level);

            while execution_levels.len() <= level {
                execution_levels.push(ExecutionLevel {
                    level: execution_levels.len(),
                    task_ids: Vec::new(),
                });
            }
            execution_levels[level].task_ids.push(task_id.clone());
        }
    }

    execution_levels
}

pub struct TaskRunner<'a> {
    registry: &'a TaskRegistry,
    graph: &'a DependencyGraph,
    context: Arc<TaskContext>,
    workers: usize,
    continue_on_failure: bool,
    states: HashMap<String, TaskState>,
    errors: Vec<(String, GraphloadError)>,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        registry: &'a TaskRegistry,
        graph: &'a DependencyGraph,
        context: Arc<TaskContext>,
        workers: Option<usize>,
        continue_on_failure: bool,
    ) -> Self {
        Self {
            registry,
            graph,
            context,
            workers: workers.unwrap_or(1).max(1),
            continue_on_failure,
            states: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Runs per-root segments as produced by
    /// [`DependencyGraph::topo_segments`]. Each segment must already be
    /// topologically sorted. Segments run in order, even in parallel mode.
    pub async fn run_segments(mut self, segments: &[Vec<String>]) -> RunReport {
        let mut unique: Vec<String> = Vec::new();
        let mut unique_segments: Vec<Vec<String>> = Vec::with_capacity(segments.len());
        for segment in segments {
            let mut fresh = Vec::with_capacity(segment.len());
            for task_id in segment {
                if !unique.contains(task_id) {
                    unique.push(task_id.clone());
                    fresh.push(task_id.clone());
                }
            }
            unique_segments.push(fresh);
        }

        for task_id in &unique {
            self.states.insert(task_id.clone(), TaskState::Pending);
        }

        if self.workers > 1 {
            self.run_levels(&unique_segments).await;
        } else {
            self.run_sequential(&unique).await;
        }

        RunReport {
            order: unique,
            states: self.states,
            errors: self.errors,
        }
    }

    async fn run_sequential(&mut self, order: &[String]) {
        for task_id in order {
            if !self.ready(task_id) {
                continue;
            }

            let task = match self.registry.get(task_id) {
                Ok(task) => task,
                Err(e) => {
                    self.record_failure(task_id, e);
                    if self.continue_on_failure {
                        continue;
                    }
                    return;
                }
            };

            self.states.insert(task_id.clone(), TaskState::Running);
            info!("Running task: {}", task_id);

            match self.context.run_action(task).await {
                Ok(()) => {
                    self.states.insert(task_id.clone(), TaskState::Succeeded);
                }
                Err(e) => {
                    self.record_failure(task_id, e);
                    if !self.continue_on_failure {
                        error!("Task '{}' failed, stopping execution", task_id);
                        return;
                    }
                }
            }
        }
    }

    async fn run_levels(&mut self, segments: &[Vec<String>]) {
        let execution_levels = calculate_dependency_levels(segments, self.graph);
        info!(
            "Executing {} levels with up to {} workers",
            execution_levels.len(),
            self.workers
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));

        for level in execution_levels {
            let mut handles = Vec::new();

            for task_id in &level.task_ids {
                if !self.ready(task_id) {
                    continue;
                }

                let task = match self.registry.get(task_id) {
                    Ok(task) => task.clone(),
                    Err(e) => {
                        self.record_failure(task_id, e);
                        continue;
                    }
                };

                self.states.insert(task_id.clone(), TaskState::Running);
                let context = Arc::clone(&self.context);
                let semaphore = Arc::clone(&semaphore);

                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    info!("Running task: {}", task.name);
                    context.run_action(&task).await
                });

                handles.push((task_id.clone(), handle));
            }

            let mut level_failed = false;
            for (task_id, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(GraphloadError::Io(std::io::Error::other(format!(
                        "task panicked: {}",
                        e
                    )))),
                };

                match result {
                    Ok(()) => {
                        self.states.insert(task_id, TaskState::Succeeded);
                    }
                    Err(e) => {
                        self.record_failure(&task_id, e);
                        level_failed = true;
                    }
                }
            }

            if level_failed && !self.continue_on_failure {
                error!("Level {} failed, stopping execution", level.level);
                return;
            }
        }
    }

    /// Checks a task can start, marking it skipped when a dependency did
    /// not succeed. Terminal tasks are never started again.
    fn ready(&mut self, task_id: &str) -> bool {
        if self
            .states
            .get(task_id)
            .is_some_and(|state| state.is_terminal())
        {
            return false;
        }

        let blocked = self
            .graph
            .dependencies(task_id)
            .iter()
            .find(|dep| {
                self.states
                    .get(dep.as_str())
                    .is_some_and(|state| *state != TaskState::Succeeded)
            })
            .cloned();

        match blocked {
            Some(dep) => {
                warn!("Skipping task '{}': dependency '{}' did not succeed", task_id, dep);
                self.states.insert(task_id.to_string(), TaskState::Skipped);
                false
            }
            None => true,
        }
    }

    fn record_failure(&mut self, task_id: &str, err: GraphloadError) {
        error!("Task '{}' failed: {}", task_id, err);
        self.states.insert(task_id.to_string(), TaskState::Failed);
        self.errors.push((task_id.to_string(), err));
    }
}
