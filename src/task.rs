pub mod analysis;
pub mod config;
pub mod graph;
pub mod registry;

pub use analysis::{print_task_list, show_task_relationships};
pub use config::load_tasks;
pub use graph::DependencyGraph;
pub use registry::TaskRegistry;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};

use crate::http::{BodySource, HttpRequestSpec, Method};

pub const FETCH_TOKEN_TASK: &str = "getToken";
pub const DELETE_TOKEN_TASK: &str = "deleteToken";

const TOKEN_GROUP: &str = "Token Tasks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GsqlSource {
    /// Script path, relative to the script directory.
    File(PathBuf),
    /// A single inline GSQL statement such as `ls`.
    Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsqlScript {
    pub source: GsqlSource,
    /// Run against the global scope (admin credentials, no `-g`).
    pub use_global: bool,
}

/// How a CSV file maps onto a server-side loading job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobDescriptor {
    pub tag: String,
    pub filename: String,
    pub separator: String,
    pub eol: String,
    pub file: PathBuf,
}

impl LoadJobDescriptor {
    pub fn to_request(&self, graph_name: &str) -> HttpRequestSpec {
        let mut spec = HttpRequestSpec::new(Method::Post, format!("/ddl/{}", graph_name));
        spec.query.insert("tag".to_string(), self.tag.clone());
        spec.query.insert("filename".to_string(), self.filename.clone());
        spec.query.insert("sep".to_string(), self.separator.clone());
        spec.query.insert("eol".to_string(), self.eol.clone());
        spec.content_type = Some("text/csv".to_string());
        spec.body = BodySource::File(self.file.clone());
        spec
    }
}

/// Picks the members of an aggregate task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Prefix(String),
    Tag(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Prefix(prefix) => write!(f, "tasks starting with \"{}\"", prefix),
            Selector::Tag(tag) => write!(f, "tasks tagged \"{}\"", tag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    Gsql(GsqlScript),
    Http(HttpRequestSpec),
    Load(LoadJobDescriptor),
    Query {
        name: String,
        params: BTreeMap<String, String>,
    },
    Version,
    FetchToken,
    DeleteToken,
    Aggregate(Selector),
}

impl TaskAction {
    /// True for actions that go through the HTTP runner and so need a token.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TaskAction::Http(_)
                | TaskAction::Load(_)
                | TaskAction::Query { .. }
                | TaskAction::Version
        )
    }

    pub fn request(&self, graph_name: &str) -> Option<HttpRequestSpec> {
        match self {
            TaskAction::Http(spec) => Some(spec.clone()),
            TaskAction::Load(descriptor) => Some(descriptor.to_request(graph_name)),
            TaskAction::Query { name, params } => {
                let mut spec =
                    HttpRequestSpec::new(Method::Get, format!("/query/{}/{}", graph_name, name));
                spec.query = params.clone();
                spec.print_response = true;
                Some(spec)
            }
            TaskAction::Version => {
                let mut spec = HttpRequestSpec::new(Method::Get, "/version");
                spec.print_response = true;
                Some(spec)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::Gsql(_) => "gsql",
            TaskAction::Http(_) => "http",
            TaskAction::Load(_) => "load",
            TaskAction::Query { .. } => "query",
            TaskAction::Version => "version",
            TaskAction::FetchToken => "token",
            TaskAction::DeleteToken => "token-delete",
            TaskAction::Aggregate(_) => "aggregate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub group: Option<String>,
    pub tags: BTreeSet<String>,
    pub description: Option<String>,
    pub action: TaskAction,
    pub dependencies: Vec<String>,
}

impl Task {
    pub fn new(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            name: name.into(),
            group: None,
            tags: BTreeSet::new(),
            description: None,
            action,
            dependencies: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// One-line summary of what the task would do, used by `--dry-run`.
    pub fn describe(&self, graph_name: &str) -> String {
        match &self.action {
            TaskAction::Gsql(script) => {
                let scope = if script.use_global { " (global)" } else { "" };
                match &script.source {
                    GsqlSource::File(path) => format!("gsql {}{}", path.display(), scope),
                    GsqlSource::Command(command) => format!("gsql '{}'{}", command, scope),
                }
            }
            TaskAction::FetchToken => "request token".to_string(),
            TaskAction::DeleteToken => "revoke token".to_string(),
            TaskAction::Aggregate(selector) => format!("run {}", selector),
            action => match action.request(graph_name) {
                Some(spec) => describe_request(&spec),
                None => action.kind().to_string(),
            },
        }
    }
}

fn describe_request(spec: &HttpRequestSpec) -> String {
    let mut line = format!("{} {}", spec.method, spec.path);
    if !spec.query.is_empty() {
        let query: Vec<String> = spec
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.escape_default()))
            .collect();
        line.push('?');
        line.push_str(&query.join("&"));
    }
    if let BodySource::File(path) = &spec.body {
        line.push_str(&format!(" < {}", path.display()));
    }
    line
}

/// Tasks every registry starts with.
pub fn builtin_tasks() -> Vec<Task> {
    vec![
        Task::new(FETCH_TOKEN_TASK, TaskAction::FetchToken)
            .with_group(TOKEN_GROUP)
            .with_description("Request an authentication token from the graph server"),
        Task::new(DELETE_TOKEN_TASK, TaskAction::DeleteToken)
            .with_group(TOKEN_GROUP)
            .with_description("Revoke the authentication token obtained in this run"),
    ]
}
