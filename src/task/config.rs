use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::Deserialize;

use super::{
    GsqlScript, GsqlSource, LoadJobDescriptor, Selector, Task, TaskAction, TaskRegistry,
};
use crate::{
    error::{GraphloadError, Result},
    http::{BodySource, HttpRequestSpec, Method},
    settings::{GRAPH_NAME, Properties, RunOptions},
    util::parse_duration,
};

/// Environment variables with this prefix override task file properties.
pub const ENV_PREFIX: &str = "GRAPHLOAD_";

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced variable pattern")
});
static SIMPLE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("simple variable pattern")
});

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(rename = "task", default)]
    tasks: toml::Table,
    config: Option<ConfigSection>,
    #[serde(default)]
    properties: BTreeMap<String, toml::Value>,
    gsql: Option<GsqlSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    default: Option<String>,
    workers: Option<usize>,
    script_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    timeout: Option<String>,
    request_timeout: Option<String>,
    token_lifetime: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GsqlSection {
    client: Option<String>,
    #[serde(default)]
    tokens: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    group: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(flatten)]
    kind: TaskKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum TaskKind {
    Gsql {
        script: Option<PathBuf>,
        command: Option<String>,
        #[serde(default)]
        global: bool,
    },
    Load {
        file: PathBuf,
        tag: Option<String>,
        #[serde(default = "default_load_filename")]
        filename: String,
        #[serde(default = "default_separator")]
        sep: String,
        #[serde(default = "default_eol")]
        eol: String,
    },
    Query {
        query: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    Version,
    Http {
        #[serde(default = "default_method")]
        method: Method,
        path: String,
        #[serde(default)]
        query: BTreeMap<String, String>,
        content_type: Option<String>,
        body: Option<String>,
        body_file: Option<PathBuf>,
        #[serde(default)]
        print: bool,
    },
    Aggregate {
        prefix: Option<String>,
        tag: Option<String>,
    },
}

fn default_load_filename() -> String {
    "f1".to_string()
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_eol() -> String {
    "\n".to_string()
}

fn default_method() -> Method {
    Method::Get
}

#[derive(Debug)]
pub struct TaskConfiguration {
    pub registry: TaskRegistry,
    pub properties: Properties,
    pub default_task: Option<String>,
    pub workers: Option<usize>,
    pub options: RunOptions,
}

pub fn load_tasks(config_path: &str, overrides: &[(String, String)]) -> Result<TaskConfiguration> {
    let contents = fs::read_to_string(config_path).map_err(|e| {
        GraphloadError::Config(format!("Could not read '{}': {}", config_path, e))
    })?;

    let base_dir = Path::new(config_path)
        .parent()
        .unwrap_or_else(|| Path::new("."));

    parse_tasks(&contents, base_dir, env::vars(), overrides)
}

pub fn parse_tasks(
    contents: &str,
    base_dir: &Path,
    env_vars: impl IntoIterator<Item = (String, String)>,
    overrides: &[(String, String)],
) -> Result<TaskConfiguration> {
    let config: Config = toml::from_str(contents)?;
    let env_vars: Vec<(String, String)> = env_vars.into_iter().collect();

    let mut variables = builtin_variables(&env_vars);

    let file_properties: Properties = config
        .properties
        .iter()
        .map(|(key, value)| {
            let value = substitute_variables(&scalar_to_string(value), &variables);
            (key.clone(), value)
        })
        .collect();

    let properties = resolve_properties(file_properties, env_vars, overrides);
    variables.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));

    let section = config.config.unwrap_or_default();
    let gsql = config.gsql.unwrap_or_default();

    let mut gsql_tokens: BTreeMap<String, String> = BTreeMap::new();
    if let Some(graph_name) = properties.get(GRAPH_NAME) {
        gsql_tokens.insert("graphname".to_string(), graph_name.clone());
    }
    for (key, value) in gsql.tokens {
        gsql_tokens.insert(key, substitute_variables(&value, &variables));
    }

    let options = RunOptions {
        script_dir: Some(base_dir.join(section.script_dir.unwrap_or_else(|| "db_scripts".into()))),
        log_dir: Some(base_dir.join(section.log_dir.unwrap_or_else(|| "logs".into()))),
        command_timeout: parse_duration(section.timeout.as_deref())?,
        request_timeout: parse_duration(section.request_timeout.as_deref())?,
        token_lifetime: section.token_lifetime,
        gsql_client: gsql.client.map(|client| substitute_variables(&client, &variables)),
        gsql_tokens,
    };

    let mut registry = TaskRegistry::with_builtins()?;

    for (name, mut value) in config.tasks {
        substitute_in_value(&mut value, &variables);

        let entry: TaskEntry = value
            .try_into()
            .map_err(|e| GraphloadError::Config(format!("Task '{}': {}", name, e)))?;

        let task = entry.into_task(name, base_dir)?;
        registry.register(task)?;
    }

    Ok(TaskConfiguration {
        registry,
        properties,
        default_task: section.default,
        workers: section.workers,
        options,
    })
}

/// Layers properties: task file, then `GRAPHLOAD_<key>` environment
/// variables, then command-line overrides.
pub fn resolve_properties(
    file: Properties,
    env_vars: impl IntoIterator<Item = (String, String)>,
    overrides: &[(String, String)],
) -> Properties {
    let mut properties = file;

    for (key, value) in env_vars {
        if let Some(name) = key.strip_prefix(ENV_PREFIX) {
            if !name.is_empty() {
                properties.insert(name.to_string(), value);
            }
        }
    }

    for (key, value) in overrides {
        properties.insert(key.clone(), value.clone());
    }

    properties
}

impl TaskEntry {
    fn into_task(self, name: String, base_dir: &Path) -> Result<Task> {
        let invalid = |msg: &str| GraphloadError::Config(format!("Task '{}': {}", name, msg));

        let action = match self.kind {
            TaskKind::Gsql {
                script,
                command,
                global,
            } => {
                let source = match (script, command) {
                    (Some(script), None) => GsqlSource::File(script),
                    (None, Some(command)) => GsqlSource::Command(command),
                    _ => {
                        return Err(invalid(
                            "gsql tasks need exactly one of 'script' or 'command'",
                        ));
                    }
                };
                TaskAction::Gsql(GsqlScript {
                    source,
                    use_global: global,
                })
            }
            TaskKind::Load {
                file,
                tag,
                filename,
                sep,
                eol,
            } => TaskAction::Load(LoadJobDescriptor {
                tag: tag.unwrap_or_else(|| name.clone()),
                filename,
                separator: sep,
                eol,
                file: base_dir.join(file),
            }),
            TaskKind::Query { query, params } => TaskAction::Query {
                name: query,
                params,
            },
            TaskKind::Version => TaskAction::Version,
            TaskKind::Http {
                method,
                path,
                query,
                content_type,
                body,
                body_file,
                print,
            } => {
                let body = match (body, body_file) {
                    (None, None) => BodySource::None,
                    (Some(text), None) => BodySource::Inline(text),
                    (None, Some(path)) => BodySource::File(base_dir.join(path)),
                    (Some(_), Some(_)) => {
                        return Err(invalid(
                            "http tasks take either 'body' or 'body_file', not both",
                        ));
                    }
                };
                TaskAction::Http(HttpRequestSpec {
                    method,
                    path,
                    query,
                    content_type,
                    body,
                    print_response: print,
                })
            }
            TaskKind::Aggregate { prefix, tag } => match (prefix, tag) {
                (Some(prefix), None) => TaskAction::Aggregate(Selector::Prefix(prefix)),
                (None, Some(tag)) => TaskAction::Aggregate(Selector::Tag(tag)),
                _ => return Err(invalid("aggregate tasks need exactly one of 'prefix' or 'tag'")),
            },
        };

        let mut task = Task::new(name, action);
        task.group = self.group;
        task.description = self.description;
        for tag in self.tags {
            task = task.with_tag(tag);
        }
        for dependency in self.dependencies {
            task = task.depends_on(dependency);
        }
        Ok(task)
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn builtin_variables(env_vars: &[(String, String)]) -> HashMap<String, String> {
    let mut variables = HashMap::new();

    for (key, value) in env_vars {
        variables.insert(format!("ENV_{}", key), value.clone());
    }

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }

    variables
}

fn substitute_in_value(value: &mut toml::Value, variables: &HashMap<String, String>) {
    match value {
        toml::Value::String(s) => *s = substitute_variables(s, variables),
        toml::Value::Array(items) => {
            for item in items {
                substitute_in_value(item, variables);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_in_value(item, variables);
            }
        }
        _ => {}
    }
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let result = BRACED_VAR
        .replace_all(text, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string();

    SIMPLE_VAR
        .replace_all(&result, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}
