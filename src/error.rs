use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphloadError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Task '{0}' not found")]
    UnknownTask(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP request failed ({}): {body}", status_label(.status))]
    HttpTask { status: Option<u16>, body: String },

    #[error("GSQL task '{task}' failed with status: {status}")]
    Gsql { task: String, status: String },

    #[error("Task '{0}' timed out")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no response".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, GraphloadError>;
