use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{GraphloadError, Result};

pub const HOST: &str = "gHost";
pub const USER_NAME: &str = "gUserName";
pub const PASSWORD: &str = "gPassword";
pub const ADMIN_USER_NAME: &str = "gAdminUserName";
pub const ADMIN_PASSWORD: &str = "gAdminPassword";
pub const GRAPH_NAME: &str = "gGraphName";
pub const REST_PORT: &str = "gRestPort";
pub const HOST_URI_TYPE: &str = "gHostUriType";
pub const CERT_PATH: &str = "gCertPath";
pub const CLIENT_VERSION: &str = "gClientVersion";
pub const SECRET: &str = "gSecret";

const DEFAULT_REST_PORT: u16 = 9000;

/// Resolved `gXxx` properties, keyed by property name.
pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Http,
    Https,
}

impl FromStr for UriScheme {
    type Err = GraphloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(UriScheme::Http),
            "https" => Ok(UriScheme::Https),
            other => Err(GraphloadError::Config(format!(
                "Unsupported URI scheme '{}' for {} (expected http or https)",
                other, HOST_URI_TYPE
            ))),
        }
    }
}

impl fmt::Display for UriScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriScheme::Http => write!(f, "http"),
            UriScheme::Https => write!(f, "https"),
        }
    }
}

/// Settings from the task file that are not connection properties.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub script_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub command_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub token_lifetime: Option<u64>,
    pub gsql_client: Option<String>,
    pub gsql_tokens: BTreeMap<String, String>,
}

/// Connection and workspace settings for one run.
///
/// Built once at start-up and shared by reference; nothing mutates it
/// afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub rest_port: u16,
    pub scheme: UriScheme,
    pub user_name: String,
    pub password: String,
    pub admin_user_name: String,
    pub admin_password: String,
    pub graph_name: String,
    pub cert_path: Option<PathBuf>,
    pub client_version: Option<String>,
    pub secret: Option<String>,
    pub gsql_client: Option<String>,
    pub gsql_tokens: BTreeMap<String, String>,
    pub script_dir: PathBuf,
    pub log_dir: PathBuf,
    pub command_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub token_lifetime: Option<u64>,
}

impl Settings {
    pub fn from_properties(properties: &Properties, options: &RunOptions) -> Result<Self> {
        let user_name = required(properties, USER_NAME)?;
        let password = required(properties, PASSWORD)?;

        let rest_port = match optional(properties, REST_PORT) {
            Some(port) => port.parse().map_err(|e| {
                GraphloadError::Config(format!("Invalid {} '{}': {}", REST_PORT, port, e))
            })?,
            None => DEFAULT_REST_PORT,
        };

        let scheme = match optional(properties, HOST_URI_TYPE) {
            Some(scheme) => scheme.parse()?,
            None => UriScheme::Http,
        };

        Ok(Settings {
            host: required(properties, HOST)?,
            rest_port,
            scheme,
            admin_user_name: optional(properties, ADMIN_USER_NAME)
                .unwrap_or_else(|| user_name.clone()),
            admin_password: optional(properties, ADMIN_PASSWORD)
                .unwrap_or_else(|| password.clone()),
            user_name,
            password,
            graph_name: required(properties, GRAPH_NAME)?,
            cert_path: optional(properties, CERT_PATH).map(PathBuf::from),
            client_version: optional(properties, CLIENT_VERSION),
            secret: optional(properties, SECRET),
            gsql_client: options.gsql_client.clone(),
            gsql_tokens: options.gsql_tokens.clone(),
            script_dir: options
                .script_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("db_scripts")),
            log_dir: options
                .log_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("logs")),
            command_timeout: options.command_timeout,
            request_timeout: options.request_timeout,
            token_lifetime: options.token_lifetime,
        })
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.rest_port)
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

fn required(properties: &Properties, key: &str) -> Result<String> {
    optional(properties, key)
        .ok_or_else(|| GraphloadError::Config(format!("Missing required property '{}'", key)))
}

fn optional(properties: &Properties, key: &str) -> Option<String> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) fn sample_properties() -> Properties {
    [
        (HOST, "graph.local"),
        (USER_NAME, "tigergraph"),
        (PASSWORD, "secret-pw"),
        (ADMIN_USER_NAME, "admin"),
        (ADMIN_PASSWORD, "admin-pw"),
        (GRAPH_NAME, "OrgGraph"),
        (REST_PORT, "9000"),
        (HOST_URI_TYPE, "http"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[cfg(test)]
pub(crate) fn sample_settings() -> Settings {
    Settings::from_properties(&sample_properties(), &RunOptions::default()).unwrap()
}
