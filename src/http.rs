use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    error::{GraphloadError, Result},
    settings::Settings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Where a request body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySource {
    None,
    Inline(String),
    /// Opened right before the request and streamed.
    File(PathBuf),
}

/// A request a task wants to make, relative to the configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub body: BodySource,
    pub print_response: bool,
}

impl HttpRequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            content_type: None,
            body: BodySource::None,
            print_response: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { user: String, password: String },
}

pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    File(tokio::fs::File),
}

/// A fully resolved request handed to a [`Transport`].
pub struct OutgoingRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub credentials: Option<Credentials>,
    pub content_type: Option<String>,
    pub body: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError(err.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: OutgoingRequest,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = settings.request_timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(cert_path) = &settings.cert_path {
            let pem = std::fs::read(cert_path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                GraphloadError::Config(format!(
                    "Invalid CA certificate '{}': {}",
                    cert_path.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| GraphloadError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: OutgoingRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method.into(), &request.url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match request.credentials {
            Some(Credentials::Bearer(token)) => builder.bearer_auth(token),
            Some(Credentials::Basic { user, password }) => builder.basic_auth(user, Some(password)),
            None => builder,
        };

        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        builder = match request.body {
            Payload::Empty => builder,
            Payload::Bytes(bytes) => builder.body(bytes),
            Payload::File(file) => builder.body(reqwest::Body::from(file)),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}

/// Executes [`HttpRequestSpec`]s against the configured server with a bearer token.
pub struct HttpTaskRunner {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
}

impl HttpTaskRunner {
    pub fn new(settings: Arc<Settings>, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    pub async fn execute(
        &self,
        task: &str,
        spec: &HttpRequestSpec,
        token: &str,
    ) -> Result<HttpResponse> {
        let body = match &spec.body {
            BodySource::None => Payload::Empty,
            BodySource::Inline(text) => Payload::Bytes(text.clone().into_bytes()),
            BodySource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| GraphloadError::HttpTask {
                    status: None,
                    body: format!("Failed to open request body '{}': {}", path.display(), e),
                })?;
                Payload::File(file)
            }
        };

        let url = self.settings.url(&spec.path);
        debug!("Task '{}': {} {}", task, spec.method, url);

        let request = OutgoingRequest {
            method: spec.method,
            url,
            query: spec
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            credentials: Some(Credentials::Bearer(token.to_string())),
            content_type: spec.content_type.clone(),
            body,
        };

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| GraphloadError::HttpTask {
                status: None,
                body: e.to_string(),
            })?;

        if !response.is_success() {
            return Err(GraphloadError::HttpTask {
                status: Some(response.status),
                body: response.body,
            });
        }

        info!("Task '{}': HTTP {}", task, response.status);
        if spec.print_response {
            println!("{}", response.status);
            println!("{}", response.body);
            println!("Success");
        }

        Ok(response)
    }
}
