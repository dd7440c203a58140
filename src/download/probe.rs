use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderValue, LAST_MODIFIED, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::resume::parse_content_length;
use crate::error::{DownloadError, Result};

/// Called when the server asks for credentials.
pub type LoginHandler = Arc<dyn Fn(&LoginChallenge) -> Option<Credentials> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    pub url: String,
    pub scheme: String,
    pub realm: Option<String>,
}

impl LoginChallenge {
    /// Parses a `WWW-Authenticate` value such as `Basic realm="files"`.
    pub fn parse(url: &str, header: Option<&str>) -> Self {
        let header = header.unwrap_or("").trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let realm = params.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_string())
        });

        Self {
            url: url.to_string(),
            scheme: if scheme.is_empty() {
                "Basic".to_string()
            } else {
                scheme.to_string()
            },
            realm,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ProbeRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Where the file would land, reported back in transport errors.
    pub destination: PathBuf,
    pub on_login: Option<LoginHandler>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Url after redirects.
    pub final_url: String,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    /// Set when a login challenge was answered.
    pub authorization: Option<HeaderValue>,
}

/// Fetches response headers for a url without consuming the body.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResponse>;
}

pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::Options(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: &ProbeRequest, headers: HeaderMap) -> Result<Response> {
        self.client
            .get(&request.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error(request, e.to_string()))
    }

    fn basic_auth(&self, url: &str, credentials: &Credentials) -> Option<HeaderValue> {
        let built = self
            .client
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .build()
            .ok()?;
        built.headers().get(AUTHORIZATION).cloned()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResponse> {
        let mut response = self.send(request, request.headers.clone()).await?;
        let mut authorization = None;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(handler) = &request.on_login {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok());
                let challenge = LoginChallenge::parse(&request.url, header);
                debug!("Login required for {} ({})", request.url, challenge.scheme);

                if let Some(auth) = handler(&challenge)
                    .and_then(|credentials| self.basic_auth(&request.url, &credentials))
                {
                    let mut headers = request.headers.clone();
                    headers.insert(AUTHORIZATION, auth.clone());
                    response = self.send(request, headers).await?;
                    authorization = Some(auth);
                }
            }
        }

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(transport_error(request, format!("HTTP status {}", status)));
        }

        let headers = response.headers();
        let probe = ProbeResponse {
            final_url: response.url().to_string(),
            content_length: parse_content_length(
                headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok()),
            ),
            last_modified: headers
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            authorization,
        };

        debug!(
            "Probed {}: length {:?}, last modified {:?}",
            probe.final_url, probe.content_length, probe.last_modified
        );

        // Dropping the response aborts the body transfer.
        drop(response);
        Ok(probe)
    }
}

fn transport_error(request: &ProbeRequest, message: String) -> DownloadError {
    DownloadError::Transport {
        url: request.url.clone(),
        path: request.destination.clone(),
        message,
    }
}
