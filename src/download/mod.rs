pub mod bulk;
pub mod correlator;
pub mod headers;
pub mod host;
pub mod manager;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod resume;

pub use bulk::{BulkReport, BulkRequest, BulkResultCallback};
pub use headers::HeaderFilters;
pub use host::{DownloadItem, HostWindow, ItemEvent, ItemState, NoopPlatform, Platform, StartedDownload};
pub use manager::{DownloadOptions, Downloader, RegisterOptions, Subscription};
pub use probe::{Credentials, HttpProbe, LoginChallenge, LoginHandler, Probe, ProbeRequest, ProbeResponse};
pub use progress::{ProgressInfo, SpeedSampler};
pub use queue::{QueueEntry, QueueStore};
pub use resume::{ResumeDecision, ResumeDescriptor};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Terminal payload of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultInfo {
    pub url: String,
    pub path: PathBuf,
}

#[derive(Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    /// Relative directory under the download root.
    pub subpath: PathBuf,
    /// Overrides the downloader's default root for this request.
    pub download_root: Option<PathBuf>,
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
    pub on_progress: Option<ProgressCallback>,
    pub on_login: Option<LoginHandler>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_subpath(mut self, subpath: impl Into<PathBuf>) -> Self {
        self.subpath = subpath.into();
        self
    }

    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = Some(root.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_login<F>(mut self, handler: F) -> Self
    where
        F: Fn(&LoginChallenge) -> Option<Credentials> + Send + Sync + 'static,
    {
        self.on_login = Some(Arc::new(handler));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("url", &self.url)
            .field("subpath", &self.subpath)
            .field("download_root", &self.download_root)
            .field("headers", &self.headers)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Key under which a url is queued: the percent-decoded url.
pub fn queue_key(url: &str) -> String {
    urlencoding::decode(url)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| url.to_string())
}

/// Last path segment of `url`, percent-decoded.
pub fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let segment = parsed.path_segments()?.next_back()?.to_string();
            (!segment.is_empty()).then_some(segment)
        })
        .map(|segment| queue_key(&segment))
        .unwrap_or_else(|| "download".to_string())
}

pub(crate) fn validate_url(url: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(url).map_err(|e| DownloadError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(DownloadError::InvalidUrl {
            url: url.to_string(),
            message: format!("unsupported scheme {}", scheme),
        }),
    }
}
