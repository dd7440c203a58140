use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DownloadRequest, Downloader, ProgressCallback, ProgressInfo};
use crate::error::DownloadError;

/// Invoked after each item resolves with `(finished, errored, url)`.
pub type BulkResultCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct BulkRequest {
    pub urls: Vec<String>,
    pub subpath: PathBuf,
    pub download_root: Option<PathBuf>,
    pub headers: HeaderMap,
    pub on_progress: Option<ProgressCallback>,
    pub on_result: Option<BulkResultCallback>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl BulkRequest {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_subpath(mut self, subpath: impl Into<PathBuf>) -> Self {
        self.subpath = subpath.into();
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize, &str) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(callback));
        self
    }

    fn item(&self, url: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            subpath: self.subpath.clone(),
            download_root: self.download_root.clone(),
            headers: self.headers.clone(),
            on_progress: self.on_progress.clone(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            ..Default::default()
        }
    }
}

/// Urls of a bulk download, in the order they resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub finished: Vec<String>,
    pub errored: Vec<String>,
}

impl BulkReport {
    pub fn total(&self) -> usize {
        self.finished.len() + self.errored.len()
    }

    pub fn error(&self) -> Option<DownloadError> {
        (!self.errored.is_empty()).then(|| DownloadError::Aggregate {
            failed: self.errored.len(),
        })
    }

    pub fn into_result(self) -> Result<Vec<String>, DownloadError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self.finished),
        }
    }
}

impl Downloader {
    /// Starts every url at once and resolves when all of them have.
    ///
    /// Repeating a url within `urls` makes the repeats fail as already in
    /// flight.
    pub async fn bulk_download(&self, request: BulkRequest) -> BulkReport {
        let mut report = BulkReport::default();
        if request.urls.is_empty() {
            return report;
        }

        let mut pending: FuturesUnordered<_> = request
            .urls
            .iter()
            .map(|url| {
                let item = request.item(url);
                async move { (url.as_str(), self.download(item).await) }
            })
            .collect();

        while let Some((url, result)) = pending.next().await {
            match result {
                Ok(_) => report.finished.push(url.to_string()),
                Err(e) => {
                    warn!("Bulk item {} failed: {}", url, e);
                    report.errored.push(url.to_string());
                }
            }

            if let Some(callback) = &request.on_result {
                callback(report.finished.len(), report.errored.len(), url);
            }
        }

        info!(
            "Bulk download finished: {} succeeded, {} failed",
            report.finished.len(),
            report.errored.len()
        );
        report
    }
}
