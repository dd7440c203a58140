use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::correlator;
use super::host::{HostWindow, NoopPlatform, Platform};
use super::probe::{HttpProbe, Probe, ProbeRequest, ProbeResponse};
use super::queue::{QueueEntry, QueueStore};
use super::resume::{self, ResumeDecision};
use super::{DownloadRequest, HeaderFilters, ResultInfo, filename_from_url, queue_key, validate_url};
use crate::error::{DownloadError, Result};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Root directory downloads land in unless a request overrides it.
    pub download_root: PathBuf,
    /// Deadline for a whole download, probe included.
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: String,
    /// Sent with every request, before per-request headers.
    pub headers: HeaderMap,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            timeout: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(30),
            user_agent: "dlqueue/0.1.0".to_string(),
            headers: HeaderMap::new(),
        }
    }
}

impl DownloadOptions {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(DownloadError::Options("timeout must be greater than 0".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(DownloadError::Options(
                "probe timeout must be greater than 0".into(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(DownloadError::Options("user agent cannot be empty".into()));
        }
        HeaderValue::from_str(&self.user_agent)
            .map_err(|e| DownloadError::Options(format!("user agent: {}", e)))?;
        Ok(())
    }
}

/// The user's download directory, or the current directory without one.
pub fn default_download_root() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Replaces the default download root.
    pub download_root: Option<PathBuf>,
}

/// Listeners attached by [`Downloader::register`] or
/// [`Downloader::attach_window`].
///
/// Dropping the handle leaves the listeners running; call
/// [`Subscription::unsubscribe`] to detach them.
pub struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

pub(crate) struct Shared {
    pub(crate) options: DownloadOptions,
    pub(crate) default_root: RwLock<PathBuf>,
    pub(crate) queue: QueueStore,
    pub(crate) filters: HeaderFilters,
    pub(crate) platform: Arc<dyn Platform>,
    windows: RwLock<Vec<Arc<dyn HostWindow>>>,
    last_window: RwLock<Option<Arc<dyn HostWindow>>>,
    in_flight: Mutex<HashSet<String>>,
    probe: Arc<dyn Probe>,
}

impl Shared {
    pub(crate) async fn forget_window(&self, window: &Arc<dyn HostWindow>) {
        self.windows
            .write()
            .await
            .retain(|known| !Arc::ptr_eq(known, window));

        let mut last = self.last_window.write().await;
        if last.as_ref().is_some_and(|known| Arc::ptr_eq(known, window)) {
            *last = None;
        }
    }
}

/// Orchestrates probing, resuming and correlating downloads with host
/// events. Cloning shares the same queue and windows.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> Result<Self> {
        let probe = HttpProbe::new(&options.user_agent, options.probe_timeout)?;
        Self::with_parts(options, Arc::new(probe), Arc::new(NoopPlatform))
    }

    pub fn with_parts(
        options: DownloadOptions,
        probe: Arc<dyn Probe>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                default_root: RwLock::new(options.download_root.clone()),
                options,
                queue: QueueStore::new(),
                filters: HeaderFilters::new(),
                platform,
                windows: RwLock::new(Vec::new()),
                last_window: RwLock::new(None),
                in_flight: Mutex::new(HashSet::new()),
                probe,
            }),
        })
    }

    /// Header filters host transports should apply to outgoing requests.
    pub fn filters(&self) -> HeaderFilters {
        self.shared.filters.clone()
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.shared.options
    }

    pub async fn download_root(&self) -> PathBuf {
        self.shared.default_root.read().await.clone()
    }

    /// Windows currently attached.
    pub async fn window_count(&self) -> usize {
        self.shared.windows.read().await.len()
    }

    /// Number of requests waiting for their host download to appear.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Attaches to every window received on `windows` until unsubscribed.
    pub async fn register(
        &self,
        mut windows: mpsc::UnboundedReceiver<Arc<dyn HostWindow>>,
        options: RegisterOptions,
    ) -> Subscription {
        if let Some(root) = options.download_root {
            *self.shared.default_root.write().await = root;
        }

        let token = CancellationToken::new();
        let scope = token.clone();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    window = windows.recv() => match window {
                        Some(window) => {
                            this.attach(window, scope.child_token()).await;
                        }
                        None => break,
                    },
                }
            }
        });

        Subscription { token, handle }
    }

    /// Attaches a single, already existing window.
    pub async fn attach_window(&self, window: Arc<dyn HostWindow>) -> Subscription {
        let token = CancellationToken::new();
        let handle = self.attach(window, token.clone()).await;
        Subscription { token, handle }
    }

    async fn attach(&self, window: Arc<dyn HostWindow>, token: CancellationToken) -> JoinHandle<()> {
        self.shared.windows.write().await.push(Arc::clone(&window));
        *self.shared.last_window.write().await = Some(Arc::clone(&window));

        let downloads = window.subscribe_downloads();
        tokio::spawn(correlator::listen(
            Arc::clone(&self.shared),
            window,
            downloads,
            token,
        ))
    }

    /// Focused window, falling back to the most recently attached one.
    async fn target_window(&self) -> Option<Arc<dyn HostWindow>> {
        let focused = self
            .shared
            .windows
            .read()
            .await
            .iter()
            .find(|window| !window.is_destroyed() && window.is_focused())
            .cloned();

        match focused {
            Some(window) => Some(window),
            None => self
                .shared
                .last_window
                .read()
                .await
                .clone()
                .filter(|window| !window.is_destroyed()),
        }
    }

    /// Downloads `request.url`, resuming a partial file when possible.
    ///
    /// Resolves once the host reports the download as finished, or
    /// immediately when the file on disk is already complete.
    pub async fn download(&self, request: DownloadRequest) -> Result<ResultInfo> {
        let url = request.url.trim().to_string();
        validate_url(&url)?;

        let key = queue_key(&url);
        let id = Uuid::new_v4();
        let token = request
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);

        // Held until this future resolves or is dropped.
        let _reservation = Reservation::acquire(&self.shared, &key, &url, id, token.clone())?;
        let timeout = request.timeout.unwrap_or(self.shared.options.timeout);

        tokio::select! {
            result = self.run(id, &url, &key, request, token.clone()) => result,
            _ = tokio::time::sleep(timeout) => Err(DownloadError::Timeout { url: url.clone() }),
            _ = token.cancelled() => Err(DownloadError::Cancelled { url: url.clone() }),
        }
    }

    async fn run(
        &self,
        id: Uuid,
        url: &str,
        key: &str,
        request: DownloadRequest,
        token: CancellationToken,
    ) -> Result<ResultInfo> {
        let window = self.target_window().await.ok_or(DownloadError::NoWindow)?;

        // Resolved once so the save path matches the resume descriptor.
        let root = match &request.download_root {
            Some(root) => root.clone(),
            None => self.download_root().await,
        };
        let directory = root.join(&request.subpath);
        let mut headers = self.request_headers(&request)?;

        let probe = self
            .probe(ProbeRequest {
                url: url.to_string(),
                headers: headers.clone(),
                destination: directory.join(filename_from_url(url)),
                on_login: request.on_login.clone(),
            })
            .await?;

        let filename = filename_from_url(&probe.final_url);
        let path = directory.join(&filename);

        if let Some(authorization) = &probe.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        self.shared.filters.insert(url, &headers);

        let local_size = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Some(metadata.len()),
            _ => None,
        };

        if let Some(size) = local_size {
            info!(
                "{} exists, verifying file size: ({} / {:?} downloaded)",
                filename, size, probe.content_length
            );
        }

        let decision = resume::decide(
            local_size,
            probe.content_length,
            url,
            path.clone(),
            probe.last_modified.clone(),
        );

        if decision == ResumeDecision::Complete {
            info!("{} verified, no download needed", filename);
            return Ok(ResultInfo {
                url: url.to_string(),
                path,
            });
        }

        let (completion, done) = oneshot::channel();
        self.shared.queue.push(QueueEntry {
            id,
            key: key.to_string(),
            url: url.to_string(),
            filename: filename.clone(),
            subpath: request.subpath,
            root,
            on_progress: request.on_progress,
            completion,
            token,
        });

        match decision {
            ResumeDecision::Resume(descriptor) => {
                info!(
                    "{} needs to be resumed at byte {} of {}",
                    filename, descriptor.offset, descriptor.length
                );
                window.create_interrupted_download(&descriptor);
            }
            _ => {
                info!("{} does not exist or has unknown size, download it now", filename);
                window.download_url(url, &headers);
            }
        }

        done.await.unwrap_or_else(|_| {
            Err(DownloadError::Cancelled {
                url: url.to_string(),
            })
        })
    }

    async fn probe(&self, request: ProbeRequest) -> Result<ProbeResponse> {
        match tokio::time::timeout(
            self.shared.options.probe_timeout,
            self.shared.probe.probe(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Transport {
                url: request.url,
                path: request.destination,
                message: "probe timed out".to_string(),
            }),
        }
    }

    fn request_headers(&self, request: &DownloadRequest) -> Result<HeaderMap> {
        let mut headers = self.shared.options.headers.clone();
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(user_agent) = &request.user_agent {
            let value = HeaderValue::from_str(user_agent)
                .map_err(|e| DownloadError::Options(format!("user agent: {}", e)))?;
            headers.insert(USER_AGENT, value);
        }

        Ok(headers)
    }
}

/// Marks a url as in flight until dropped.
///
/// Dropping it also withdraws the request's queue entry and stops a host
/// item already matched to it, whether the request resolved, timed out or
/// its future was dropped by the caller.
struct Reservation {
    shared: Arc<Shared>,
    key: String,
    url: String,
    id: Uuid,
    token: CancellationToken,
}

impl Reservation {
    fn acquire(
        shared: &Arc<Shared>,
        key: &str,
        url: &str,
        id: Uuid,
        token: CancellationToken,
    ) -> Result<Self> {
        let mut in_flight = shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.to_string()) {
            return Err(DownloadError::AlreadyInFlight {
                url: url.to_string(),
            });
        }

        Ok(Self {
            shared: Arc::clone(shared),
            key: key.to_string(),
            url: url.to_string(),
            id,
            token,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.shared.queue.remove(self.id).is_some() {
            debug!("Withdrew queued request for {}", self.url);
        }
        self.token.cancel();

        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
        self.shared.filters.remove(&self.url);
    }
}
