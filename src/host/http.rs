//! A reqwest-backed host window.
//!
//! Behaves like a desktop shell's download session: every started download
//! is announced to subscribers, fresh downloads wait for a save path before
//! streaming, and interrupted downloads wait for `resume()`.

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, HeaderMap, HeaderValue, IF_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::download::{
    DownloadItem, HeaderFilters, HostWindow, ItemEvent, ItemState, ResumeDescriptor,
    StartedDownload, filename_from_url,
};
use crate::error::DownloadError;

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<StartedDownload>>>>;

pub struct HttpSession {
    client: Client,
    filters: HeaderFilters,
    subscribers: Subscribers,
    focused: AtomicBool,
    destroyed: AtomicBool,
    progress: Mutex<f64>,
}

impl HttpSession {
    pub fn new(user_agent: &str, filters: HeaderFilters) -> crate::error::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::Options(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, filters))
    }

    pub fn with_client(client: Client, filters: HeaderFilters) -> Self {
        Self {
            client,
            filters,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            focused: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            progress: Mutex::new(-1.0),
        }
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    /// Marks the session destroyed; it is skipped when picking a window.
    pub fn close(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    /// Last value passed to `set_progress_bar`.
    pub fn progress_bar(&self) -> f64 {
        *lock(&self.progress)
    }

    fn item(&self, url_chain: Vec<String>, headers: HeaderMap) -> ItemInner {
        let final_url = url_chain.last().cloned().unwrap_or_default();
        ItemInner {
            client: self.client.clone(),
            filters: self.filters.clone(),
            headers,
            filename: filename_from_url(&final_url),
            url_chain,
            total: AtomicU64::new(0),
            received: AtomicU64::new(0),
            last_modified: None,
            state: Mutex::new(ItemState::Progressing),
            save_path: Mutex::new(None),
            response: Mutex::new(None),
            running: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }
}

fn announce(subscribers: &Subscribers, inner: Arc<ItemInner>) {
    let mut subscribers = lock(subscribers);
    subscribers.retain(|subscriber| !subscriber.is_closed());

    for subscriber in subscribers.iter() {
        let (events_tx, events) = mpsc::unbounded_channel();
        lock(&inner.listeners).push(events_tx);

        let item: Arc<dyn DownloadItem> = Arc::new(HttpDownloadItem {
            inner: Arc::clone(&inner),
        });
        let _ = subscriber.send(StartedDownload { item, events });
    }
}

impl HostWindow for HttpSession {
    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_progress_bar(&self, progress: f64) {
        *lock(&self.progress) = progress;
    }

    fn download_url(&self, url: &str, headers: &HeaderMap) {
        let mut inner = self.item(vec![url.to_string()], headers.clone());
        let subscribers = Arc::clone(&self.subscribers);

        tokio::spawn(async move {
            // Announce once headers are in, like a browser would.
            match inner.request(0).await {
                Ok(response) => {
                    let final_url = response.url().to_string();
                    if inner.url_chain.last() != Some(&final_url) {
                        inner.filename = filename_from_url(&final_url);
                        inner.url_chain.push(final_url);
                    }
                    if let Some(length) = response.content_length() {
                        inner.total.store(length, Ordering::SeqCst);
                    }
                    *lock(&inner.response) = Some(response);
                }
                Err(e) => {
                    debug!("Initial request for {} failed: {:#}", inner.url(), e);
                }
            }

            announce(&subscribers, Arc::new(inner));
        });
    }

    fn create_interrupted_download(&self, descriptor: &ResumeDescriptor) {
        let mut inner = self.item(descriptor.url_chain.clone(), HeaderMap::new());
        inner.total = AtomicU64::new(descriptor.length);
        inner.received = AtomicU64::new(descriptor.offset);
        inner.last_modified = descriptor.last_modified.clone();
        inner.state = Mutex::new(ItemState::Interrupted);
        inner.save_path = Mutex::new(Some(descriptor.path.clone()));

        announce(&self.subscribers, Arc::new(inner));
    }

    fn subscribe_downloads(&self) -> mpsc::UnboundedReceiver<StartedDownload> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

struct ItemInner {
    client: Client,
    filters: HeaderFilters,
    headers: HeaderMap,
    url_chain: Vec<String>,
    filename: String,
    total: AtomicU64,
    received: AtomicU64,
    last_modified: Option<String>,
    state: Mutex<ItemState>,
    save_path: Mutex<Option<PathBuf>>,
    /// Response fetched before the item was announced.
    response: Mutex<Option<Response>>,
    running: AtomicBool,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ItemEvent>>>,
    cancel: CancellationToken,
}

impl ItemInner {
    fn url(&self) -> &str {
        self.url_chain.first().map(String::as_str).unwrap_or_default()
    }

    fn notify(&self, event: ItemEvent) {
        lock(&self.listeners).retain(|listener| listener.send(event).is_ok());
    }

    fn state(&self) -> ItemState {
        *lock(&self.state)
    }

    fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).transfer());
    }

    async fn transfer(self: Arc<Self>) {
        let state = tokio::select! {
            result = self.stream_to_disk() => match result {
                Ok(()) => ItemState::Completed,
                Err(e) => {
                    warn!("Transfer of {} failed: {:#}", self.filename, e);
                    ItemState::Interrupted
                }
            },
            _ = self.cancel.cancelled() => ItemState::Cancelled,
        };

        *lock(&self.state) = state;
        self.running.store(false, Ordering::SeqCst);
        self.notify(ItemEvent::Done(state));
    }

    async fn request(&self, resume_from: u64) -> Result<Response> {
        let mut headers = self.headers.clone();
        self.filters.apply(self.url(), &mut headers);

        if resume_from > 0 {
            headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={}-", resume_from))?);
            if let Some(last_modified) = &self.last_modified {
                headers.insert(IF_RANGE, HeaderValue::from_str(last_modified)?);
            }
        }

        let response = self
            .client
            .get(self.url())
            .headers(headers)
            .send()
            .await
            .context("Failed to send HTTP request")?;

        if !response.status().is_success() {
            bail!("HTTP request failed with status: {}", response.status());
        }

        Ok(response)
    }

    async fn stream_to_disk(&self) -> Result<()> {
        let path = lock(&self.save_path)
            .clone()
            .context("No save path assigned")?;

        let mut resume_from = self.received.load(Ordering::SeqCst);
        let prefetched = if resume_from == 0 {
            lock(&self.response).take()
        } else {
            None
        };
        let response = match prefetched {
            Some(response) => response,
            None => self.request(resume_from).await?,
        };

        if resume_from > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!("Server ignored the range for {}, starting over", self.filename);
            resume_from = 0;
            self.received.store(0, Ordering::SeqCst);
        }

        let total_size = if resume_from > 0 {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split('/').nth(1)?.parse().ok())
                .unwrap_or(resume_from + response.content_length().unwrap_or(0))
        } else {
            response.content_length().unwrap_or(0)
        };
        if total_size > 0 {
            self.total.store(total_size, Ordering::SeqCst);
        }

        let mut file = open_target(&path, resume_from > 0).await?;
        let mut downloaded = resume_from;
        let mut last_progress_update = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.context("Failed to read chunk from response")?;

            file.write_all(&chunk)
                .await
                .context("Failed to write chunk to file")?;

            downloaded += chunk.len() as u64;
            self.received.store(downloaded, Ordering::SeqCst);

            if last_progress_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
                self.notify(ItemEvent::Updated);
                last_progress_update = Instant::now();
            }
        }

        file.flush().await.context("Failed to flush file")?;
        self.notify(ItemEvent::Updated);

        let expected = self.total.load(Ordering::SeqCst);
        if expected > 0 && downloaded < expected {
            bail!("Connection closed after {} of {} bytes", downloaded, expected);
        }
        Ok(())
    }
}

async fn open_target(path: &Path, append: bool) -> Result<File> {
    if append {
        return OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .context("Failed to open file for resume");
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create parent directories")?;
    }
    File::create(path).await.context("Failed to create output file")
}

/// Handle to a download running in an [`HttpSession`].
pub struct HttpDownloadItem {
    inner: Arc<ItemInner>,
}

impl DownloadItem for HttpDownloadItem {
    fn url(&self) -> String {
        self.inner.url_chain.last().cloned().unwrap_or_default()
    }

    fn url_chain(&self) -> Vec<String> {
        self.inner.url_chain.clone()
    }

    fn filename(&self) -> String {
        self.inner.filename.clone()
    }

    fn total_bytes(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    fn received_bytes(&self) -> u64 {
        self.inner.received.load(Ordering::SeqCst)
    }

    fn state(&self) -> ItemState {
        self.inner.state()
    }

    fn set_save_path(&self, path: &Path) {
        *lock(&self.inner.save_path) = Some(path.to_path_buf());

        // Fresh downloads start streaming once they know where to go.
        if self.inner.state() == ItemState::Progressing {
            self.inner.start();
        }
    }

    fn resume(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != ItemState::Interrupted {
                return;
            }
            *state = ItemState::Progressing;
        }
        self.inner.start();
    }

    fn cancel(&self) {
        self.inner.cancel.cancel();

        if !self.inner.running.load(Ordering::SeqCst) {
            let mut state = lock(&self.inner.state);
            if matches!(*state, ItemState::Completed | ItemState::Cancelled) {
                return;
            }
            *state = ItemState::Cancelled;
            drop(state);
            self.inner.notify(ItemEvent::Done(ItemState::Cancelled));
        }
    }
}
