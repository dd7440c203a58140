use anyhow::Result;
use async_trait::async_trait;
use dlqueue::download::{
    DownloadItem, HostWindow, ItemEvent, ItemState, Platform, Probe, ProbeRequest,
    ProbeResponse, ResumeDescriptor, StartedDownload,
};
use dlqueue::{
    BulkRequest, DownloadError, DownloadOptions, DownloadRequest, Downloader, RegisterOptions,
};
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Host fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeWindow {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StartedDownload>>>,
    fresh: Mutex<Vec<(String, HeaderMap)>>,
    resumed: Mutex<Vec<ResumeDescriptor>>,
    progress: Mutex<Vec<f64>>,
    focused: AtomicBool,
    destroyed: AtomicBool,
}

impl FakeWindow {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fresh_urls(&self) -> Vec<String> {
        self.fresh.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    fn resumed(&self) -> Vec<ResumeDescriptor> {
        self.resumed.lock().unwrap().clone()
    }

    fn last_progress(&self) -> Option<f64> {
        self.progress.lock().unwrap().last().copied()
    }

    /// Announces `item` to the most recent subscriber.
    fn emit_with(&self, item: Arc<FakeItem>, events: mpsc::UnboundedReceiver<ItemEvent>) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(subscriber) = subscribers.last() {
            let _ = subscriber.send(StartedDownload { item, events });
        }
    }
}

impl HostWindow for FakeWindow {
    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_progress_bar(&self, progress: f64) {
        self.progress.lock().unwrap().push(progress);
    }

    fn download_url(&self, url: &str, headers: &HeaderMap) {
        self.fresh
            .lock()
            .unwrap()
            .push((url.to_string(), headers.clone()));
    }

    fn create_interrupted_download(&self, descriptor: &ResumeDescriptor) {
        self.resumed.lock().unwrap().push(descriptor.clone());
    }

    fn subscribe_downloads(&self) -> mpsc::UnboundedReceiver<StartedDownload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

struct FakeItem {
    chain: Vec<String>,
    total: u64,
    received: AtomicU64,
    state: Mutex<ItemState>,
    save_path: Mutex<Option<PathBuf>>,
    resumed: AtomicBool,
    cancelled: AtomicBool,
}

impl FakeItem {
    fn new(url: &str, total: u64) -> Arc<Self> {
        Self::with_chain(vec![url.to_string()], total, ItemState::Progressing)
    }

    fn interrupted(url: &str, offset: u64, total: u64) -> Arc<Self> {
        let item = Self::with_chain(vec![url.to_string()], total, ItemState::Interrupted);
        item.received.store(offset, Ordering::SeqCst);
        item
    }

    fn with_chain(chain: Vec<String>, total: u64, state: ItemState) -> Arc<Self> {
        Arc::new(Self {
            chain,
            total,
            received: AtomicU64::new(0),
            state: Mutex::new(state),
            save_path: Mutex::new(None),
            resumed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    fn save_path(&self) -> Option<PathBuf> {
        self.save_path.lock().unwrap().clone()
    }

    fn set_received(&self, bytes: u64) {
        self.received.store(bytes, Ordering::SeqCst);
    }
}

impl DownloadItem for FakeItem {
    fn url(&self) -> String {
        self.chain.last().cloned().unwrap_or_default()
    }

    fn url_chain(&self) -> Vec<String> {
        self.chain.clone()
    }

    fn filename(&self) -> String {
        "suggested.bin".to_string()
    }

    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn received_bytes(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn state(&self) -> ItemState {
        *self.state.lock().unwrap()
    }

    fn set_save_path(&self, path: &Path) {
        *self.save_path.lock().unwrap() = Some(path.to_path_buf());
    }

    fn resume(&self) {
        self.resumed.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = ItemState::Progressing;
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Probe answering from a fixed table; unknown urls fail like a dead host.
#[derive(Default)]
struct ScriptedProbe {
    responses: Mutex<HashMap<String, ProbeResponse>>,
    seen_headers: Mutex<Vec<HeaderMap>>,
}

impl ScriptedProbe {
    fn with(self, url: &str, length: Option<u64>, last_modified: Option<&str>) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            ProbeResponse {
                final_url: url.to_string(),
                content_length: length,
                last_modified: last_modified.map(str::to_string),
                authorization: None,
            },
        );
        self
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, request: &ProbeRequest) -> dlqueue::error::Result<ProbeResponse> {
        self.seen_headers.lock().unwrap().push(request.headers.clone());
        self.responses
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| DownloadError::Transport {
                url: request.url.clone(),
                path: request.destination.clone(),
                message: "connection refused".to_string(),
            })
    }
}

#[derive(Default)]
struct RecordingPlatform {
    finished: Mutex<Vec<PathBuf>>,
}

impl Platform for RecordingPlatform {
    fn download_finished(&self, path: &Path) {
        self.finished.lock().unwrap().push(path.to_path_buf());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    downloader: Downloader,
    window: Arc<FakeWindow>,
    platform: Arc<RecordingPlatform>,
    probe: Arc<ScriptedProbe>,
    root: TempDir,
}

async fn harness(probe: ScriptedProbe) -> Result<Harness> {
    let root = TempDir::new()?;
    let options = DownloadOptions {
        download_root: root.path().to_path_buf(),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let probe = Arc::new(probe);
    let platform = Arc::new(RecordingPlatform::default());
    let downloader = Downloader::with_parts(options, probe.clone(), platform.clone())?;

    let window = FakeWindow::new();
    // Listeners stay attached for the whole test.
    let _subscription = downloader.attach_window(window.clone()).await;

    Ok(Harness {
        downloader,
        window,
        platform,
        probe,
        root,
    })
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn spawn_download(
    downloader: &Downloader,
    request: DownloadRequest,
) -> tokio::task::JoinHandle<dlqueue::error::Result<dlqueue::ResultInfo>> {
    let downloader = downloader.clone();
    tokio::spawn(async move { downloader.download(request).await })
}

fn emit(window: &FakeWindow, item: Arc<FakeItem>) -> mpsc::UnboundedSender<ItemEvent> {
    let (tx, events) = mpsc::unbounded_channel();
    window.emit_with(item, events);
    tx
}

const FILE_URL: &str = "https://files.example.com/pub/file.bin";

// ---------------------------------------------------------------------------
// Resume decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_file_triggers_fresh_download() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), None)).await?;

    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL).with_subpath("sub"));
    wait_until(|| h.window.fresh_urls().len() == 1).await;
    assert_eq!(h.window.fresh_urls(), vec![FILE_URL.to_string()]);
    assert!(h.window.resumed().is_empty());

    let item = FakeItem::new(FILE_URL, 100);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;

    let expected = h.root.path().join("sub").join("file.bin");
    assert_eq!(item.save_path(), Some(expected.clone()));
    assert!(!item.resumed.load(Ordering::SeqCst));

    item.set_received(100);
    events.send(ItemEvent::Updated)?;
    events.send(ItemEvent::Done(ItemState::Completed))?;

    let info = handle.await??;
    assert_eq!(info.url, FILE_URL);
    assert_eq!(info.path, expected);
    assert_eq!(*h.platform.finished.lock().unwrap(), vec![expected]);
    assert_eq!(h.window.last_progress(), Some(-1.0));
    assert_eq!(h.downloader.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_complete_local_file_skips_host() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), None)).await?;
    let path = h.root.path().join("file.bin");
    tokio::fs::write(&path, vec![7u8; 100]).await?;

    let info = h.downloader.download(DownloadRequest::new(FILE_URL)).await?;

    assert_eq!(info.url, FILE_URL);
    assert_eq!(info.path, path);
    assert!(h.window.fresh_urls().is_empty());
    assert!(h.window.resumed().is_empty());
    assert_eq!(h.downloader.pending(), 0);
    assert!(h.platform.finished.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_larger_local_file_counts_as_complete() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    tokio::fs::write(h.root.path().join("file.bin"), vec![0u8; 25]).await?;

    assert_ok!(h.downloader.download(DownloadRequest::new(FILE_URL)).await);
    assert!(h.window.fresh_urls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_partial_file_resumes_at_local_size() -> Result<()> {
    let last_modified = "Wed, 21 Oct 2015 07:28:00 GMT";
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), Some(last_modified))).await?;
    let path = h.root.path().join("file.bin");
    tokio::fs::write(&path, vec![1u8; 40]).await?;

    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.resumed().len() == 1).await;

    let descriptor = h.window.resumed().remove(0);
    assert_eq!(descriptor.offset, 40);
    assert_eq!(descriptor.length, 100);
    assert_eq!(descriptor.path, path);
    assert_eq!(descriptor.url_chain, vec![FILE_URL.to_string()]);
    assert_eq!(descriptor.last_modified.as_deref(), Some(last_modified));
    assert!(h.window.fresh_urls().is_empty());

    let item = FakeItem::interrupted(FILE_URL, 40, 100);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.resumed.load(Ordering::SeqCst)).await;
    assert_eq!(item.save_path(), Some(path.clone()));

    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_eq!(handle.await??.path, path);
    Ok(())
}

#[tokio::test]
async fn test_unknown_server_size_downloads_fresh() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, None, None)).await?;
    tokio::fs::write(h.root.path().join("file.bin"), vec![1u8; 40]).await?;

    let handle = spawn_download(
        &h.downloader,
        DownloadRequest::new(FILE_URL).with_timeout(Duration::from_millis(200)),
    );
    wait_until(|| h.window.fresh_urls().len() == 1).await;
    assert!(h.window.resumed().is_empty());

    assert!(matches!(handle.await?, Err(DownloadError::Timeout { .. })));
    Ok(())
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_events_route_to_matching_requests_in_any_order() -> Result<()> {
    let urls = [
        "https://a.example.com/a.bin",
        "https://b.example.com/b.bin",
        "https://c.example.com/c.bin",
    ];
    let probe = urls
        .iter()
        .fold(ScriptedProbe::default(), |probe, url| probe.with(url, Some(10), None));
    let h = harness(probe).await?;

    let handles: Vec<_> = urls
        .iter()
        .map(|url| spawn_download(&h.downloader, DownloadRequest::new(*url)))
        .collect();
    wait_until(|| h.window.fresh_urls().len() == 3).await;
    assert_eq!(h.downloader.pending(), 3);

    // B fails, A and C complete, announced as B, A, C.
    for (url, state) in [
        (urls[1], ItemState::Interrupted),
        (urls[0], ItemState::Completed),
        (urls[2], ItemState::Completed),
    ] {
        let events = emit(&h.window, FakeItem::new(url, 10));
        events.send(ItemEvent::Done(state))?;
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await?);
    }

    assert_eq!(results[0].as_ref().unwrap().url, urls[0]);
    assert_eq!(results[2].as_ref().unwrap().url, urls[2]);
    match &results[1] {
        Err(DownloadError::Interrupted { filename, url, .. }) => {
            assert_eq!(filename, "b.bin");
            assert_eq!(url, urls[1]);
        }
        other => panic!("expected interrupted error, got {:?}", other),
    }
    assert_eq!(h.downloader.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unmatched_host_download_is_ignored() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let stranger = FakeItem::new("https://elsewhere.example.com/page.html", 5);
    let events = emit(&h.window, stranger.clone());
    let _ = events.send(ItemEvent::Done(ItemState::Completed));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(stranger.save_path().is_none());
    assert!(!stranger.resumed.load(Ordering::SeqCst));
    assert_eq!(h.downloader.pending(), 1);

    let events = emit(&h.window, FakeItem::new(FILE_URL, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(handle.await?);
    Ok(())
}

#[tokio::test]
async fn test_redirect_chain_matches_original_url() -> Result<()> {
    let url = "https://files.example.com/my%20file.bin";
    let h = harness(ScriptedProbe::default().with(url, Some(10), None)).await?;
    let handle = spawn_download(&h.downloader, DownloadRequest::new(url));
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::with_chain(
        vec![
            "https://files.example.com/my file.bin".to_string(),
            "https://cdn.example.net/abc123".to_string(),
        ],
        10,
        ItemState::Progressing,
    );
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    assert_eq!(item.save_path(), Some(h.root.path().join("my file.bin")));

    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_eq!(handle.await??.url, url);
    Ok(())
}

#[tokio::test]
async fn test_progress_reports_pairwise_speed() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(4000), None)).await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let request = DownloadRequest::new(FILE_URL).on_progress(move |info| {
        sink.lock()
            .unwrap()
            .push((info.speed_bps, info.percent, info.received_human.clone()));
    });
    let handle = spawn_download(&h.downloader, request);
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::new(FILE_URL, 4000);
    let events = emit(&h.window, item.clone());
    for bytes in [1000, 2500, 2500, 4000] {
        wait_until(|| item.save_path().is_some()).await;
        item.set_received(bytes);
        events.send(ItemEvent::Updated)?;
        let expected = seen.lock().unwrap().len() + 1;
        wait_until(|| seen.lock().unwrap().len() == expected).await;
    }
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(handle.await?);

    let seen = seen.lock().unwrap();
    let speeds: Vec<u64> = seen.iter().map(|(speed, _, _)| *speed).collect();
    assert_eq!(speeds, vec![0, 1500, 0, 1500]);
    assert_eq!(seen[3].1, 100.0);
    assert_eq!(seen[0].2, "1.00 KB");
    Ok(())
}

#[tokio::test]
async fn test_interrupted_download_clears_progress_bar() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), None)).await?;
    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::new(FILE_URL, 100);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    item.set_received(50);
    events.send(ItemEvent::Updated)?;
    wait_until(|| h.window.last_progress() == Some(0.5)).await;

    events.send(ItemEvent::Done(ItemState::Interrupted))?;
    let err = assert_err!(handle.await?);
    assert_eq!(err.to_string(), "The download of file.bin was interrupted");
    assert_eq!(h.window.last_progress(), Some(-1.0));
    assert!(h.platform.finished.lock().unwrap().is_empty());
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors, duplicates, timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transport_error_reaches_caller() -> Result<()> {
    let h = harness(ScriptedProbe::default()).await?;
    let result = h
        .downloader
        .download(DownloadRequest::new("https://down.example.com/x.iso").with_subpath("isos"))
        .await;

    match result {
        Err(DownloadError::Transport { url, path, .. }) => {
            assert_eq!(url, "https://down.example.com/x.iso");
            assert_eq!(path, h.root.path().join("isos").join("x.iso"));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(h.window.fresh_urls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_in_flight_url_is_rejected() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    let first = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let second = h.downloader.download(DownloadRequest::new(FILE_URL)).await;
    assert!(matches!(second, Err(DownloadError::AlreadyInFlight { .. })));

    let events = emit(&h.window, FakeItem::new(FILE_URL, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(first.await?);

    // Sequential downloads of the same url are fine.
    let again = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.fresh_urls().len() == 2).await;
    let events = emit(&h.window, FakeItem::new(FILE_URL, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(again.await?);
    Ok(())
}

#[tokio::test]
async fn test_timeout_withdraws_queued_request() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    let result = h
        .downloader
        .download(DownloadRequest::new(FILE_URL).with_timeout(Duration::from_millis(100)))
        .await;

    assert!(matches!(result, Err(DownloadError::Timeout { .. })));
    assert_eq!(h.downloader.pending(), 0);

    // A late host event no longer matches anything.
    let late = FakeItem::new(FILE_URL, 10);
    let _events = emit(&h.window, late.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(late.save_path().is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_matched_host_item() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    let token = CancellationToken::new();
    let handle = spawn_download(
        &h.downloader,
        DownloadRequest::new(FILE_URL).with_cancel_token(token.clone()),
    );
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::new(FILE_URL, 10);
    let _events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;

    token.cancel();
    assert!(matches!(handle.await?, Err(DownloadError::Cancelled { .. })));
    wait_until(|| item.cancelled.load(Ordering::SeqCst)).await;
    Ok(())
}

#[tokio::test]
async fn test_request_headers_reach_probe_and_host() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    let request = DownloadRequest::new(FILE_URL)
        .with_header(
            reqwest::header::HeaderName::from_static("x-token"),
            reqwest::header::HeaderValue::from_static("secret"),
        )
        .with_user_agent("custom-agent/2.0");

    let handle = spawn_download(&h.downloader, request);
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let probed = h.probe.seen_headers.lock().unwrap()[0].clone();
    assert_eq!(probed.get("x-token").unwrap(), "secret");
    assert_eq!(probed.get("user-agent").unwrap(), "custom-agent/2.0");

    let host_headers = h.window.fresh.lock().unwrap()[0].1.clone();
    assert_eq!(host_headers.get("x-token").unwrap(), "secret");

    let filtered = h.downloader.filters().get(FILE_URL).unwrap();
    assert_eq!(filtered.get("user-agent").unwrap(), "custom-agent/2.0");

    let events = emit(&h.window, FakeItem::new(FILE_URL, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(handle.await?);

    // Filters only live while the request is in flight.
    assert!(h.downloader.filters().get(FILE_URL).is_none());
    Ok(())
}

// ---------------------------------------------------------------------------
// Windows and registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_focused_window_is_preferred() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;
    h.window.focused.store(true, Ordering::SeqCst);

    let newer = FakeWindow::new();
    let _subscription = h.downloader.attach_window(newer.clone()).await;

    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.fresh_urls().len() == 1).await;
    assert!(newer.fresh_urls().is_empty());

    let events = emit(&h.window, FakeItem::new(FILE_URL, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_ok!(handle.await?);
    Ok(())
}

#[tokio::test]
async fn test_register_and_unsubscribe() -> Result<()> {
    let root = TempDir::new()?;
    let probe = Arc::new(ScriptedProbe::default().with(FILE_URL, Some(10), None));
    let downloader =
        Downloader::with_parts(DownloadOptions::default(), probe, Arc::new(RecordingPlatform::default()))?;

    let (windows_tx, windows_rx) = mpsc::unbounded_channel::<Arc<dyn HostWindow>>();
    let subscription = downloader
        .register(
            windows_rx,
            RegisterOptions {
                download_root: Some(root.path().to_path_buf()),
            },
        )
        .await;
    assert!(subscription.is_active());
    assert_eq!(downloader.download_root().await, root.path());

    let window = FakeWindow::new();
    windows_tx.send(window.clone())?;
    for _ in 0..200 {
        if downloader.window_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(downloader.window_count().await, 1);

    let handle = spawn_download(&downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| window.fresh_urls().len() == 1).await;
    let item = FakeItem::new(FILE_URL, 10);
    let events = emit(&window, item.clone());
    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_eq!(handle.await??.path, root.path().join("file.bin"));

    subscription.unsubscribe().await;
    for _ in 0..200 {
        if downloader.window_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(downloader.window_count().await, 0);

    let result = downloader.download(DownloadRequest::new(FILE_URL)).await;
    assert!(matches!(result, Err(DownloadError::NoWindow)));
    Ok(())
}

// ---------------------------------------------------------------------------
// Bulk downloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bulk_download_aggregates_in_resolution_order() -> Result<()> {
    let u1 = "https://one.example.com/1.bin";
    let u2 = "https://two.example.com/2.bin";
    let u3 = "https://three.example.com/3.bin";
    // u2 is missing from the probe table and fails.
    let h = harness(
        ScriptedProbe::default()
            .with(u1, Some(10), None)
            .with(u3, Some(10), None),
    )
    .await?;

    let tally = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tally);
    let request = BulkRequest::new([u1, u2, u3]).on_result(move |finished, errored, url| {
        sink.lock().unwrap().push((finished, errored, url.to_string()));
    });

    let downloader = h.downloader.clone();
    let bulk = tokio::spawn(async move { downloader.bulk_download(request).await });

    wait_until(|| h.window.fresh_urls().len() == 2).await;
    wait_until(|| tally.lock().unwrap().len() == 1).await;

    let events = emit(&h.window, FakeItem::new(u1, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;
    wait_until(|| tally.lock().unwrap().len() == 2).await;

    let events = emit(&h.window, FakeItem::new(u3, 10));
    events.send(ItemEvent::Done(ItemState::Completed))?;

    let report = bulk.await?;
    assert_eq!(report.finished, vec![u1.to_string(), u3.to_string()]);
    assert_eq!(report.errored, vec![u2.to_string()]);
    assert_eq!(report.error().unwrap().to_string(), "1 downloads failed");

    assert_eq!(
        *tally.lock().unwrap(),
        vec![
            (0, 1, u2.to_string()),
            (1, 1, u1.to_string()),
            (2, 1, u3.to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_bulk_download_with_no_urls_succeeds_immediately() -> Result<()> {
    let h = harness(ScriptedProbe::default()).await?;
    let report = tokio::time::timeout(
        Duration::from_secs(1),
        h.downloader.bulk_download(BulkRequest::default()),
    )
    .await?;

    assert!(report.finished.is_empty());
    assert!(report.errored.is_empty());
    assert!(report.error().is_none());
    Ok(())
}

#[tokio::test]
async fn test_bulk_download_all_complete_locally() -> Result<()> {
    let u1 = "https://one.example.com/a.bin";
    let u2 = "https://one.example.com/b.bin";
    let h = harness(
        ScriptedProbe::default()
            .with(u1, Some(3), None)
            .with(u2, Some(3), None),
    )
    .await?;
    tokio::fs::create_dir_all(h.root.path().join("batch")).await?;
    tokio::fs::write(h.root.path().join("batch").join("a.bin"), b"abc").await?;
    tokio::fs::write(h.root.path().join("batch").join("b.bin"), b"abc").await?;

    let report = h
        .downloader
        .bulk_download(BulkRequest::new([u1, u2]).with_subpath("batch"))
        .await;

    assert_eq!(report.finished.len(), 2);
    assert!(report.into_result().is_ok());
    assert!(h.window.fresh_urls().is_empty());
    Ok(())
}

// ---------------------------------------------------------------------------
// Abandoned requests and reported urls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dropped_download_withdraws_queue_entry() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(10), None)).await?;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        h.downloader.download(DownloadRequest::new(FILE_URL)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(h.downloader.pending(), 0);

    let retry = spawn_download(
        &h.downloader,
        DownloadRequest::new(FILE_URL).with_timeout(Duration::from_secs(2)),
    );
    wait_until(|| h.window.fresh_urls().len() == 2).await;
    assert_eq!(h.downloader.pending(), 1);

    let item = FakeItem::new(FILE_URL, 10);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    events.send(ItemEvent::Done(ItemState::Completed))?;

    assert_eq!(retry.await??.url, FILE_URL);
    assert_eq!(h.downloader.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_encoded_url_is_reported_as_requested() -> Result<()> {
    let url = "https://files.example.com/my%20file.bin";
    let h = harness(ScriptedProbe::default().with(url, Some(100), None)).await?;
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);

    let request = DownloadRequest::new(url).on_progress(move |info| {
        sink.lock().unwrap().push(info.url.clone());
    });
    let handle = spawn_download(&h.downloader, request);
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::with_chain(
        vec!["https://files.example.com/my file.bin".to_string()],
        100,
        ItemState::Progressing,
    );
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    item.set_received(30);
    events.send(ItemEvent::Updated)?;
    wait_until(|| reported.lock().unwrap().len() == 1).await;
    events.send(ItemEvent::Done(ItemState::Interrupted))?;

    let err = assert_err!(handle.await?);
    assert!(matches!(err, DownloadError::Interrupted { .. }));
    assert_eq!(err.url(), Some(url));
    assert_eq!(*reported.lock().unwrap(), vec![url.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_request_clears_progress_bar() -> Result<()> {
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), None)).await?;
    let token = CancellationToken::new();
    let handle = spawn_download(
        &h.downloader,
        DownloadRequest::new(FILE_URL).with_cancel_token(token.clone()),
    );
    wait_until(|| h.window.fresh_urls().len() == 1).await;

    let item = FakeItem::new(FILE_URL, 100);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    item.set_received(50);
    events.send(ItemEvent::Updated)?;
    wait_until(|| h.window.last_progress() == Some(0.5)).await;

    token.cancel();
    assert!(matches!(handle.await?, Err(DownloadError::Cancelled { .. })));
    wait_until(|| item.cancelled.load(Ordering::SeqCst)).await;
    wait_until(|| h.window.last_progress() == Some(-1.0)).await;
    Ok(())
}

#[tokio::test]
async fn test_save_path_uses_root_at_request_time() -> Result<()> {
    let last_modified = "Wed, 21 Oct 2015 07:28:00 GMT";
    let h = harness(ScriptedProbe::default().with(FILE_URL, Some(100), Some(last_modified))).await?;
    let original = h.root.path().join("file.bin");
    tokio::fs::write(&original, vec![1u8; 40]).await?;

    let handle = spawn_download(&h.downloader, DownloadRequest::new(FILE_URL));
    wait_until(|| h.window.resumed().len() == 1).await;
    assert_eq!(h.window.resumed()[0].path, original);

    // Moving the default root must not redirect a request already queued.
    let elsewhere = TempDir::new()?;
    let (_windows_tx, windows_rx) = mpsc::unbounded_channel::<Arc<dyn HostWindow>>();
    let _subscription = h
        .downloader
        .register(
            windows_rx,
            RegisterOptions {
                download_root: Some(elsewhere.path().to_path_buf()),
            },
        )
        .await;
    assert_eq!(h.downloader.download_root().await, elsewhere.path());

    let item = FakeItem::interrupted(FILE_URL, 40, 100);
    let events = emit(&h.window, item.clone());
    wait_until(|| item.save_path().is_some()).await;
    assert_eq!(item.save_path(), Some(original.clone()));

    events.send(ItemEvent::Done(ItemState::Completed))?;
    assert_eq!(handle.await??.path, original);
    Ok(())
}
