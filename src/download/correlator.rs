//! Matches host download events back to queued requests.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::host::{DownloadItem, HostWindow, ItemEvent, ItemState, Platform, StartedDownload};
use super::manager::Shared;
use super::progress::{ProgressInfo, SpeedSampler};
use super::queue::QueueEntry;
use super::{ResultInfo, queue_key};
use crate::error::DownloadError;

/// Listens for downloads started in `window` until `token` is cancelled or
/// the window stops reporting.
pub(crate) async fn listen(
    shared: Arc<Shared>,
    window: Arc<dyn HostWindow>,
    mut downloads: mpsc::UnboundedReceiver<StartedDownload>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            started = downloads.recv() => match started {
                Some(started) => {
                    correlate(&shared, &window, started);
                }
                None => break,
            },
        }
    }

    shared.forget_window(&window).await;
    debug!("Stopped listening for window downloads");
}

/// Returns `false` for downloads this downloader did not start; those are
/// left untouched.
pub(crate) fn correlate(
    shared: &Shared,
    window: &Arc<dyn HostWindow>,
    started: StartedDownload,
) -> bool {
    let StartedDownload { item, events } = started;

    // Redirects change the final url, the chain keeps the one we queued.
    let url = item.url_chain().into_iter().next().unwrap_or_else(|| item.url());
    let Some(entry) = shared.queue.pop_by_url(&queue_key(&url)) else {
        debug!("Ignoring download of {} not started here", url);
        return false;
    };

    let path = entry.root.join(&entry.subpath).join(&entry.filename);

    item.set_save_path(&path);

    if item.state() == ItemState::Interrupted {
        debug!("Resuming {} from byte {}", entry.filename, item.received_bytes());
        item.resume();
    }

    tokio::spawn(watch(
        Arc::clone(window),
        item,
        events,
        entry,
        path,
        Arc::clone(&shared.platform),
    ));
    true
}

async fn watch(
    window: Arc<dyn HostWindow>,
    item: Arc<dyn DownloadItem>,
    mut events: mpsc::UnboundedReceiver<ItemEvent>,
    entry: QueueEntry,
    path: PathBuf,
    platform: Arc<dyn Platform>,
) {
    let QueueEntry {
        url,
        filename,
        on_progress,
        completion,
        token,
        ..
    } = entry;
    let mut sampler = SpeedSampler::new();

    let outcome = loop {
        let event = tokio::select! {
            _ = token.cancelled() => {
                debug!("Request for {} gave up, cancelling host download", url);
                item.cancel();
                if !window.is_destroyed() {
                    window.set_progress_bar(-1.0);
                }
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Some(ItemEvent::Updated) => {
                let received = item.received_bytes();
                let total = item.total_bytes();
                let speed = sampler.push(received);

                if total > 0 && !window.is_destroyed() {
                    window.set_progress_bar(received as f64 / total as f64);
                }
                if let Some(callback) = &on_progress {
                    callback(&ProgressInfo::new(&url, received, total, speed));
                }
            }
            Some(ItemEvent::Done(ItemState::Completed)) => {
                platform.download_finished(&path);
                info!("Finished downloading {} to {:?}", filename, path);
                break Ok(ResultInfo {
                    url: url.clone(),
                    path: path.clone(),
                });
            }
            Some(ItemEvent::Done(ItemState::Cancelled)) => {
                warn!("Download of {} was cancelled by the host", filename);
                break Err(DownloadError::Cancelled { url: url.clone() });
            }
            Some(ItemEvent::Done(_)) | None => {
                warn!("The download of {} was interrupted", filename);
                break Err(DownloadError::Interrupted {
                    filename: filename.clone(),
                    url: url.clone(),
                    path: path.clone(),
                });
            }
        }
    };

    if !window.is_destroyed() {
        window.set_progress_bar(-1.0);
    }

    // The requester may have timed out in the meantime.
    let _ = completion.send(outcome);
}
