use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ProgressCallback;
use crate::error::DownloadError;

pub type Completion = Result<super::ResultInfo, DownloadError>;

/// A request waiting for the host to report the matching download.
pub struct QueueEntry {
    pub id: Uuid,
    /// Percent-decoded url, compared byte for byte with host events.
    pub key: String,
    /// Url as the caller passed it, reported back in results and errors.
    pub url: String,
    pub filename: String,
    pub subpath: PathBuf,
    /// Download root resolved when the request was queued.
    pub root: PathBuf,
    pub on_progress: Option<ProgressCallback>,
    pub completion: oneshot::Sender<Completion>,
    /// Cancelled when the request gives up waiting.
    pub token: CancellationToken,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("url", &self.url)
            .field("filename", &self.filename)
            .field("subpath", &self.subpath)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct QueueStore {
    entries: Mutex<Vec<QueueEntry>>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: QueueEntry) {
        self.lock().push(entry);
    }

    /// Removes the first entry whose decoded key equals `url`.
    pub fn pop_by_url(&self, url: &str) -> Option<QueueEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|entry| entry.key == url)?;
        Some(entries.remove(index))
    }

    pub fn remove(&self, id: Uuid) -> Option<QueueEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|entry| entry.id == id)?;
        Some(entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
        // Entries stay consistent across a panic in another holder.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
