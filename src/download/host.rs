//! Interfaces the host runtime provides to the orchestrator.
//!
//! A host is anything with windows that can start downloads and report on
//! them: a desktop shell, or the reqwest-backed [`crate::host::HttpSession`].

use reqwest::header::HeaderMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::ResumeDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Transferring, or about to once a save path is set.
    Progressing,
    /// Stopped. At creation time this means the item needs `resume()`.
    Interrupted,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    Updated,
    /// Terminal, sent once.
    Done(ItemState),
}

/// Handle to one download the host has started.
pub trait DownloadItem: Send + Sync {
    /// Final url after redirects.
    fn url(&self) -> String;

    /// Redirect chain, first element being the url originally requested.
    fn url_chain(&self) -> Vec<String> {
        vec![self.url()]
    }

    fn filename(&self) -> String;
    fn total_bytes(&self) -> u64;
    fn received_bytes(&self) -> u64;
    fn state(&self) -> ItemState;
    fn set_save_path(&self, path: &Path);
    fn resume(&self);
    fn cancel(&self);
}

/// Sent by a window for every download initiated in its context.
pub struct StartedDownload {
    pub item: Arc<dyn DownloadItem>,
    pub events: mpsc::UnboundedReceiver<ItemEvent>,
}

pub trait HostWindow: Send + Sync {
    fn is_focused(&self) -> bool;
    fn is_destroyed(&self) -> bool;

    /// Fraction in `0.0..=1.0`, negative clears the indicator.
    fn set_progress_bar(&self, _progress: f64) {}

    /// Start a fresh download. The host emits the creation event itself.
    fn download_url(&self, url: &str, headers: &HeaderMap);

    /// Create a download in state `Interrupted` continuing from an offset.
    fn create_interrupted_download(&self, descriptor: &ResumeDescriptor);

    /// Stream of downloads started in this window.
    fn subscribe_downloads(&self) -> mpsc::UnboundedReceiver<StartedDownload>;
}

/// OS integration for finished downloads.
pub trait Platform: Send + Sync {
    fn download_finished(&self, path: &Path);
}

pub struct NoopPlatform;

impl Platform for NoopPlatform {
    fn download_finished(&self, _path: &Path) {}
}
