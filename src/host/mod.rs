//! Host runtimes the downloader can drive.

pub mod http;

pub use http::{HttpDownloadItem, HttpSession};
