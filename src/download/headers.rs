use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::DownloadError;

/// Extra headers registered for exact urls.
///
/// The orchestrator registers a request's headers here before handing the
/// url to the host; transports look them up when sending the real request.
#[derive(Debug, Clone, Default)]
pub struct HeaderFilters {
    inner: Arc<RwLock<HashMap<String, HeaderMap>>>,
}

impl HeaderFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `headers` into the filter for `url`.
    pub fn insert(&self, url: &str, headers: &HeaderMap) {
        if headers.is_empty() {
            return;
        }
        let mut filters = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = filters.entry(url.to_string()).or_default();
        for (name, value) in headers {
            entry.insert(name.clone(), value.clone());
        }
    }

    pub fn remove(&self, url: &str) {
        let mut filters = self.inner.write().unwrap_or_else(|e| e.into_inner());
        filters.remove(url);
    }

    pub fn get(&self, url: &str) -> Option<HeaderMap> {
        let filters = self.inner.read().unwrap_or_else(|e| e.into_inner());
        filters.get(url).cloned()
    }

    /// Rewrites `headers` with whatever is registered for `url`.
    pub fn apply(&self, url: &str, headers: &mut HeaderMap) {
        if let Some(extra) = self.get(url) {
            for (name, value) in &extra {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Builds a header map from name/value pairs, rejecting invalid ones.
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap, DownloadError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| DownloadError::Options(format!("header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| DownloadError::Options(format!("header value for {}: {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Parses a curl-style `Name: value` header line.
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
