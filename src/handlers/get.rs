use anyhow::{Context, Result};
use console::{Term, style};
use dlqueue::config::ConfigManager;
use dlqueue::download::filename_from_url;
use dlqueue::download::headers::{header_map, parse_header_line};
use dlqueue::{BulkRequest, DownloadRequest, Downloader, HttpSession, ProgressInfo};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One bar per url, created on its first progress tick.
fn progress_reporter(
    bars: MultiProgress,
) -> Result<(impl Fn(&ProgressInfo) + Send + Sync + 'static, Arc<Mutex<HashMap<String, ProgressBar>>>)>
{
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
        .progress_chars("#>-");
    let active: Arc<Mutex<HashMap<String, ProgressBar>>> = Arc::new(Mutex::new(HashMap::new()));
    let by_url = Arc::clone(&active);

    let reporter = move |info: &ProgressInfo| {
        let mut by_url = by_url.lock().unwrap_or_else(|e| e.into_inner());
        let bar = by_url.entry(info.url.clone()).or_insert_with(|| {
            let bar = bars.add(ProgressBar::new(info.total_bytes));
            bar.set_style(bar_style.clone());
            bar.set_message(filename_from_url(&info.url));
            bar
        });
        bar.set_length(info.total_bytes);
        bar.set_position(info.received_bytes);
    };

    Ok((reporter, active))
}

fn finish_bars(active: &Mutex<HashMap<String, ProgressBar>>) {
    let by_url = active.lock().unwrap_or_else(|e| e.into_inner());
    for bar in by_url.values() {
        bar.finish_and_clear();
    }
}

pub async fn handle_get(
    config_manager: &ConfigManager,
    urls: Vec<String>,
    output_dir: Option<String>,
    path: Option<String>,
    headers: Vec<String>,
    user_agent: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let term = Term::stdout();

    let mut options = config_manager.config().download_options()?;
    if let Some(dir) = output_dir {
        options.download_root = PathBuf::from(dir);
    }
    if let Some(secs) = timeout {
        options.timeout = Duration::from_secs(secs);
    }
    if let Some(agent) = user_agent {
        options.user_agent = agent;
    }
    let extra = header_map(headers.iter().filter_map(|h| parse_header_line(h)))?;
    for (name, value) in &extra {
        options.headers.insert(name.clone(), value.clone());
    }

    let downloader = Downloader::new(options.clone()).context("Invalid download settings")?;
    let session = Arc::new(HttpSession::new(&options.user_agent, downloader.filters())?);
    let subscription = downloader.attach_window(session).await;

    let subpath = PathBuf::from(path.unwrap_or_default());
    term.write_line(&format!(
        "{} Download directory: {}",
        style("📁").cyan(),
        style(options.download_root.join(&subpath).display()).cyan()
    ))?;

    let bars = MultiProgress::new();
    let (reporter, active) = progress_reporter(bars)?;
    let mut failed = false;

    if urls.len() == 1 {
        let url = &urls[0];
        term.write_line(&format!(
            "{} Downloading {}...",
            style("⬇️").cyan(),
            style(url).cyan().bold()
        ))?;

        let request = DownloadRequest::new(url.as_str())
            .with_subpath(&subpath)
            .on_progress(reporter);
        let result = downloader.download(request).await;
        finish_bars(&active);

        match result {
            Ok(info) => {
                term.write_line(&format!(
                    "{} Saved to {}",
                    style("✅").green(),
                    style(info.path.display()).cyan()
                ))?;
            }
            Err(e) => {
                term.write_line(&format!("{} {}", style("❌").red(), e))?;
                failed = true;
            }
        }
    } else {
        term.write_line(&format!(
            "{} Downloading {} files...",
            style("⬇️").cyan(),
            urls.len()
        ))?;

        let request = BulkRequest::new(urls)
            .with_subpath(&subpath)
            .on_progress(reporter)
            .on_result(|finished, errored, url| {
                debug!("{} resolved ({} ok, {} failed)", url, finished, errored);
            });
        let report = downloader.bulk_download(request).await;
        finish_bars(&active);

        for url in &report.finished {
            term.write_line(&format!("{} {}", style("✅").green(), url))?;
        }
        for url in &report.errored {
            term.write_line(&format!("{} {}", style("❌").red(), url))?;
        }

        if let Some(e) = report.error() {
            term.write_line(&format!("{} {}", style("⚠️").yellow(), e))?;
            failed = true;
        }
    }

    subscription.unsubscribe().await;

    if failed {
        process::exit(1);
    }
    Ok(())
}
