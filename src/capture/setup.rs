use crate::browser::{is_active_capture_error, Capture, Page};
use crate::capture::{capture_options, exit_for_leaked_capture};
use crate::channels::ChannelDef;
use crate::demux::BoxReader;
use crate::egress::HlsStream;
use crate::monitor::{spawn_monitor, MonitorConfig, MonitorDeps};
use crate::mux::{HlsSegmenter, SegmenterConfig, SegmenterHandoff};
use crate::profile::{self, SiteProfile, TuneOverrides};
use crate::remux::{self, Remuxer, RemuxJob};
use crate::settings::CaptureMode;
use crate::stream_manager::{StreamEntry, StreamManager};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between navigation retries during setup.
const NAVIGATION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Timeout for the optional HEAD redirect used to re-resolve a profile.
const REDIRECT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("stream limit reached")]
    AtCapacity,
    #[error("capture unavailable: {0}")]
    Capture(String),
    #[error("stream setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub channel: Option<ChannelDef>,
    pub url: String,
    pub profile_override: Option<String>,
    pub overrides: TuneOverrides,
    pub client_address: String,
}

fn validate_url(url: &str) -> Result<(), StartError> {
    let parsed =
        url::Url::parse(url).map_err(|e| StartError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" | "chrome" => Ok(()),
        scheme => Err(StartError::InvalidUrl(format!(
            "scheme '{}' is not allowed",
            scheme
        ))),
    }
}

/// If the generic profile was resolved, follow one HEAD redirect; link
/// shorteners and portal URLs often land on a site we do have a profile for.
async fn resolve_redirect(url: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(REDIRECT_PROBE_TIMEOUT)
        .build()
        .ok()?;
    let response = client.head(url).send().await.ok()?;
    let final_url = response.url().to_string();
    if final_url != url {
        Some(final_url)
    } else {
        None
    }
}

/// Page + capture + optional transcoder, wired and tuned.
struct CaptureStack {
    page: Arc<dyn Page>,
    capture: Box<dyn Capture>,
    transcoder: Option<Remuxer>,
    data: mpsc::Receiver<Bytes>,
}

/// Capture, transcode plumbing, navigation and tuning on a fresh page. On
/// failure everything created so far is released again.
async fn build_capture_stack(
    manager: &StreamManager,
    url: &str,
    profile: &Arc<SiteProfile>,
    overrides: &TuneOverrides,
    pump_cancel: CancellationToken,
) -> Result<CaptureStack> {
    let page = manager
        .browser()
        .new_page()
        .await
        .context("creating page")?;
    match build_on_page(manager, &page, url, profile, overrides, pump_cancel).await {
        Ok(stack) => Ok(stack),
        Err(e) => {
            if is_active_capture_error(&e) {
                exit_for_leaked_capture(&e);
            }
            page.close().await;
            Err(e)
        }
    }
}

async fn build_on_page(
    manager: &StreamManager,
    page: &Arc<dyn Page>,
    url: &str,
    profile: &Arc<SiteProfile>,
    overrides: &TuneOverrides,
    pump_cancel: CancellationToken,
) -> Result<CaptureStack> {
    let settings = manager.settings();
    page.set_bypass_csp(true).await.context("bypassing CSP")?;
    let (width, height) = settings.streaming.viewport.dimensions();
    page.set_viewport(width, height)
        .await
        .context("setting viewport")?;

    // only one capture may initialize at a time, process-wide
    let options = capture_options(settings);
    let queue_slot = manager
        .capture_queue()
        .acquire(settings.navigation_timeout())
        .await?;
    let capture_result = manager.browser().start_capture(page, &options).await;
    drop(queue_slot);
    let mut capture = capture_result.context("starting capture")?;

    let raw_data = capture.take_data();
    let mut transcoder = None;
    let data = match settings.streaming.capture_mode {
        CaptureMode::Native => raw_data,
        CaptureMode::Ffmpeg => {
            let mut remuxer = match Remuxer::spawn(
                &settings.ffmpeg_path,
                RemuxJob::WebmToFmp4 {
                    audio_bitrate: settings.streaming.audio_bits_per_second,
                },
            ) {
                Ok(r) => r,
                Err(e) => {
                    capture.destroy().await;
                    return Err(e);
                }
            };
            let stdin = remuxer.take_stdin();
            let mut stdout = remuxer.take_stdout();
            tokio::spawn(remux::pump(raw_data, stdin, pump_cancel.clone()));

            let (tx, rx) = mpsc::channel(32);
            let stdout_cancel = pump_cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    tokio::select! {
                        _ = stdout_cancel.cancelled() => break,
                        read = stdout.read(&mut buf) => match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            });
            transcoder = Some(remuxer);
            rx
        }
    };

    if let Err(e) = navigate_with_retry(page, url, settings.streaming.max_navigation_retries).await
    {
        capture.destroy().await;
        if let Some(mut t) = transcoder {
            t.kill().await;
        }
        return Err(e);
    }

    if !(profile.no_video || overrides.no_video) {
        if let Err(e) = profile::tune_to_channel(page, profile, overrides, &pump_cancel).await {
            capture.destroy().await;
            if let Some(mut t) = transcoder {
                t.kill().await;
            }
            return Err(e.context("tuning to channel"));
        }
    }

    let _ = page.set_viewport(width, height).await;
    page.minimize().await;

    Ok(CaptureStack {
        page: page.clone(),
        capture,
        transcoder,
        data,
    })
}

async fn navigate_with_retry(page: &Arc<dyn Page>, url: &str, retries: u32) -> Result<()> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        if page.is_closed() {
            bail!("page closed during navigation");
        }
        match page.navigate(url).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt == attempts => {
                return Err(e.context(format!("navigation failed after {} attempts", attempts)));
            }
            Err(e) => {
                warn!("navigation attempt {} failed: {:#}", attempt, e);
                tokio::time::sleep(NAVIGATION_RETRY_DELAY).await;
            }
        }
    }
    unreachable!()
}

/// Cold-start a stream for a channel or ad-hoc URL and register it.
pub async fn start_stream(manager: &StreamManager, req: StartRequest) -> Result<u64, StartError> {
    validate_url(&req.url)?;
    let settings = manager.settings().clone();

    if manager.active_count() >= settings.streaming.max_concurrent_streams {
        // try to free one seat before rejecting
        manager.reclaim_one_idle("reclaimed for new stream").await;
        if manager.active_count() >= settings.streaming.max_concurrent_streams {
            return Err(StartError::AtCapacity);
        }
    }

    let profile_name = req
        .profile_override
        .as_deref()
        .or(req.channel.as_ref().and_then(|c| c.profile.as_deref()));
    let mut profile = manager.profiles().for_channel(profile_name, &req.url);
    // with no site profiles registered, re-resolution cannot change anything
    if manager.profiles().is_generic(&profile)
        && profile_name.is_none()
        && manager.profiles().has_site_profiles()
    {
        if let Some(final_url) = resolve_redirect(&req.url).await {
            debug!("redirect resolved {} -> {}", req.url, final_url);
            profile = manager.profiles().for_url(&final_url);
        }
    }

    let pump_cancel = CancellationToken::new();
    let stack = build_capture_stack(manager, &req.url, &profile, &req.overrides, pump_cancel.clone())
        .await
        .map_err(|e| {
            let text = format!("{:#}", e);
            if text.contains("capture queue") || text.contains("starting capture") {
                StartError::Capture(text)
            } else {
                StartError::Setup(text)
            }
        })?;

    let id = manager.allocate_id();
    let hls = Arc::new(HlsStream::new());
    let segmenter = Arc::new(Mutex::new(HlsSegmenter::new(
        SegmenterConfig {
            stream_id: id,
            segment_duration: settings.hls.segment_duration,
            max_segments: settings.hls.max_segments,
        },
        hls.clone(),
        None,
    )));

    let entry = Arc::new(StreamEntry::new(
        id,
        req.channel.as_ref().map(|c| c.key.clone()),
        req.channel.as_ref().and_then(|c| c.name.clone()),
        req.channel.as_ref().and_then(|c| c.provider.clone()),
        req.client_address.clone(),
        req.url.clone(),
        stack.page.clone(),
        segmenter.clone(),
        hls,
        profile.clone(),
        req.overrides.clone(),
    ));
    *entry.capture.lock().await = Some(stack.capture);
    *entry.transcoder.lock().await = stack.transcoder;

    // tie the pump tasks and the feed to the first capture generation
    {
        let mut feed = entry.feed_cancel.lock().unwrap();
        *feed = pump_cancel.clone();
    }
    spawn_feed(
        manager.clone(),
        id,
        segmenter.clone(),
        stack.data,
        pump_cancel,
        entry.cancel.clone(),
    );

    let monitor = spawn_monitor(MonitorDeps {
        stream_id: id,
        id_str: entry.id_str.clone(),
        url: req.url.clone(),
        page: entry.page.clone(),
        segmenter,
        profile,
        overrides: req.overrides.clone(),
        cancel: entry.cancel.clone(),
        config: MonitorConfig::from_settings(&settings),
        actions: Arc::new(manager.clone()),
    });
    *entry.monitor.lock().await = Some(monitor);

    info!(
        stream = %entry.id_str,
        channel = req.channel.as_ref().map(|c| c.key.as_str()).unwrap_or("-"),
        url = %req.url,
        "stream started"
    );
    manager.insert_entry(entry);
    Ok(id)
}

/// Feed capture bytes through the box parser into the segmenter. A source
/// that ends outside of termination or replacement takes the stream down.
fn spawn_feed(
    manager: StreamManager,
    stream_id: u64,
    segmenter: Arc<Mutex<HlsSegmenter>>,
    mut data: mpsc::Receiver<Bytes>,
    generation: CancellationToken,
    stream_cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut reader = BoxReader::new();
        let reason = loop {
            let chunk = tokio::select! {
                _ = generation.cancelled() => return,
                _ = stream_cancel.cancelled() => return,
                chunk = data.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break "capture ended";
            };

            reader.push(&chunk);
            let fed = (|| -> Result<()> {
                let mut segmenter = segmenter
                    .lock()
                    .map_err(|_| anyhow!("segmenter poisoned"))?;
                while let Some(b) = reader.next()? {
                    segmenter.push_box(b)?;
                }
                Ok(())
            })();
            if let Err(e) = fed {
                warn!("segmenter error: {:#}", e);
                break "segmenter error";
            }
        };

        if !generation.is_cancelled() && !stream_cancel.is_cancelled() {
            manager.terminate_stream(stream_id, reason).await;
        }
    });
}

/// Replace the capture tab under the same stream id, preserving segment
/// numbering, init versioning and the media timeline.
pub async fn replace_tab(manager: &StreamManager, stream_id: u64) -> Result<Arc<dyn Page>> {
    let entry = manager
        .stream(stream_id)
        .ok_or_else(|| anyhow!("stream {} is gone", stream_id))?;
    let settings = manager.settings().clone();

    // final snapshot of the outgoing segmenter; the successor continues the
    // numbering and timeline from here
    let handoff: SegmenterHandoff = {
        let mut h = entry.segmenter.lock().unwrap().handoff();
        h.pending_discontinuity = true;
        h
    };

    // silence the old feed before the capture disappears under it
    let new_generation = entry.next_feed_generation();

    if let Some(mut capture) = entry.capture.lock().await.take() {
        // releases the browser capture slot before a new capture starts
        capture.destroy().await;
    }
    if let Some(mut transcoder) = entry.transcoder.lock().await.take() {
        transcoder.kill().await;
    }
    let old_page = entry.page.read().unwrap().clone();
    old_page.close().await;

    let mut last_err = None;
    for attempt in 1..=2 {
        match build_capture_stack(
            manager,
            &entry.url,
            &entry.profile,
            &entry.overrides,
            new_generation.clone(),
        )
        .await
        {
            Ok(stack) => {
                {
                    let mut segmenter = entry.segmenter.lock().unwrap();
                    *segmenter = HlsSegmenter::new(
                        SegmenterConfig {
                            stream_id,
                            segment_duration: settings.hls.segment_duration,
                            max_segments: settings.hls.max_segments,
                        },
                        entry.hls.clone(),
                        Some(handoff.clone()),
                    );
                }
                *entry.capture.lock().await = Some(stack.capture);
                *entry.transcoder.lock().await = stack.transcoder;
                *entry.page.write().unwrap() = stack.page.clone();
                spawn_feed(
                    manager.clone(),
                    stream_id,
                    entry.segmenter.clone(),
                    stack.data,
                    new_generation,
                    entry.cancel.clone(),
                );
                info!(stream = %entry.id_str, "tab replaced (attempt {})", attempt);
                return Ok(stack.page);
            }
            Err(e) => {
                // prior cleanup is idempotent, safe to try once more
                warn!(
                    stream = %entry.id_str,
                    "tab replacement attempt {} failed: {:#}", attempt, e
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/live").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("chrome://version").is_ok());
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(StartError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(StartError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(StartError::InvalidUrl(_))
        ));
    }
}
