use crate::browser::{is_active_capture_error, Browser, CaptureOptions, NATIVE_CAPTURE_MIME, WEBM_CAPTURE_MIME};
use crate::settings::{CaptureMode, Settings};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

pub mod setup;

/// Serializes capture initialization process-wide.
///
/// The browser only tolerates one capture being started at a time; once a
/// capture is established the slot is released and captures run in parallel.
#[derive(Clone)]
pub struct CaptureQueue {
    slot: Arc<Mutex<()>>,
}

impl Default for CaptureQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureQueue {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for the slot, bounded. A wait that exceeds the timeout fails the
    /// caller without holding anything.
    pub async fn acquire(&self, timeout: Duration) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, self.slot.clone().lock_owned())
            .await
            .map_err(|_| anyhow!("timed out waiting for the capture queue"))
    }
}

/// Capture options matching the runtime configuration.
pub fn capture_options(settings: &Settings) -> CaptureOptions {
    let (width, height) = settings.streaming.viewport.dimensions();
    CaptureOptions {
        mime: match settings.streaming.capture_mode {
            CaptureMode::Native => NATIVE_CAPTURE_MIME.to_string(),
            CaptureMode::Ffmpeg => WEBM_CAPTURE_MIME.to_string(),
        },
        video_bits_per_second: settings.streaming.video_bits_per_second,
        audio_bits_per_second: settings.streaming.audio_bits_per_second,
        frame_rate: settings.streaming.frame_rate,
        width,
        height,
    }
}

/// The capture mutex inside the browser has leaked; nothing in this process
/// can repair it. Exit so an external supervisor relaunches us clean.
pub fn exit_for_leaked_capture(e: &anyhow::Error) -> ! {
    error!(
        "browser capture slot is permanently leaked, exiting for supervisor restart: {:#}",
        e
    );
    std::process::exit(86);
}

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Detect a leaked capture mutex before serving any traffic.
///
/// Starts and destroys a throwaway capture with runtime-identical
/// constraints. An "active stream" rejection here means a previous process
/// left the browser's capture slot taken.
pub async fn capture_probe(browser: &Arc<dyn Browser>, settings: &Settings) -> Result<()> {
    let options = capture_options(settings);
    let mut last_err = None;

    for attempt in 1..=PROBE_ATTEMPTS {
        match tokio::time::timeout(PROBE_TIMEOUT, probe_once(browser, &options)).await {
            Ok(Ok(())) => {
                info!("capture probe ok (attempt {})", attempt);
                return Ok(());
            }
            Ok(Err(e)) => {
                if is_active_capture_error(&e) {
                    exit_for_leaked_capture(&e);
                }
                warn!("capture probe attempt {} failed: {:#}", attempt, e);
                last_err = Some(e);
            }
            Err(_) => {
                warn!("capture probe attempt {} timed out", attempt);
                last_err = Some(anyhow!("probe timed out"));
            }
        }
        if attempt < PROBE_ATTEMPTS {
            tokio::time::sleep(PROBE_RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("capture probe failed"))).context("capture probe")
}

async fn probe_once(browser: &Arc<dyn Browser>, options: &CaptureOptions) -> Result<()> {
    let page = browser.new_page().await.context("probe page")?;
    let result = browser.start_capture(&page, options).await;
    match result {
        Ok(mut capture) => {
            capture.destroy().await;
            // the browser stops its side asynchronously; give it a moment
            // before the page goes away
            tokio::time::sleep(Duration::from_millis(500)).await;
            page.close().await;
            Ok(())
        }
        Err(e) => {
            page.close().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test::TestBrowser;

    #[tokio::test]
    async fn queue_serializes_and_times_out() {
        let queue = CaptureQueue::new();
        let guard = queue.acquire(Duration::from_millis(50)).await.unwrap();

        // slot is taken: a bounded wait must fail and hold nothing
        let denied = queue.acquire(Duration::from_millis(50)).await;
        assert!(denied.is_err());

        drop(guard);
        assert!(queue.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn probe_succeeds_against_clean_browser() {
        let browser: Arc<dyn crate::browser::Browser> = Arc::new(TestBrowser::default());
        let settings: Settings = serde_json::from_str("{}").unwrap();
        capture_probe(&browser, &settings).await.unwrap();
        // the throwaway page was closed again
        assert_eq!(browser.page_count(), 0);
    }
}
