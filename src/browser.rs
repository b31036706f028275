use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// MIME requested from the tab capture in native mode.
pub const NATIVE_CAPTURE_MIME: &str = "video/mp4;codecs=avc1,mp4a.40.2";

/// MIME requested when the capture is remuxed through the external
/// transcoder (WebM container, video copied, audio transcoded to AAC).
pub const WEBM_CAPTURE_MIME: &str = "video/webm;codecs=h264,opus";

/// Error message fragment the browser produces when a tab already has a live
/// capture attached. Seeing this outside of known-good states means the
/// process-wide capture mutex leaked inside the browser.
pub const ACTIVE_CAPTURE_ERROR: &str = "cannot capture a tab with an active stream";

pub fn is_active_capture_error(e: &anyhow::Error) -> bool {
    format!("{:#}", e).to_lowercase().contains(ACTIVE_CAPTURE_ERROR)
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub mime: String,
    pub video_bits_per_second: u32,
    pub audio_bits_per_second: u32,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
}

/// Failure modes of a page evaluation the monitor tells apart.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluate timed out")]
    Timeout,
    #[error("frame detached")]
    FrameDetached,
    #[error("page closed")]
    PageClosed,
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("script error: {0}")]
    Script(String),
}

/// Media element state as read from the page.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoState {
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub paused: bool,
    pub ended: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "readyState")]
    pub ready_state: u8,
    #[serde(rename = "networkState")]
    pub network_state: u8,
    pub muted: bool,
    pub volume: f64,
}

impl VideoState {
    /// HTMLMediaElement.NETWORK_LOADING
    pub const NETWORK_LOADING: u8 = 2;
    /// HAVE_FUTURE_DATA, the threshold for "able to play"
    pub const HAVE_FUTURE_DATA: u8 = 3;
}

/// Result of probing for the video element.
///
/// An element that exists but has not buffered enough yet is buffering, not
/// missing; only `Missing` may feed the missing-video recovery path.
#[derive(Debug, Clone)]
pub enum VideoProbe {
    Missing,
    NotReady,
    Ready(VideoState),
}

/// Where the video element lives: the main frame or a child iframe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoTarget {
    pub frame: Option<String>,
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn set_bypass_csp(&self, enabled: bool) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Evaluate JS in the main frame (or `target` frame) and return its JSON
    /// result. Must observe both the timeout and the cancellation token.
    async fn evaluate(
        &self,
        target: &VideoTarget,
        script: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, EvalError>;

    /// Identifiers of all attached frames, for video element re-search.
    async fn frames(&self) -> Vec<String>;

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()>;

    /// Push the window out of the way; failures are ignorable.
    async fn minimize(&self);

    fn is_closed(&self) -> bool;

    /// Close the tab. Idempotent, never fails loudly.
    async fn close(&self);
}

/// One live media capture attached to a page.
///
/// Dropping the handle does not stop the browser side; `destroy` must run so
/// the capture slot is released before the page goes away.
#[async_trait]
pub trait Capture: Send {
    /// Take the capture byte stream. Panics if taken twice.
    fn take_data(&mut self) -> mpsc::Receiver<Bytes>;

    /// Stop the capture and release the browser-side slot. Idempotent.
    async fn destroy(&mut self);
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn Page>>;

    async fn start_capture(
        &self,
        page: &Arc<dyn Page>,
        options: &CaptureOptions,
    ) -> Result<Box<dyn Capture>>;

    fn is_connected(&self) -> bool;

    fn page_count(&self) -> usize;
}
