use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use anyhow::{ensure, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Binding address for the HTTP server
    ///
    /// - 0.0.0.0:7654
    #[serde(default = "default_listen_http")]
    pub listen_http: String,

    /// Path to the ffmpeg binary used for remuxing
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default)]
    pub hls: HlsSettings,

    #[serde(default)]
    pub streaming: StreamingSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Configured channels (key, source URL, optional profile override)
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,

    /// Show-info poller against PVR clients, disabled when absent
    #[serde(default)]
    pub show_info: Option<ShowInfoSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsSettings {
    /// Target media segment duration in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration: f32,

    /// Sliding window size, in segments
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,

    /// Seconds without any client activity before a stream is reclaimed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Upper bound for page navigation, startup waits and the capture queue, seconds
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout: u64,

    /// Maximum number of concurrently captured tabs
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// Navigation retries during stream setup
    #[serde(default = "default_max_navigation_retries")]
    pub max_navigation_retries: u32,

    /// Container produced by the tab capture
    #[serde(default)]
    pub capture_mode: CaptureMode,

    #[serde(default = "default_video_bits_per_second")]
    pub video_bits_per_second: u32,

    #[serde(default = "default_audio_bits_per_second")]
    pub audio_bits_per_second: u32,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    #[serde(default)]
    pub viewport: ViewportPreset,
}

/// Capture container selection.
///
/// `Native` captures fMP4 directly from the tab; `Ffmpeg` captures WebM and
/// remuxes it through an external transcoder (video copied, audio to AAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Native,
    Ffmpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewportPreset {
    #[default]
    Hd720,
    Hd1080,
}

impl ViewportPreset {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ViewportPreset::Hd720 => (1280, 720),
            ViewportPreset::Hd1080 => (1920, 1080),
        }
    }
}

impl Display for ViewportPreset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{}x{}", w, h)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Seconds between monitor ticks
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,

    /// Minimum currentTime progress between ticks to count as playing, seconds
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: f64,

    /// Consecutive stalled/paused ticks tolerated before recovery fires
    #[serde(default = "default_stall_count_threshold")]
    pub stall_count_threshold: u32,

    /// Seconds of buffering tolerated before it counts against playback
    #[serde(default = "default_buffering_grace_period")]
    pub buffering_grace_period: u64,

    /// Seconds of clean playback required before recovery state resets
    #[serde(default = "default_sustained_playback_required")]
    pub sustained_playback_required: u64,

    /// Page reload budget within [Self::page_reload_window]
    #[serde(default = "default_max_page_reloads")]
    pub max_page_reloads: u32,

    /// Sliding window for the page reload budget, seconds
    #[serde(default = "default_page_reload_window")]
    pub page_reload_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Sliding window for recovery failures, seconds
    #[serde(default = "default_circuit_breaker_window")]
    pub circuit_breaker_window: u64,

    /// Failures within the window before the stream is terminated
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel key as it appears in request paths
    pub key: String,

    /// Source page URL
    pub url: String,

    /// Friendly name shown in status output
    pub name: Option<String>,

    /// Provider label shown in status output
    pub provider: Option<String>,

    /// Site profile override, resolved by name
    pub profile: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowInfoSettings {
    /// Seconds between poll rounds
    #[serde(default = "default_show_info_interval")]
    pub poll_interval: u64,

    /// Port the PVR client API listens on
    #[serde(default = "default_show_info_port")]
    pub port: u16,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_duration: default_segment_duration(),
            max_segments: default_max_segments(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: default_navigation_timeout(),
            max_concurrent_streams: default_max_concurrent_streams(),
            max_navigation_retries: default_max_navigation_retries(),
            capture_mode: CaptureMode::default(),
            video_bits_per_second: default_video_bits_per_second(),
            audio_bits_per_second: default_audio_bits_per_second(),
            frame_rate: default_frame_rate(),
            viewport: ViewportPreset::default(),
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            monitor_interval: default_monitor_interval(),
            stall_threshold: default_stall_threshold(),
            stall_count_threshold: default_stall_count_threshold(),
            buffering_grace_period: default_buffering_grace_period(),
            sustained_playback_required: default_sustained_playback_required(),
            max_page_reloads: default_max_page_reloads(),
            page_reload_window: default_page_reload_window(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            circuit_breaker_window: default_circuit_breaker_window(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.hls.segment_duration > 0.0,
            "hls.segment_duration must be positive"
        );
        ensure!(self.hls.max_segments >= 2, "hls.max_segments must be >= 2");
        ensure!(
            self.streaming.max_concurrent_streams >= 1,
            "streaming.max_concurrent_streams must be >= 1"
        );
        ensure!(
            self.playback.monitor_interval >= 1,
            "playback.monitor_interval must be >= 1"
        );
        self.listen_http
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen_http address: {}", e))?;
        Ok(())
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming.navigation_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.hls.idle_timeout)
    }
}

fn default_listen_http() -> String {
    "0.0.0.0:7654".to_string()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_segment_duration() -> f32 {
    3.0
}
fn default_max_segments() -> usize {
    6
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_navigation_timeout() -> u64 {
    30
}
fn default_max_concurrent_streams() -> usize {
    4
}
fn default_max_navigation_retries() -> u32 {
    3
}
fn default_video_bits_per_second() -> u32 {
    8_000_000
}
fn default_audio_bits_per_second() -> u32 {
    192_000
}
fn default_frame_rate() -> u32 {
    30
}
fn default_monitor_interval() -> u64 {
    2
}
fn default_stall_threshold() -> f64 {
    0.1
}
fn default_stall_count_threshold() -> u32 {
    2
}
fn default_buffering_grace_period() -> u64 {
    10
}
fn default_sustained_playback_required() -> u64 {
    60
}
fn default_max_page_reloads() -> u32 {
    3
}
fn default_page_reload_window() -> u64 {
    300
}
fn default_circuit_breaker_window() -> u64 {
    180
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_show_info_interval() -> u64 {
    60
}
fn default_show_info_port() -> u16 {
    8089
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.hls.segment_duration, 3.0);
        assert_eq!(settings.hls.max_segments, 6);
        assert_eq!(settings.streaming.capture_mode, CaptureMode::Native);
    }

    #[test]
    fn capture_mode_parses_lowercase() {
        let settings: Settings =
            serde_json::from_str(r#"{"streaming":{"capture_mode":"ffmpeg"}}"#).unwrap();
        assert_eq!(settings.streaming.capture_mode, CaptureMode::Ffmpeg);
    }
}
