use crate::browser::{EvalError, Page, VideoProbe, VideoState, VideoTarget};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default bound for a single page evaluation.
pub const EVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Outer bound for the whole tune-to-channel sequence.
pub const TUNE_TIMEOUT: Duration = Duration::from_secs(45);

/// How the monitor verifies the video still fills the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullscreenCheck {
    #[default]
    ViewportFill,
    None,
}

/// A site-specific playbook: selectors and behaviors for tuning a page and
/// keeping it playing.
#[derive(Debug, Clone, Default)]
pub struct SiteProfile {
    pub name: String,
    /// Host suffixes this profile claims, e.g. "player.example.com"
    pub domains: Vec<String>,
    pub channel_selector: Option<String>,
    pub click_to_play: bool,
    pub click_selector: Option<String>,
    /// Pages without a video element (audio-only dashboards); tune is a no-op
    pub no_video: bool,
    /// Sites that degrade after long sessions get a proactive page reload
    pub max_continuous_playback: Option<Duration>,
    pub fullscreen_check: FullscreenCheck,
}

/// Per-request overrides from `/play` query parameters.
#[derive(Debug, Clone, Default)]
pub struct TuneOverrides {
    pub channel_selector: Option<String>,
    pub click_to_play: Option<bool>,
    pub click_selector: Option<String>,
    pub no_video: bool,
}

pub struct ProfileRegistry {
    profiles: Vec<Arc<SiteProfile>>,
    generic: Arc<SiteProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<SiteProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            generic: Arc::new(SiteProfile {
                name: "generic".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn generic(&self) -> Arc<SiteProfile> {
        self.generic.clone()
    }

    /// Whether any site-specific profiles are registered at all.
    pub fn has_site_profiles(&self) -> bool {
        !self.profiles.is_empty()
    }

    pub fn is_generic(&self, profile: &SiteProfile) -> bool {
        profile.name == self.generic.name
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<Arc<SiteProfile>> {
        if name == self.generic.name {
            return Some(self.generic.clone());
        }
        self.profiles.iter().find(|p| p.name == name).cloned()
    }

    pub fn for_url(&self, url: &str) -> Arc<SiteProfile> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));
        if let Some(host) = host {
            for profile in &self.profiles {
                if profile
                    .domains
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
                {
                    return profile.clone();
                }
            }
        }
        self.generic.clone()
    }

    pub fn for_channel(&self, profile_override: Option<&str>, url: &str) -> Arc<SiteProfile> {
        if let Some(name) = profile_override {
            if let Some(profile) = self.resolve_by_name(name) {
                return profile;
            }
            warn!("unknown profile override '{}', resolving by URL", name);
        }
        self.for_url(url)
    }
}

const PROBE_VIDEO_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return null;
    if (v.readyState === 0 && !v.currentSrc) return { notReady: true };
    return {
        currentTime: v.currentTime,
        paused: v.paused,
        ended: v.ended,
        error: v.error ? ('code ' + v.error.code) : null,
        readyState: v.readyState,
        networkState: v.networkState,
        muted: v.muted,
        volume: v.volume,
    };
})()"#;

const ENSURE_PLAYBACK_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return false;
    v.muted = false;
    v.volume = 1;
    const p = v.play();
    if (p && p.catch) p.catch(() => {});
    return true;
})()"#;

const RELOAD_SOURCE_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return false;
    v.load();
    const p = v.play();
    if (p && p.catch) p.catch(() => {});
    return true;
})()"#;

const RESTORE_VOLUME_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return false;
    v.muted = false;
    v.volume = 1;
    return true;
})()"#;

const VIEWPORT_FILLED_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return false;
    const r = v.getBoundingClientRect();
    return r.width >= window.innerWidth * 0.9 && r.height >= window.innerHeight * 0.9;
})()"#;

fn fullscreen_js(important: bool) -> String {
    let priority = if important { "important" } else { "" };
    format!(
        r#"(() => {{
    const v = document.querySelector('video');
    if (!v) return false;
    const s = [['position','fixed'],['top','0'],['left','0'],
               ['width','100vw'],['height','100vh'],
               ['z-index','2147483647'],['background','#000'],
               ['object-fit','contain']];
    for (const [k, val] of s) v.style.setProperty(k, val, '{}');
    return true;
}})()"#,
        priority
    )
}

fn click_js(selector: &str) -> String {
    format!(
        r#"(() => {{
    const el = document.querySelector({});
    if (!el) return false;
    el.click();
    return true;
}})()"#,
        serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
    )
}

/// Read the video element state from the page.
pub async fn probe_video(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    cancel: &CancellationToken,
) -> Result<VideoProbe, EvalError> {
    let value = page
        .evaluate(target, PROBE_VIDEO_JS, EVAL_TIMEOUT, cancel)
        .await?;
    Ok(parse_probe(value))
}

fn parse_probe(value: serde_json::Value) -> VideoProbe {
    if value.is_null() {
        return VideoProbe::Missing;
    }
    if value.get("notReady").and_then(|v| v.as_bool()) == Some(true) {
        return VideoProbe::NotReady;
    }
    match serde_json::from_value::<VideoState>(value) {
        Ok(state) => VideoProbe::Ready(state),
        Err(_) => VideoProbe::NotReady,
    }
}

/// Search the main frame and every child frame for the video element.
pub async fn find_video_target(
    page: &Arc<dyn Page>,
    cancel: &CancellationToken,
) -> Result<Option<VideoTarget>, EvalError> {
    let main = VideoTarget::default();
    if !matches!(probe_video(page, &main, cancel).await?, VideoProbe::Missing) {
        return Ok(Some(main));
    }
    for frame in page.frames().await {
        let target = VideoTarget {
            frame: Some(frame),
        };
        match probe_video(page, &target, cancel).await {
            Ok(VideoProbe::Missing) => continue,
            Ok(_) => return Ok(Some(target)),
            // a frame that detached mid-search is just not the one
            Err(EvalError::FrameDetached) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Profile-directed tune sequence: locate the video context, optionally
/// click-to-play, select the channel and wait for readiness. The whole
/// sequence is bounded by [TUNE_TIMEOUT].
pub async fn tune_to_channel(
    page: &Arc<dyn Page>,
    profile: &SiteProfile,
    overrides: &TuneOverrides,
    cancel: &CancellationToken,
) -> Result<VideoTarget> {
    if profile.no_video || overrides.no_video {
        return Ok(VideoTarget::default());
    }

    let deadline = Instant::now() + TUNE_TIMEOUT;

    // the player may attach its video element well after load
    let target = loop {
        if let Some(target) = find_video_target(page, cancel)
            .await
            .context("searching for video element")?
        {
            break target;
        }
        if Instant::now() >= deadline {
            bail!("no video element appeared");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let click_to_play = overrides.click_to_play.unwrap_or(profile.click_to_play);
    if click_to_play {
        let selector = overrides
            .click_selector
            .as_deref()
            .or(profile.click_selector.as_deref())
            .unwrap_or("video");
        let clicked = page
            .evaluate(&target, &click_js(selector), EVAL_TIMEOUT, cancel)
            .await
            .context("click to play")?;
        debug!(selector, ?clicked, "click-to-play");
    }

    if let Some(selector) = overrides
        .channel_selector
        .as_deref()
        .or(profile.channel_selector.as_deref())
    {
        let selected = page
            .evaluate(&target, &click_js(selector), EVAL_TIMEOUT, cancel)
            .await
            .context("channel select")?;
        debug!(selector, ?selected, "channel selected");
    }

    // wait until the element reports it can actually play
    loop {
        match probe_video(page, &target, cancel).await {
            Ok(VideoProbe::Ready(state))
                if state.ready_state >= VideoState::HAVE_FUTURE_DATA =>
            {
                return Ok(target);
            }
            Ok(_) => {}
            Err(EvalError::Timeout) => {}
            Err(e) => return Err(e).context("waiting for readiness"),
        }
        if Instant::now() >= deadline {
            bail!("video element never became ready");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// L1 recovery: play and unmute.
pub async fn ensure_playback(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    cancel: &CancellationToken,
) -> Result<(), EvalError> {
    page.evaluate(target, ENSURE_PLAYBACK_JS, EVAL_TIMEOUT, cancel)
        .await?;
    Ok(())
}

/// L2 recovery: tear the source down and re-attach it.
pub async fn reload_source(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    cancel: &CancellationToken,
) -> Result<(), EvalError> {
    page.evaluate(target, RELOAD_SOURCE_JS, EVAL_TIMEOUT, cancel)
        .await?;
    Ok(())
}

pub async fn restore_volume(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    cancel: &CancellationToken,
) -> Result<(), EvalError> {
    page.evaluate(target, RESTORE_VOLUME_JS, EVAL_TIMEOUT, cancel)
        .await?;
    Ok(())
}

pub async fn viewport_filled(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    cancel: &CancellationToken,
) -> Result<bool, EvalError> {
    let value = page
        .evaluate(target, VIEWPORT_FILLED_JS, EVAL_TIMEOUT, cancel)
        .await?;
    Ok(value.as_bool().unwrap_or(false))
}

pub async fn apply_fullscreen(
    page: &Arc<dyn Page>,
    target: &VideoTarget,
    important: bool,
    cancel: &CancellationToken,
) -> Result<(), EvalError> {
    page.evaluate(target, &fullscreen_js(important), EVAL_TIMEOUT, cancel)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_resolves_by_domain_suffix() {
        let registry = ProfileRegistry::new(vec![SiteProfile {
            name: "example".into(),
            domains: vec!["player.example.com".into()],
            ..Default::default()
        }]);
        let p = registry.for_url("https://live.player.example.com/ch/5");
        assert_eq!(p.name, "example");
        let generic = registry.for_url("https://other.com/");
        assert!(registry.is_generic(&generic));
    }

    #[test]
    fn override_name_wins_over_url() {
        let registry = ProfileRegistry::new(vec![SiteProfile {
            name: "example".into(),
            domains: vec!["example.com".into()],
            ..Default::default()
        }]);
        let p = registry.for_channel(Some("example"), "https://unrelated.org/");
        assert_eq!(p.name, "example");
        // unknown override falls back to URL resolution
        let p = registry.for_channel(Some("nope"), "https://example.com/");
        assert_eq!(p.name, "example");
    }

    #[test]
    fn probe_parsing_three_states() {
        assert!(matches!(parse_probe(json!(null)), VideoProbe::Missing));
        assert!(matches!(
            parse_probe(json!({"notReady": true})),
            VideoProbe::NotReady
        ));
        let ready = parse_probe(json!({
            "currentTime": 4.2, "paused": false, "ended": false,
            "error": null, "readyState": 4, "networkState": 2,
            "muted": false, "volume": 1.0
        }));
        match ready {
            VideoProbe::Ready(state) => assert_eq!(state.ready_state, 4),
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn click_js_escapes_selector() {
        let js = click_js("button[aria-label=\"Play\"]");
        assert!(js.contains("querySelector(\"button[aria-label=\\\"Play\\\"]\")"));
    }
}
