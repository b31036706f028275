use crate::browser::{EvalError, Page, VideoProbe, VideoState, VideoTarget};
use crate::mux::HlsSegmenter;
use crate::profile::{self, FullscreenCheck, SiteProfile, TuneOverrides};
use crate::settings::Settings;
use crate::status::{LastIssue, StreamHealth, StreamStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Consecutive evaluate timeouts before the tab is declared unresponsive.
const UNRESPONSIVE_TIMEOUTS: u32 = 3;

/// Consecutive "video not found" ticks before page navigation recovery.
const VIDEO_MISSING_TICKS: u32 = 3;

/// Consecutive undersized segments before the pipeline is declared dead.
const TINY_SEGMENT_LIMIT: u32 = 10;

/// How long segment production may sit still after recovery before it counts
/// as stalled.
const SEGMENT_STALL_WINDOW: Duration = Duration::from_secs(10);

/// Proactive page reloads fire this margin before the profile's ceiling.
const PROACTIVE_RELOAD_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryMethod {
    PlayUnmute,
    SourceReload,
    PageNavigation,
    TabReplace,
}

impl RecoveryMethod {
    pub fn level(&self) -> u8 {
        match self {
            RecoveryMethod::PlayUnmute => 1,
            RecoveryMethod::SourceReload => 2,
            RecoveryMethod::PageNavigation => 3,
            RecoveryMethod::TabReplace => 4,
        }
    }

    fn grace(&self) -> Duration {
        match self {
            RecoveryMethod::PlayUnmute => Duration::from_secs(3),
            _ => Duration::from_secs(10),
        }
    }
}

impl Display for RecoveryMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMethod::PlayUnmute => write!(f, "play/unmute"),
            RecoveryMethod::SourceReload => write!(f, "source reload"),
            RecoveryMethod::PageNavigation => write!(f, "page navigation"),
            RecoveryMethod::TabReplace => write!(f, "tab replacement"),
        }
    }
}

/// Steps the escalation ladder can select. Tab replacement never goes
/// through the ladder; its call sites drive it directly.
#[derive(Debug, Clone, Copy)]
enum LadderMethod {
    PlayUnmute,
    SourceReload,
    PageNavigation,
}

impl LadderMethod {
    fn method(self) -> RecoveryMethod {
        match self {
            LadderMethod::PlayUnmute => RecoveryMethod::PlayUnmute,
            LadderMethod::SourceReload => RecoveryMethod::SourceReload,
            LadderMethod::PageNavigation => RecoveryMethod::PageNavigation,
        }
    }
}

/// Per-stream recovery bookkeeping, summarized in the termination log.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    attempts: HashMap<RecoveryMethod, u32>,
    successes: HashMap<RecoveryMethod, u32>,
    pub total_recovery_time: Duration,
    in_progress: Option<(RecoveryMethod, Instant)>,
}

impl RecoveryMetrics {
    fn record_attempt(&mut self, method: RecoveryMethod) {
        *self.attempts.entry(method).or_insert(0) += 1;
        self.in_progress = Some((method, Instant::now()));
    }

    /// Close the pending attempt; success is often confirmed much later,
    /// once playback has been healthy long enough.
    fn finish(&mut self, success: bool) {
        if let Some((method, started)) = self.in_progress.take() {
            self.total_recovery_time += started.elapsed();
            if success {
                *self.successes.entry(method).or_insert(0) += 1;
            }
        }
    }

    pub fn pending(&self) -> Option<RecoveryMethod> {
        self.in_progress.map(|(m, _)| m)
    }

    pub fn attempts_total(&self) -> u32 {
        self.attempts.values().sum()
    }
}

impl Display for RecoveryMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no recoveries");
        }
        let mut methods: Vec<_> = self.attempts.iter().collect();
        methods.sort_by_key(|(m, _)| m.level());
        let mut first = true;
        for (method, count) in methods {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            let ok = self.successes.get(method).copied().unwrap_or(0);
            write!(f, "{} {}x ({} ok)", method, count, ok)?;
        }
        write!(
            f,
            ", {:.1}s recovering",
            self.total_recovery_time.as_secs_f32()
        )
    }
}

/// Failure counter over a sliding window; tripping terminates the stream.
pub struct CircuitBreaker {
    window: Duration,
    threshold: u32,
    first_failure: Option<Instant>,
    failures: u32,
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            first_failure: None,
            failures: 0,
        }
    }

    /// Record one failure; returns true when the breaker trips.
    pub fn record_failure(&mut self) -> bool {
        let now = Instant::now();
        match self.first_failure {
            Some(first) if now.duration_since(first) <= self.window => {}
            _ => {
                self.first_failure = Some(now);
                self.failures = 0;
            }
        }
        self.failures += 1;
        self.failures >= self.threshold
    }

    pub fn reset(&mut self) {
        self.first_failure = None;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub stall_threshold: f64,
    pub stall_count_threshold: u32,
    pub buffering_grace: Duration,
    pub sustained_playback_required: Duration,
    pub max_page_reloads: u32,
    pub page_reload_window: Duration,
    pub breaker_window: Duration,
    pub breaker_threshold: u32,
}

impl MonitorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: Duration::from_secs(settings.playback.monitor_interval),
            stall_threshold: settings.playback.stall_threshold,
            stall_count_threshold: settings.playback.stall_count_threshold,
            buffering_grace: Duration::from_secs(settings.playback.buffering_grace_period),
            sustained_playback_required: Duration::from_secs(
                settings.playback.sustained_playback_required,
            ),
            max_page_reloads: settings.playback.max_page_reloads,
            page_reload_window: Duration::from_secs(settings.playback.page_reload_window),
            breaker_window: Duration::from_secs(settings.recovery.circuit_breaker_window),
            breaker_threshold: settings.recovery.circuit_breaker_threshold,
        }
    }
}

/// What the monitor may ask of the stream registry.
#[async_trait]
pub trait MonitorActions: Send + Sync {
    /// L4: replace the capture tab, preserving segment numbering and
    /// timestamps. Returns the new page on success.
    async fn replace_tab(&self, stream_id: u64) -> Result<Arc<dyn Page>>;

    /// The circuit breaker tripped: terminate the stream.
    async fn circuit_break(&self, stream_id: u64, reason: String);

    /// Boilerplate status row for this stream, health fields left default.
    fn base_status(&self, stream_id: u64) -> Option<StreamStatus>;

    fn emit_status(&self, status: StreamStatus);
}

pub struct MonitorDeps {
    pub stream_id: u64,
    pub id_str: String,
    pub url: String,
    pub page: Arc<RwLock<Arc<dyn Page>>>,
    pub segmenter: Arc<Mutex<HlsSegmenter>>,
    pub profile: Arc<SiteProfile>,
    pub overrides: TuneOverrides,
    pub cancel: CancellationToken,
    pub config: MonitorConfig,
    pub actions: Arc<dyn MonitorActions>,
}

pub struct MonitorHandle {
    stop: CancellationToken,
    metrics: Arc<Mutex<RecoveryMetrics>>,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the periodic task and collect the accumulated recovery metrics.
    ///
    /// Never joins the task: termination can be initiated from inside the
    /// monitor itself (circuit breaker), and joining would be a self-wait.
    /// The task unwinds on its own once the token fires.
    pub async fn stop(self) -> RecoveryMetrics {
        self.stop.cancel();
        let metrics = self.metrics.lock().unwrap().clone();
        drop(self.task);
        metrics
    }
}

pub fn spawn_monitor(deps: MonitorDeps) -> MonitorHandle {
    let stop = CancellationToken::new();
    let metrics = Arc::new(Mutex::new(RecoveryMetrics::default()));
    let span = info_span!("monitor", stream = %deps.id_str);

    let breaker = CircuitBreaker::new(deps.config.breaker_window, deps.config.breaker_threshold);
    let monitor = Monitor {
        target: VideoTarget::default(),
        last_time: None,
        last_state: None,
        stall_count: 0,
        pause_count: 0,
        consecutive_timeouts: 0,
        video_missing_count: 0,
        buffering_since: None,
        escalation: 0,
        source_reload_attempted: false,
        grace_until: None,
        last_issue: None,
        issue_free_since: Instant::now(),
        segment_watch: None,
        segment_production_stalled: false,
        reload_times: VecDeque::new(),
        last_page_navigation: Instant::now(),
        fullscreen_retry: false,
        needs_minimize: false,
        breaker,
        metrics: metrics.clone(),
        deps,
    };

    let task_stop = stop.clone();
    let task = tokio::spawn(monitor.run(task_stop).instrument(span));
    MonitorHandle {
        stop,
        metrics,
        task,
    }
}

struct Monitor {
    deps: MonitorDeps,

    target: VideoTarget,
    last_time: Option<f64>,
    last_state: Option<VideoState>,
    stall_count: u32,
    pause_count: u32,
    consecutive_timeouts: u32,
    video_missing_count: u32,
    buffering_since: Option<Instant>,

    escalation: u8,
    source_reload_attempted: bool,
    grace_until: Option<Instant>,
    last_issue: Option<LastIssue>,
    issue_free_since: Instant,

    segment_watch: Option<SegmentWatch>,
    segment_production_stalled: bool,

    reload_times: VecDeque<Instant>,
    last_page_navigation: Instant,
    fullscreen_retry: bool,
    needs_minimize: bool,

    breaker: CircuitBreaker,
    metrics: Arc<Mutex<RecoveryMetrics>>,
}

/// Baseline for the post-recovery segment liveness check. The observation
/// clock only starts once the recovery grace period has passed.
struct SegmentWatch {
    baseline: u64,
    observing_since: Option<Instant>,
}

impl Monitor {
    async fn run(mut self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.deps.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // recovery runs inline in the tick, so a health check can never
        // overlap a recovery for the same stream
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.deps.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let ControlFlow::Break(()) = self.tick().await {
                        break;
                    }
                }
            }
        }
        debug!("monitor stopped");
    }

    fn page(&self) -> Arc<dyn Page> {
        self.deps.page.read().unwrap().clone()
    }

    async fn tick(&mut self) -> ControlFlow<()> {
        if self.deps.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        let page = self.page();
        if page.is_closed() {
            info!("page closed outside recovery, monitor exiting");
            return ControlFlow::Break(());
        }

        let probe = profile::probe_video(&page, &self.target, &self.deps.cancel).await;
        let state = match probe {
            Err(EvalError::Timeout) => {
                self.consecutive_timeouts += 1;
                warn!(
                    timeouts = self.consecutive_timeouts,
                    "video state read timed out"
                );
                if self.consecutive_timeouts >= UNRESPONSIVE_TIMEOUTS {
                    self.note_issue("unresponsive tab");
                    self.tab_replacement().await;
                }
                self.emit_status(StreamHealth::Stalled);
                return ControlFlow::Continue(());
            }
            Err(EvalError::FrameDetached) => {
                debug!("video context invalidated, re-searching frames");
                match profile::find_video_target(&page, &self.deps.cancel).await {
                    Ok(Some(target)) => {
                        self.target = target;
                        self.reset_health_counters();
                    }
                    _ => warn!("video element not found after frame detach"),
                }
                self.emit_status(StreamHealth::Buffering);
                return ControlFlow::Continue(());
            }
            Err(EvalError::PageClosed) => {
                info!("page closed mid-tick, monitor exiting");
                return ControlFlow::Break(());
            }
            Err(EvalError::Cancelled) => return ControlFlow::Break(()),
            Err(EvalError::Script(e)) => {
                warn!("video probe script failed: {}", e);
                self.emit_status(StreamHealth::Buffering);
                return ControlFlow::Continue(());
            }
            Ok(probe) => {
                self.consecutive_timeouts = 0;
                probe
            }
        };

        let state = match state {
            VideoProbe::Missing => {
                if self.deps.profile.no_video || self.deps.overrides.no_video {
                    self.emit_status(StreamHealth::Healthy);
                    return ControlFlow::Continue(());
                }
                self.video_missing_count += 1;
                if self.video_missing_count == 2 {
                    if let Ok(Some(target)) =
                        profile::find_video_target(&page, &self.deps.cancel).await
                    {
                        self.target = target;
                        self.video_missing_count = 0;
                    }
                } else if self.video_missing_count >= VIDEO_MISSING_TICKS {
                    self.note_issue("video element missing");
                    self.video_missing_count = 0;
                    self.execute_recovery(LadderMethod::PageNavigation).await;
                }
                self.emit_status(StreamHealth::Error);
                return ControlFlow::Continue(());
            }
            // exists but not ready is buffering, never the missing path
            VideoProbe::NotReady => {
                self.video_missing_count = 0;
                if self.buffering_since.is_none() {
                    self.buffering_since = Some(Instant::now());
                }
                self.emit_status(StreamHealth::Buffering);
                return ControlFlow::Continue(());
            }
            VideoProbe::Ready(state) => {
                self.video_missing_count = 0;
                state
            }
        };

        if state.muted || state.volume < 1.0 {
            let _ = profile::restore_volume(&page, &self.target, &self.deps.cancel).await;
        }

        let is_progressing = match self.last_time {
            Some(last) => (state.current_time - last).abs() >= self.deps.config.stall_threshold,
            None => true,
        };
        self.last_time = Some(state.current_time);

        let is_buffering = state.ready_state < VideoState::HAVE_FUTURE_DATA
            && state.network_state == VideoState::NETWORK_LOADING;
        if is_buffering {
            if self.buffering_since.is_none() {
                self.buffering_since = Some(Instant::now());
            }
        } else {
            self.buffering_since = None;
        }
        let within_buffering_grace = self
            .buffering_since
            .map(|since| since.elapsed() < self.deps.config.buffering_grace)
            .unwrap_or(!is_buffering);

        if !is_progressing {
            self.stall_count += 1;
        } else {
            self.stall_count = 0;
        }
        if state.paused {
            self.pause_count += 1;
        } else {
            self.pause_count = 0;
        }

        self.check_segment_liveness();

        if self.segmenter_tiny_segments() >= TINY_SEGMENT_LIMIT {
            self.note_issue("continuous tiny segments");
            self.tab_replacement().await;
            self.emit_status(StreamHealth::Recovering);
            return ControlFlow::Continue(());
        }

        self.reinforce_presentation(&page, &state).await;

        let within_recovery_grace = self
            .grace_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false);
        let threshold = self.deps.config.stall_count_threshold;
        let needs_recovery = !within_recovery_grace
            && (state.error.is_some()
                || state.ended
                || (state.paused && self.pause_count > threshold && !within_buffering_grace)
                || (!is_progressing && self.stall_count > threshold && !within_buffering_grace)
                || self.segment_production_stalled);

        let health = if needs_recovery || within_recovery_grace {
            StreamHealth::Recovering
        } else if state.error.is_some() {
            StreamHealth::Error
        } else if is_buffering {
            StreamHealth::Buffering
        } else if !is_progressing && self.stall_count > 0 {
            StreamHealth::Stalled
        } else {
            StreamHealth::Healthy
        };

        self.last_state = Some(state.clone());

        if needs_recovery {
            self.run_recovery(&state, is_buffering, is_progressing).await;
        } else if health == StreamHealth::Healthy {
            self.healthy_tick().await;
        } else {
            self.issue_free_since = Instant::now();
        }

        self.emit_status(health);
        ControlFlow::Continue(())
    }

    fn segmenter_tiny_segments(&self) -> u32 {
        self.deps
            .segmenter
            .lock()
            .map(|s| s.consecutive_tiny_segments())
            .unwrap_or(0)
    }

    fn segmenter_index(&self) -> u64 {
        self.deps
            .segmenter
            .lock()
            .map(|s| s.segment_index())
            .unwrap_or(0)
    }

    /// After an L2/L3 recovery the segmenter must produce again; silence
    /// means the pipeline is dead even if the player looks fine. The stall
    /// window opens when the recovery grace expires, so the ladder always
    /// gets a real observation period before tab replacement is considered.
    fn check_segment_liveness(&mut self) {
        if self.segment_watch.is_none() {
            return;
        }
        if self
            .grace_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
        {
            return;
        }
        let index = self.segmenter_index();
        let Some(watch) = self.segment_watch.as_mut() else {
            return;
        };
        if index > watch.baseline {
            self.segment_watch = None;
            self.segment_production_stalled = false;
            return;
        }
        match watch.observing_since {
            None => watch.observing_since = Some(Instant::now()),
            Some(since) if since.elapsed() >= SEGMENT_STALL_WINDOW => {
                if !self.segment_production_stalled {
                    warn!("segment production stalled after recovery");
                }
                self.segment_production_stalled = true;
            }
            Some(_) => {}
        }
    }

    async fn reinforce_presentation(&mut self, page: &Arc<dyn Page>, state: &VideoState) {
        if self.needs_minimize {
            page.minimize().await;
            self.needs_minimize = false;
        }
        if self.deps.profile.fullscreen_check == FullscreenCheck::None
            || state.ready_state < VideoState::HAVE_FUTURE_DATA
        {
            return;
        }
        match profile::viewport_filled(page, &self.target, &self.deps.cancel).await {
            Ok(true) => self.fullscreen_retry = false,
            Ok(false) => {
                // second consecutive miss escalates to !important styling
                let important = self.fullscreen_retry;
                let _ =
                    profile::apply_fullscreen(page, &self.target, important, &self.deps.cancel)
                        .await;
                self.fullscreen_retry = !important;
            }
            Err(_) => {}
        }
    }

    async fn run_recovery(&mut self, state: &VideoState, is_buffering: bool, is_progressing: bool) {
        #[derive(PartialEq)]
        enum Category {
            Other,
            Buffering,
            Paused,
        }
        let category = if state.error.is_some() || state.ended {
            Category::Other
        } else if is_buffering {
            Category::Buffering
        } else if state.ready_state < VideoState::HAVE_FUTURE_DATA && !is_progressing {
            Category::Buffering
        } else if state.paused {
            Category::Paused
        } else {
            Category::Buffering
        };

        let issue = if let Some(e) = &state.error {
            format!("media error: {}", e)
        } else if state.ended {
            "playback ended".to_string()
        } else if self.segment_production_stalled {
            "segment production stalled".to_string()
        } else if state.paused {
            "paused".to_string()
        } else {
            "stalled".to_string()
        };
        self.note_issue(&issue);

        if self.segment_production_stalled {
            self.tab_replacement().await;
            return;
        }

        let step = if category == Category::Paused && self.escalation == 0 {
            LadderMethod::PlayUnmute
        } else if !self.source_reload_attempted {
            LadderMethod::SourceReload
        } else {
            LadderMethod::PageNavigation
        };
        self.execute_recovery(step).await;
    }

    async fn execute_recovery(&mut self, step: LadderMethod) {
        let method = step.method();
        info!(level = method.level(), "recovery: {}", method);
        self.metrics.lock().unwrap().record_attempt(method);
        let page = self.page();

        let result = match step {
            LadderMethod::PlayUnmute => {
                profile::ensure_playback(&page, &self.target, &self.deps.cancel)
                    .await
                    .map_err(anyhow::Error::from)
            }
            LadderMethod::SourceReload => {
                let r = profile::reload_source(&page, &self.target, &self.deps.cancel)
                    .await
                    .map_err(anyhow::Error::from);
                self.source_reload_attempted = true;
                if r.is_ok() {
                    self.mark_discontinuity();
                    self.watch_segments();
                }
                r
            }
            LadderMethod::PageNavigation => {
                let r = self.page_navigation(&page).await;
                // the page state is unknown either way; force a clean decode
                self.mark_discontinuity();
                self.watch_segments();
                r
            }
        };

        self.escalation = self.escalation.max(method.level());
        self.grace_until = Some(Instant::now() + method.grace());
        self.issue_free_since = Instant::now();

        match result {
            Ok(()) => {
                // re-minimize once the page settles again
                self.needs_minimize = true;
                // success is confirmed later by sustained playback; the
                // attempt itself still counts against the breaker
                if self.breaker.record_failure() {
                    self.trip_breaker().await;
                }
            }
            Err(e) => {
                warn!("recovery {} failed: {:#}", method, e);
                self.metrics.lock().unwrap().finish(false);
                if self.breaker.record_failure() {
                    self.trip_breaker().await;
                }
            }
        }
    }

    async fn page_navigation(&mut self, page: &Arc<dyn Page>) -> Result<()> {
        if !self.reload_allowed() {
            anyhow::bail!("page reload rate limit reached");
        }
        self.reload_times.push_back(Instant::now());

        let mut last_err = None;
        for attempt in 1..=2 {
            match self.navigate_and_tune(page).await {
                Ok(()) => {
                    self.last_page_navigation = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    warn!("navigation attempt {} failed: {:#}", attempt, e);
                    last_err = Some(e);
                }
            }
        }
        // both navigations failed; a source reload may still rescue playback
        self.source_reload_attempted = true;
        match profile::reload_source(page, &self.target, &self.deps.cancel).await {
            Ok(()) => {
                info!("navigation failed twice, source reload fallback applied");
                Ok(())
            }
            Err(_) => Err(last_err.unwrap()),
        }
    }

    async fn navigate_and_tune(&mut self, page: &Arc<dyn Page>) -> Result<()> {
        page.navigate(&self.deps.url).await?;
        let target = profile::tune_to_channel(
            page,
            &self.deps.profile,
            &self.deps.overrides,
            &self.deps.cancel,
        )
        .await?;
        self.target = target;
        Ok(())
    }

    async fn tab_replacement(&mut self) {
        info!("recovery: tab replacement");
        self.metrics
            .lock()
            .unwrap()
            .record_attempt(RecoveryMethod::TabReplace);

        match self.deps.actions.replace_tab(self.deps.stream_id).await {
            Ok(new_page) => {
                *self.deps.page.write().unwrap() = new_page;
                self.metrics.lock().unwrap().finish(true);
                self.reset_health_counters();
                self.escalation = 0;
                self.source_reload_attempted = false;
                self.segment_watch = None;
                self.segment_production_stalled = false;
                self.breaker.reset();
                self.target = VideoTarget::default();
                self.needs_minimize = true;
                self.grace_until =
                    Some(Instant::now() + RecoveryMethod::PageNavigation.grace());
                info!("tab replaced");
            }
            Err(e) => {
                warn!("tab replacement failed: {:#}", e);
                self.metrics.lock().unwrap().finish(false);
                if self.breaker.record_failure() {
                    self.trip_breaker().await;
                }
            }
        }
    }

    async fn trip_breaker(&mut self) {
        warn!(
            failures = self.breaker.failures(),
            "circuit breaker tripped"
        );
        self.deps
            .actions
            .circuit_break(self.deps.stream_id, "circuit breaker tripped".to_string())
            .await;
    }

    async fn healthy_tick(&mut self) {
        if self.issue_free_since.elapsed() >= self.deps.config.sustained_playback_required {
            let pending = self.metrics.lock().unwrap().pending();
            if let Some(method) = pending {
                info!("recovery {} confirmed by sustained playback", method);
                self.metrics.lock().unwrap().finish(true);
            }
            if self.escalation > 0 {
                debug!("sustained playback, recovery state reset");
            }
            self.escalation = 0;
            self.source_reload_attempted = false;
            self.segment_watch = None;
            self.segment_production_stalled = false;
            self.breaker.reset();
            self.buffering_since = None;
        }

        self.proactive_reload().await;
    }

    /// Some sites degrade after hours of playback; reload shortly before the
    /// profile's stated ceiling while everything is still healthy.
    async fn proactive_reload(&mut self) {
        let Some(ceiling) = self.deps.profile.max_continuous_playback else {
            return;
        };
        let threshold = ceiling.saturating_sub(PROACTIVE_RELOAD_MARGIN);
        if self.last_page_navigation.elapsed() < threshold {
            return;
        }
        if !self.reload_allowed() {
            return;
        }
        info!("proactive page reload before continuous playback ceiling");
        let page = self.page();
        self.reload_times.push_back(Instant::now());
        match self.navigate_and_tune(&page).await {
            Ok(()) => {
                self.mark_discontinuity();
                self.last_page_navigation = Instant::now();
            }
            Err(e) => warn!("proactive reload failed: {:#}", e),
        }
    }

    fn reload_allowed(&mut self) -> bool {
        let window = self.deps.config.page_reload_window;
        while let Some(front) = self.reload_times.front() {
            if front.elapsed() > window {
                self.reload_times.pop_front();
            } else {
                break;
            }
        }
        (self.reload_times.len() as u32) < self.deps.config.max_page_reloads
    }

    fn mark_discontinuity(&self) {
        if let Ok(mut segmenter) = self.deps.segmenter.lock() {
            segmenter.mark_discontinuity();
        }
    }

    fn watch_segments(&mut self) {
        self.segment_watch = Some(SegmentWatch {
            baseline: self.segmenter_index(),
            observing_since: None,
        });
        self.segment_production_stalled = false;
    }

    fn reset_health_counters(&mut self) {
        self.stall_count = 0;
        self.pause_count = 0;
        self.consecutive_timeouts = 0;
        self.video_missing_count = 0;
        self.buffering_since = None;
        self.last_time = None;
        self.issue_free_since = Instant::now();
    }

    fn note_issue(&mut self, kind: &str) {
        self.last_issue = Some(LastIssue {
            kind: kind.to_string(),
            time: Utc::now(),
        });
        self.issue_free_since = Instant::now();
    }

    fn emit_status(&self, health: StreamHealth) {
        let Some(mut status) = self.deps.actions.base_status(self.deps.stream_id) else {
            return;
        };
        status.health = health;
        status.escalation_level = self.escalation;
        status.ready_state = self.last_state.as_ref().map(|s| s.ready_state);
        status.network_state = self.last_state.as_ref().map(|s| s.network_state);
        status.recovery_attempts = self.metrics.lock().unwrap().attempts_total();
        status.last_issue = self.last_issue.clone();
        self.deps.actions.emit_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test::TestPage;
    use crate::egress::HlsStream;
    use crate::mux::{HlsSegmenter, SegmenterConfig};
    use crate::status::ClientCounts;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingActions {
        replacements: AtomicUsize,
        breaks: AtomicUsize,
        statuses: Mutex<Vec<StreamStatus>>,
        replacement_page: Mutex<Option<Arc<TestPage>>>,
    }

    impl Default for RecordingActions {
        fn default() -> Self {
            Self {
                replacements: AtomicUsize::new(0),
                breaks: AtomicUsize::new(0),
                statuses: Mutex::new(Vec::new()),
                replacement_page: Mutex::new(Some(Arc::new(TestPage::default()))),
            }
        }
    }

    #[async_trait]
    impl MonitorActions for RecordingActions {
        async fn replace_tab(&self, _stream_id: u64) -> Result<Arc<dyn Page>> {
            self.replacements.fetch_add(1, Ordering::SeqCst);
            match self.replacement_page.lock().unwrap().take() {
                Some(page) => Ok(page),
                None => anyhow::bail!("replacement exhausted"),
            }
        }

        async fn circuit_break(&self, _stream_id: u64, _reason: String) {
            self.breaks.fetch_add(1, Ordering::SeqCst);
        }

        fn base_status(&self, stream_id: u64) -> Option<StreamStatus> {
            Some(StreamStatus {
                id: stream_id,
                id_str: format!("stream-{:06}", stream_id),
                channel_key: None,
                channel_name: None,
                provider: None,
                url: "https://example.com".into(),
                health: StreamHealth::Healthy,
                escalation_level: 0,
                duration_secs: 0,
                memory_bytes: 0,
                ready_state: None,
                network_state: None,
                recovery_attempts: 0,
                last_issue: None,
                show_name: None,
                logo_url: None,
                clients: ClientCounts::default(),
            })
        }

        fn emit_status(&self, status: StreamStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(2),
            stall_threshold: 0.1,
            stall_count_threshold: 2,
            buffering_grace: Duration::from_secs(10),
            sustained_playback_required: Duration::from_secs(60),
            max_page_reloads: 3,
            page_reload_window: Duration::from_secs(300),
            breaker_window: Duration::from_secs(180),
            breaker_threshold: 3,
        }
    }

    fn deps(
        page: Arc<TestPage>,
        actions: Arc<RecordingActions>,
    ) -> (MonitorDeps, Arc<Mutex<HlsSegmenter>>) {
        let store = Arc::new(HlsStream::new());
        let segmenter = Arc::new(Mutex::new(HlsSegmenter::new(
            SegmenterConfig {
                stream_id: 1,
                segment_duration: 3.0,
                max_segments: 6,
            },
            store,
            None,
        )));
        let deps = MonitorDeps {
            stream_id: 1,
            id_str: "stream-000001".into(),
            url: "https://example.com/live".into(),
            page: Arc::new(RwLock::new(page as Arc<dyn Page>)),
            segmenter: segmenter.clone(),
            profile: Arc::new(SiteProfile {
                name: "generic".into(),
                ..Default::default()
            }),
            overrides: TuneOverrides::default(),
            cancel: CancellationToken::new(),
            config: config(),
            actions,
        };
        (deps, segmenter)
    }

    async fn ticks(n: u32, interval: Duration) {
        for _ in 0..n {
            tokio::time::advance(interval).await;
            // let the tick body run
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_playback_keeps_level_zero() {
        let page = Arc::new(TestPage::default());
        let actions = Arc::new(RecordingActions::default());
        let (deps, _) = deps(page, actions.clone());
        let handle = spawn_monitor(deps);

        ticks(3, Duration::from_secs(2)).await;
        let metrics = handle.stop().await;
        assert_eq!(metrics.attempts_total(), 0);

        let statuses = actions.statuses.lock().unwrap();
        assert!(!statuses.is_empty());
        assert!(statuses
            .iter()
            .all(|s| s.health == StreamHealth::Healthy && s.escalation_level == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_video_gets_play_unmute_first() {
        let page = Arc::new(TestPage::default());
        page.set_probe_override(Some(json!({
            "currentTime": 10.0, "paused": true, "ended": false,
            "error": null, "readyState": 4, "networkState": 1,
            "muted": false, "volume": 1.0
        })));
        let actions = Arc::new(RecordingActions::default());
        let (deps, _) = deps(page.clone(), actions.clone());
        let handle = spawn_monitor(deps);

        // pause_count must exceed the threshold (2) before recovery fires
        ticks(5, Duration::from_secs(2)).await;
        let metrics = handle.stop().await;
        assert_eq!(
            metrics.attempts.get(&RecoveryMethod::PlayUnmute).copied(),
            Some(1)
        );
        assert!(page
            .evaluations()
            .iter()
            .any(|s| s.contains("v.play()")));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_video_reloads_source_then_navigates() {
        let page = Arc::new(TestPage::default());
        page.set_probe_override(Some(json!({
            "currentTime": 33.0, "paused": false, "ended": false,
            "error": null, "readyState": 4, "networkState": 1,
            "muted": false, "volume": 1.0
        })));
        let actions = Arc::new(RecordingActions::default());
        let (deps, _) = deps(page.clone(), actions.clone());
        let handle = spawn_monitor(deps);

        // enough ticks for the stall counter, L2, grace expiry, then L3
        ticks(16, Duration::from_secs(2)).await;
        let metrics = handle.stop().await;
        assert_eq!(
            metrics.attempts.get(&RecoveryMethod::SourceReload).copied(),
            Some(1)
        );
        assert!(metrics
            .attempts
            .get(&RecoveryMethod::PageNavigation)
            .copied()
            .unwrap_or(0)
            >= 1);
        assert!(!page.navigations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_tab_is_replaced() {
        let page = Arc::new(TestPage::default());
        page.set_eval_failure(Some(|| EvalError::Timeout));
        let actions = Arc::new(RecordingActions::default());
        let (deps, _) = deps(page, actions.clone());
        let handle = spawn_monitor(deps);

        ticks(4, Duration::from_secs(2)).await;
        assert_eq!(actions.replacements.load(Ordering::SeqCst), 1);
        let metrics = handle.stop().await;
        assert_eq!(
            metrics.attempts.get(&RecoveryMethod::TabReplace).copied(),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_trip_the_breaker() {
        let page = Arc::new(TestPage::default());
        // player claims readiness but stays in a persistent media error, so
        // every recovery attempt completes quickly and changes nothing
        page.set_probe_override(Some(json!({
            "currentTime": 1.0, "paused": false, "ended": true,
            "error": "code 3", "readyState": 4, "networkState": 1,
            "muted": false, "volume": 1.0
        })));
        let actions = Arc::new(RecordingActions::default());
        let (deps, _) = deps(page, actions.clone());
        let handle = spawn_monitor(deps);

        // each tick past its grace period attempts the next recovery; three
        // attempts land inside the breaker window
        ticks(40, Duration::from_secs(2)).await;
        handle.stop().await;
        assert!(actions.breaks.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn breaker_window_resets() {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async {
                tokio::time::pause();
                let mut breaker = CircuitBreaker::new(Duration::from_secs(10), 3);
                assert!(!breaker.record_failure());
                assert!(!breaker.record_failure());
                tokio::time::advance(Duration::from_secs(11)).await;
                // window expired: the count starts over
                assert!(!breaker.record_failure());
                assert!(!breaker.record_failure());
                assert!(breaker.record_failure());
            });
    }

    #[test]
    fn metrics_summary_reads_well() {
        let mut metrics = RecoveryMetrics::default();
        assert_eq!(metrics.to_string(), "no recoveries");
        metrics.record_attempt(RecoveryMethod::SourceReload);
        metrics.finish(true);
        let text = metrics.to_string();
        assert!(text.contains("source reload 1x (1 ok)"));
    }
}
