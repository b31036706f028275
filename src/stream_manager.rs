use crate::browser::{Browser, Capture, Page};
use crate::capture::CaptureQueue;
use crate::channels::ChannelDirectory;
use crate::egress::HlsStream;
use crate::monitor::{MonitorActions, MonitorHandle};
use crate::mux::HlsSegmenter;
use crate::profile::{ProfileRegistry, SiteProfile, TuneOverrides};
use crate::remux::Remuxer;
use crate::settings::Settings;
use crate::status::{ClientRegistry, StatusEmitter, StreamHealth, StreamStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the reaper scans for idle streams.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// State of a channel in the channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSlot {
    /// Cold start in flight; consumers keep waiting.
    Starting,
    Active(u64),
}

/// One live channel session and everything it owns.
pub struct StreamEntry {
    pub id: u64,
    pub id_str: String,
    pub channel_key: Option<String>,
    pub channel_name: Option<String>,
    pub provider_name: Option<String>,
    pub client_address: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    start_time: Instant,
    last_access: Mutex<Instant>,

    pub page: Arc<RwLock<Arc<dyn Page>>>,
    pub capture: tokio::sync::Mutex<Option<Box<dyn Capture>>>,
    pub transcoder: tokio::sync::Mutex<Option<Remuxer>>,
    pub segmenter: Arc<Mutex<HlsSegmenter>>,
    pub hls: Arc<HlsStream>,
    pub mpegts_clients: AtomicUsize,
    pub profile: Arc<SiteProfile>,
    pub overrides: TuneOverrides,

    /// Stream-wide cancellation; fired on termination so in-flight page
    /// evaluations fail fast.
    pub cancel: CancellationToken,
    /// Cancels the byte-feed task of the current capture generation only
    pub feed_cancel: Mutex<CancellationToken>,
    pub monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
    terminating: AtomicBool,
}

impl StreamEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        channel_key: Option<String>,
        channel_name: Option<String>,
        provider_name: Option<String>,
        client_address: String,
        url: String,
        page: Arc<dyn Page>,
        segmenter: Arc<Mutex<HlsSegmenter>>,
        hls: Arc<HlsStream>,
        profile: Arc<SiteProfile>,
        overrides: TuneOverrides,
    ) -> Self {
        Self {
            id,
            id_str: stream_id_str(),
            channel_key,
            channel_name,
            provider_name,
            client_address,
            url,
            started_at: Utc::now(),
            start_time: Instant::now(),
            last_access: Mutex::new(Instant::now()),
            page: Arc::new(RwLock::new(page)),
            capture: tokio::sync::Mutex::new(None),
            transcoder: tokio::sync::Mutex::new(None),
            segmenter,
            hls,
            mpegts_clients: AtomicUsize::new(0),
            profile,
            overrides,
            cancel: CancellationToken::new(),
            feed_cancel: Mutex::new(CancellationToken::new()),
            monitor: tokio::sync::Mutex::new(None),
            terminating: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Swap in a fresh feed-generation token, cancelling the old one.
    pub fn next_feed_generation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let old = {
            let mut guard = self.feed_cancel.lock().unwrap();
            std::mem::replace(&mut *guard, token.clone())
        };
        old.cancel();
        token
    }
}

fn stream_id_str() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("stream-{}", suffix)
}

struct ManagerInner {
    settings: Settings,
    browser: Arc<dyn Browser>,
    profiles: ProfileRegistry,
    channels: Arc<dyn ChannelDirectory>,
    status: StatusEmitter,
    clients: ClientRegistry,
    capture_queue: CaptureQueue,

    streams: RwLock<HashMap<u64, Arc<StreamEntry>>>,
    channel_index: Mutex<HashMap<String, ChannelSlot>>,
    next_id: AtomicU64,
}

/// Central registry of live streams. The single authority for termination;
/// everything else holds handles.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(
        settings: Settings,
        browser: Arc<dyn Browser>,
        channels: Arc<dyn ChannelDirectory>,
        profiles: ProfileRegistry,
    ) -> Self {
        let status = StatusEmitter::new(settings.streaming.max_concurrent_streams);
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                browser,
                profiles,
                channels,
                status,
                clients: ClientRegistry::default(),
                capture_queue: CaptureQueue::new(),
                streams: RwLock::new(HashMap::new()),
                channel_index: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn browser(&self) -> &Arc<dyn Browser> {
        &self.inner.browser
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    pub fn channels(&self) -> &Arc<dyn ChannelDirectory> {
        &self.inner.channels
    }

    pub fn status(&self) -> &StatusEmitter {
        &self.inner.status
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.inner.clients
    }

    pub fn capture_queue(&self) -> &CaptureQueue {
        &self.inner.capture_queue
    }

    pub fn allocate_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn stream(&self, id: u64) -> Option<Arc<StreamEntry>> {
        self.inner.streams.read().unwrap().get(&id).cloned()
    }

    pub fn streams(&self) -> Vec<Arc<StreamEntry>> {
        self.inner.streams.read().unwrap().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.streams.read().unwrap().len()
    }

    pub fn channel_slot(&self, key: &str) -> Option<ChannelSlot> {
        self.inner.channel_index.lock().unwrap().get(key).copied()
    }

    pub fn stream_by_channel(&self, key: &str) -> Option<Arc<StreamEntry>> {
        match self.channel_slot(key)? {
            ChannelSlot::Active(id) => self.stream(id),
            ChannelSlot::Starting => None,
        }
    }

    /// Claim the channel for a cold start. Returns false when another start
    /// or an active stream already holds it.
    pub fn begin_channel_start(&self, key: &str) -> bool {
        let mut index = self.inner.channel_index.lock().unwrap();
        if index.contains_key(key) {
            return false;
        }
        index.insert(key.to_string(), ChannelSlot::Starting);
        true
    }

    pub fn finish_channel_start(&self, key: &str, id: u64) {
        self.inner
            .channel_index
            .lock()
            .unwrap()
            .insert(key.to_string(), ChannelSlot::Active(id));
    }

    /// Roll a failed cold start back: absent → STARTING → absent.
    pub fn abort_channel_start(&self, key: &str) {
        let mut index = self.inner.channel_index.lock().unwrap();
        if index.get(key) == Some(&ChannelSlot::Starting) {
            index.remove(key);
        }
    }

    pub fn insert_entry(&self, entry: Arc<StreamEntry>) {
        let id = entry.id;
        self.inner.streams.write().unwrap().insert(id, entry.clone());
        if let Some(key) = &entry.channel_key {
            self.finish_channel_start(key, id);
        }
        self.inner.status.stream_added(self.build_status(&entry));
        self.refresh_system_status();
    }

    pub fn refresh_system_status(&self) {
        self.inner.status.refresh_system_status(
            self.inner.browser.is_connected(),
            self.inner.browser.page_count(),
        );
    }

    /// Bytes retained across all streams.
    pub fn memory_total(&self) -> usize {
        self.streams().iter().map(|s| s.hls.memory_bytes()).sum()
    }

    fn build_status(&self, entry: &StreamEntry) -> StreamStatus {
        // keep fields the poller owns (show name, logo) across rebuilds
        let previous = self.inner.status.stream_status(entry.id);
        StreamStatus {
            id: entry.id,
            id_str: entry.id_str.clone(),
            channel_key: entry.channel_key.clone(),
            channel_name: entry.channel_name.clone(),
            provider: entry.provider_name.clone(),
            url: entry.url.clone(),
            health: StreamHealth::Healthy,
            escalation_level: 0,
            duration_secs: entry.uptime().as_secs(),
            memory_bytes: entry.hls.memory_bytes(),
            ready_state: None,
            network_state: None,
            recovery_attempts: 0,
            last_issue: None,
            show_name: previous.as_ref().and_then(|p| p.show_name.clone()),
            logo_url: previous.and_then(|p| p.logo_url),
            clients: self.inner.clients.counts(entry.id),
        }
    }

    /// The one authoritative termination path. Releases resources in a fixed
    /// order and is idempotent: the second call is a no-op.
    pub async fn terminate_stream(&self, id: u64, reason: &str) {
        let Some(entry) = self.stream(id) else {
            return;
        };
        if entry.terminating.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(stream = %entry.id_str, "terminating: {}", reason);

        // fail any in-flight page evaluations fast
        entry.cancel.cancel();
        entry.feed_cancel.lock().unwrap().cancel();

        // the capture must die before the transcoder or the page, otherwise
        // the browser's capture slot leaks and the next capture is rejected
        if let Some(mut capture) = entry.capture.lock().await.take() {
            capture.destroy().await;
        }

        if let Some(mut transcoder) = entry.transcoder.lock().await.take() {
            transcoder.kill().await;
        }

        let metrics = match entry.monitor.lock().await.take() {
            Some(handle) => handle.stop().await,
            None => Default::default(),
        };

        {
            let mut index = self.inner.channel_index.lock().unwrap();
            if let Some(key) = &entry.channel_key {
                // only drop the mapping if it still points at us
                if index.get(key) == Some(&ChannelSlot::Active(id)) {
                    index.remove(key);
                }
            }
        }

        // fire and forget; a wedged tab must not block shutdown
        let page = entry.page.read().unwrap().clone();
        tokio::spawn(async move { page.close().await });

        entry.hls.terminate();
        self.inner.streams.write().unwrap().remove(&id);
        self.inner.clients.clear_stream(id);
        self.inner.status.stream_removed(id);
        self.refresh_system_status();

        info!(
            stream = %entry.id_str,
            "stream ended after {:.0}s ({}): {}",
            entry.uptime().as_secs_f32(),
            metrics,
            reason,
        );
    }

    /// Terminate one reclaimable stream (no TS clients, idle past the
    /// configured timeout), preferring the least recently used.
    pub async fn reclaim_one_idle(&self, reason: &str) -> bool {
        let idle_timeout = self.inner.settings.idle_timeout();
        let candidate = self
            .streams()
            .into_iter()
            .filter(|s| s.mpegts_clients.load(Ordering::SeqCst) == 0)
            .filter(|s| s.idle_for() >= idle_timeout)
            .sorted_by_key(|s| std::cmp::Reverse(s.idle_for()))
            .next();
        match candidate {
            Some(entry) => {
                self.terminate_stream(entry.id, reason).await;
                true
            }
            None => false,
        }
    }

    /// Periodic idle reclamation plus system status refresh.
    pub fn spawn_idle_reaper(&self, token: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        manager.reap_idle().await;
                        manager.refresh_system_status();
                    }
                }
            }
            debug!("idle reaper stopped");
        })
    }

    async fn reap_idle(&self) {
        let idle_timeout = self.inner.settings.idle_timeout();
        let idle: Vec<_> = self
            .streams()
            .into_iter()
            .filter(|s| s.mpegts_clients.load(Ordering::SeqCst) == 0)
            .filter(|s| s.idle_for() >= idle_timeout)
            .collect();
        for entry in idle {
            warn!(stream = %entry.id_str, "no client activity for {:?}", idle_timeout);
            self.terminate_stream(entry.id, "idle timeout").await;
        }
    }

    /// Terminate everything; used on shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        for entry in self.streams() {
            self.terminate_stream(entry.id, reason).await;
        }
    }
}

#[async_trait]
impl MonitorActions for StreamManager {
    async fn replace_tab(&self, stream_id: u64) -> Result<Arc<dyn Page>> {
        crate::capture::setup::replace_tab(self, stream_id).await
    }

    async fn circuit_break(&self, stream_id: u64, reason: String) {
        self.terminate_stream(stream_id, &reason).await;
    }

    fn base_status(&self, stream_id: u64) -> Option<StreamStatus> {
        let entry = self.stream(stream_id)?;
        Some(self.build_status(&entry))
    }

    fn emit_status(&self, status: StreamStatus) {
        self.inner.status.stream_health_changed(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test::TestBrowser;
    use crate::channels::StaticChannelDirectory;
    use crate::egress::StreamEvent;
    use crate::mux::SegmenterConfig;
    use crate::status::ClientType;

    fn manager() -> StreamManager {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        let browser: Arc<dyn Browser> = Arc::new(TestBrowser::default());
        let channels = Arc::new(StaticChannelDirectory::new(&[]));
        StreamManager::new(settings, browser, channels, ProfileRegistry::default())
    }

    async fn entry_for(manager: &StreamManager, channel: Option<&str>) -> Arc<StreamEntry> {
        let id = manager.allocate_id();
        let page = manager.browser().new_page().await.unwrap();
        let hls = Arc::new(HlsStream::new());
        let segmenter = Arc::new(Mutex::new(HlsSegmenter::new(
            SegmenterConfig {
                stream_id: id,
                segment_duration: 3.0,
                max_segments: 6,
            },
            hls.clone(),
            None,
        )));
        let entry = Arc::new(StreamEntry::new(
            id,
            channel.map(|c| c.to_string()),
            None,
            None,
            "10.0.0.1".into(),
            "https://example.com/live".into(),
            page,
            segmenter,
            hls,
            manager.profiles().generic(),
            TuneOverrides::default(),
        ));
        if let Some(key) = channel {
            assert!(manager.begin_channel_start(key));
        }
        manager.insert_entry(entry.clone());
        entry
    }

    #[tokio::test]
    async fn channel_index_transitions() {
        let m = manager();
        assert!(m.begin_channel_start("news"));
        assert!(!m.begin_channel_start("news"));
        assert_eq!(m.channel_slot("news"), Some(ChannelSlot::Starting));

        // failed cold start rolls back to absent
        m.abort_channel_start("news");
        assert_eq!(m.channel_slot("news"), None);

        assert!(m.begin_channel_start("news"));
        m.finish_channel_start("news", 7);
        assert_eq!(m.channel_slot("news"), Some(ChannelSlot::Active(7)));
        // abort after activation must not clobber the live mapping
        m.abort_channel_start("news");
        assert_eq!(m.channel_slot("news"), Some(ChannelSlot::Active(7)));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_ordered() {
        let m = manager();
        let entry = entry_for(&m, Some("news")).await;
        let id = entry.id;
        let mut events = entry.hls.subscribe();

        m.terminate_stream(id, "test").await;
        m.terminate_stream(id, "test again").await;

        assert!(m.stream(id).is_none());
        assert_eq!(m.channel_slot("news"), None);
        assert!(entry.cancel.is_cancelled());
        // exactly one terminated event despite two calls
        assert!(matches!(events.recv().await, Ok(StreamEvent::Terminated)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_keeps_index_of_successor() {
        let m = manager();
        let entry = entry_for(&m, Some("news")).await;
        // the channel key was re-claimed by a newer stream meanwhile
        m.finish_channel_start("news", 999);
        m.terminate_stream(entry.id, "test").await;
        assert_eq!(m.channel_slot("news"), Some(ChannelSlot::Active(999)));
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_prefers_lru_and_spares_ts_clients() {
        let m = manager();
        let a = entry_for(&m, Some("a")).await;
        let b = entry_for(&m, Some("b")).await;
        let c = entry_for(&m, Some("c")).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        b.touch();
        // c has a TS client and must never be reclaimed
        c.mpegts_clients.store(1, Ordering::SeqCst);

        assert!(m.reclaim_one_idle("reclaimed for new stream").await);
        assert!(m.stream(a.id).is_none(), "oldest idle stream reclaimed");
        assert!(m.stream(b.id).is_some());
        assert!(m.stream(c.id).is_some());

        // b is fresh, c is protected: nothing further to reclaim
        assert!(!m.reclaim_one_idle("reclaimed for new stream").await);
    }

    #[tokio::test]
    async fn client_counts_feed_status() {
        let m = manager();
        let entry = entry_for(&m, None).await;
        m.clients().register(entry.id, "10.0.0.9", ClientType::Hls);
        let status = m.base_status(entry.id).unwrap();
        assert_eq!(status.clients.hls, 1);
        assert_eq!(status.clients.total, 1);
    }
}
