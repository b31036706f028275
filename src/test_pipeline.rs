//! End-to-end pipeline tests against the synthetic browser: cold start,
//! playlist semantics, tab replacement handoff, capacity reclamation and
//! handler behavior, all on virtual time.

use crate::browser::Browser;
use crate::capture::setup::{self, StartError, StartRequest};
use crate::capture::test::TestBrowser;
use crate::channels::StaticChannelDirectory;
use crate::http::hls::ensure_channel_stream;
use crate::http::HttpError;
use crate::profile::{ProfileRegistry, TuneOverrides};
use crate::settings::Settings;
use crate::stream_manager::StreamManager;
use std::sync::Arc;
use std::time::Duration;

fn settings(json: &str) -> Settings {
    serde_json::from_str(json).unwrap()
}

fn manager_with(settings: Settings) -> (StreamManager, Arc<TestBrowser>) {
    let browser = Arc::new(TestBrowser::default());
    let channels = Arc::new(StaticChannelDirectory::new(&settings.channels));
    let manager = StreamManager::new(
        settings,
        browser.clone() as Arc<dyn Browser>,
        channels,
        ProfileRegistry::default(),
    );
    (manager, browser)
}

fn default_manager() -> (StreamManager, Arc<TestBrowser>) {
    manager_with(settings(
        r#"{
            "channels": [
                {"key": "news", "url": "https://example.com/news"},
                {"key": "sports", "url": "https://example.com/sports"},
                {"key": "off", "url": "https://example.com/off", "enabled": false}
            ]
        }"#,
    ))
}

async fn advance(duration: Duration) {
    // step in small increments so interleaved timers all get to run
    let mut remaining = duration;
    let step = Duration::from_millis(500);
    while remaining > Duration::ZERO {
        let d = step.min(remaining);
        tokio::time::advance(d).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        remaining -= d;
    }
}

fn start_request(url: &str) -> StartRequest {
    StartRequest {
        channel: None,
        url: url.to_string(),
        profile_override: None,
        overrides: TuneOverrides::default(),
        client_address: "10.0.0.1".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn cold_start_produces_ordered_segments() {
    let (manager, browser) = default_manager();
    let id = setup::start_stream(&manager, start_request("https://example.com/live"))
        .await
        .unwrap();
    let entry = manager.stream(id).unwrap();

    // ~11 synthetic fragments at 3 s cadence
    advance(Duration::from_secs(34)).await;

    assert!(entry.hls.init_segment().is_some());
    let names: Vec<String> = entry
        .hls
        .segments_snapshot()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert!(!names.is_empty());
    // in-order, contiguous numbering within the window
    let first: u64 = names[0]
        .trim_start_matches("segment")
        .trim_end_matches(".m4s")
        .parse()
        .unwrap();
    for (i, name) in names.iter().enumerate() {
        assert_eq!(*name, format!("segment{}.m4s", first + i as u64));
    }

    let playlist = entry.hls.playlist().unwrap();
    assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:7\n"));
    assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4?v=1\""));
    for line in playlist.lines().filter(|l| l.starts_with("#EXTINF")) {
        assert_eq!(line, "#EXTINF:3.000,");
    }
    assert_eq!(browser.captures_started(), 1);
}

#[tokio::test(start_paused = true)]
async fn playlist_parses_and_window_slides() {
    let (manager, _) = default_manager();
    let id = setup::start_stream(&manager, start_request("https://example.com/live"))
        .await
        .unwrap();
    let entry = manager.stream(id).unwrap();

    // enough fragments that the 6-segment window has slid
    advance(Duration::from_secs(40)).await;

    let playlist = entry.hls.playlist().unwrap();
    let (_, parsed) = m3u8_rs::parse_media_playlist(playlist.as_bytes()).unwrap();
    assert_eq!(parsed.version, Some(7));
    assert!(parsed.target_duration >= 3);

    let media: Vec<&m3u8_rs::MediaSegment> = parsed.segments.iter().collect();
    assert!(!media.is_empty() && media.len() <= 6);
    for segment in &media {
        assert!(segment.duration >= 0.1);
    }
    let produced = entry.segmenter.lock().unwrap().segment_index();
    assert_eq!(parsed.media_sequence, produced - media.len() as u64);

    // entries that slid out of the window are also gone from the store
    let oldest_gone = format!("segment{}.m4s", parsed.media_sequence.saturating_sub(1));
    if parsed.media_sequence > 0 {
        assert!(entry.hls.segment(&oldest_gone).is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn tab_replacement_continues_numbering_without_discontinuity() {
    let (manager, browser) = default_manager();
    let id = setup::start_stream(&manager, start_request("https://example.com/live"))
        .await
        .unwrap();
    let entry = manager.stream(id).unwrap();

    advance(Duration::from_secs(13)).await;
    let before = entry.segmenter.lock().unwrap().segment_index();
    assert!(before >= 2);

    setup::replace_tab(&manager, id).await.unwrap();
    assert_eq!(browser.captures_started(), 2);
    // numbering picks up where the predecessor stopped
    assert_eq!(entry.segmenter.lock().unwrap().segment_index(), before);

    advance(Duration::from_secs(13)).await;
    let after = entry.segmenter.lock().unwrap().segment_index();
    assert!(after > before, "successor produced segments");

    // identical decoder parameters: the pending discontinuity is suppressed
    let playlist = entry.hls.playlist().unwrap();
    assert!(!playlist.contains("#EXT-X-DISCONTINUITY"));
    assert!(playlist.contains("init.mp4?v=1"));
    assert_eq!(
        entry.segmenter.lock().unwrap().session_stats().tab_replacements,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_cold_start() {
    let (manager, browser) = default_manager();

    let m1 = manager.clone();
    let m2 = manager.clone();
    let a = tokio::spawn(async move { ensure_channel_stream(&m1, "news", "10.0.0.1").await });
    let b = tokio::spawn(async move { ensure_channel_stream(&m2, "news", "10.0.0.2").await });
    advance(Duration::from_secs(8)).await;

    let id_a = a.await.unwrap().unwrap();
    let id_b = b.await.unwrap().unwrap();
    assert_eq!(id_a, id_b);
    assert_eq!(browser.captures_started(), 1);
    assert_eq!(manager.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_and_disabled_channels_are_404() {
    let (manager, _) = default_manager();
    assert!(matches!(
        ensure_channel_stream(&manager, "nope", "10.0.0.1").await,
        Err(HttpError::NotFound(_))
    ));
    assert!(matches!(
        ensure_channel_stream(&manager, "off", "10.0.0.1").await,
        Err(HttpError::NotFound(_))
    ));
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn login_mode_rejects_with_503() {
    let settings = settings(
        r#"{"channels": [{"key": "news", "url": "https://example.com/news"}]}"#,
    );
    let browser = Arc::new(TestBrowser::default());
    let channels = Arc::new(StaticChannelDirectory::new(&settings.channels));
    channels.set_login_active(true);
    let manager = StreamManager::new(
        settings,
        browser as Arc<dyn Browser>,
        channels,
        ProfileRegistry::default(),
    );

    assert!(matches!(
        ensure_channel_stream(&manager, "news", "10.0.0.1").await,
        Err(HttpError::NotReady { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn idle_stream_is_reclaimed_for_new_request() {
    let (manager, _) = manager_with(settings(
        r#"{
            "streaming": {"max_concurrent_streams": 2},
            "hls": {"idle_timeout": 60},
            "channels": []
        }"#,
    ));

    let a = setup::start_stream(&manager, start_request("https://example.com/a"))
        .await
        .unwrap();
    let b = setup::start_stream(&manager, start_request("https://example.com/b"))
        .await
        .unwrap();

    // A idles past the timeout, B stays warm
    advance(Duration::from_secs(70)).await;
    manager.stream(b).unwrap().touch();

    let c = setup::start_stream(&manager, start_request("https://example.com/c"))
        .await
        .unwrap();
    assert!(manager.stream(a).is_none(), "idle stream was reclaimed");
    assert!(manager.stream(b).is_some());
    assert!(manager.stream(c).is_some());
    assert_eq!(manager.active_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn capacity_without_idle_stream_is_rejected() {
    let (manager, _) = manager_with(settings(
        r#"{
            "streaming": {"max_concurrent_streams": 1},
            "channels": []
        }"#,
    ));

    let a = setup::start_stream(&manager, start_request("https://example.com/a"))
        .await
        .unwrap();
    manager.stream(a).unwrap().touch();

    let denied = setup::start_stream(&manager, start_request("https://example.com/b")).await;
    assert!(matches!(denied, Err(StartError::AtCapacity)));
}

#[tokio::test(start_paused = true)]
async fn ts_client_counter_cleans_up_on_remuxer_failure() {
    // an unspawnable remuxer exercises the exactly-once cleanup path
    let (manager, _) = manager_with(settings(
        r#"{
            "ffmpeg_path": "/nonexistent/ffmpeg",
            "channels": [{"key": "news", "url": "https://example.com/news"}]
        }"#,
    ));

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let feeder = tokio::spawn(crate::http::ts::feed_client_for_test(
        manager.clone(),
        "news".to_string(),
        "10.0.0.7".to_string(),
        tx,
    ));
    advance(Duration::from_secs(10)).await;
    let _ = feeder.await;

    let entry = manager.stream_by_channel("news").unwrap();
    assert_eq!(
        entry
            .mpegts_clients
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(manager.clients().counts(entry.id).mpegts, 0);
    assert!(rx.recv().await.is_none(), "body closed silently");
}

#[tokio::test(start_paused = true)]
async fn delete_endpoint_semantics() {
    use axum::extract::{Path, State};

    let (manager, _) = default_manager();
    let id = setup::start_stream(&manager, start_request("https://example.com/live"))
        .await
        .unwrap();

    let ok = crate::http::api::terminate(State(manager.clone()), Path(id)).await;
    assert!(ok.is_ok());
    let missing = crate::http::api::terminate(State(manager.clone()), Path(id)).await;
    assert!(matches!(missing, Err(HttpError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn play_redirect_registers_synthetic_channel() {
    use axum::extract::{Query, State};

    let (manager, _) = default_manager();
    let query = crate::http::hls::PlayQuery {
        url: "https://example.com/adhoc".to_string(),
        profile: None,
        selector: None,
        click_to_play: Some(true),
        click_selector: None,
        no_video: None,
    };
    let response = crate::http::hls::play(State(manager.clone()), Query(query))
        .await
        .unwrap();
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let key = crate::synthetic_channel_key("https://example.com/adhoc");
    assert_eq!(location, format!("/hls/{}/stream.m3u8", key));

    let def = manager.channels().get(&key).unwrap();
    assert_eq!(def.click_to_play, Some(true));
}

#[tokio::test(start_paused = true)]
async fn termination_event_is_single_and_final() {
    let (manager, _) = default_manager();
    let id = setup::start_stream(&manager, start_request("https://example.com/live"))
        .await
        .unwrap();
    let entry = manager.stream(id).unwrap();

    advance(Duration::from_secs(7)).await;
    let mut events = entry.hls.subscribe();
    manager.terminate_stream(id, "test").await;
    manager.terminate_stream(id, "test").await;

    let mut terminated = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, crate::egress::StreamEvent::Terminated) {
            terminated += 1;
        }
    }
    assert_eq!(terminated, 1);
    assert!(manager.stream(id).is_none());
}
