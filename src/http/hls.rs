use crate::capture::setup::{self, StartError, StartRequest};
use crate::channels::ChannelDef;
use crate::http::{client_address, HttpError};
use crate::profile::TuneOverrides;
use crate::status::ClientType;
use crate::stream_manager::{ChannelSlot, StreamManager};
use crate::synthetic_channel_key;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const STARTING_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn map_start_error(e: StartError) -> HttpError {
    match e {
        StartError::InvalidUrl(m) => HttpError::BadRequest(m),
        StartError::AtCapacity => HttpError::NotReady {
            message: "all tuners in use",
            tuners_exhausted: true,
        },
        StartError::Capture(_) => HttpError::not_ready("capture unavailable"),
        StartError::Setup(m) => HttpError::Internal(m),
    }
}

fn overrides_for(def: &ChannelDef) -> TuneOverrides {
    TuneOverrides {
        channel_selector: def.channel_selector.clone(),
        click_to_play: def.click_to_play,
        click_selector: def.click_selector.clone(),
        no_video: def.no_video,
    }
}

/// Resolve a channel to a live stream id, cold-starting one if needed.
///
/// Exactly one caller wins the cold start; everyone else polls the
/// `Starting` sentinel until a real id appears, the sentinel is rolled back
/// (startup failure), or the navigation timeout elapses.
pub(crate) async fn ensure_channel_stream(
    manager: &StreamManager,
    channel_key: &str,
    client_address: &str,
) -> Result<u64, HttpError> {
    let def = manager
        .channels()
        .get(channel_key)
        .ok_or(HttpError::NotFound("unknown channel"))?;
    if !def.enabled {
        return Err(HttpError::NotFound("channel disabled"));
    }
    if manager.channels().login_active() {
        return Err(HttpError::not_ready("provider login in progress"));
    }

    let deadline = Instant::now() + manager.settings().navigation_timeout();
    let mut saw_starting = false;
    loop {
        match manager.channel_slot(channel_key) {
            Some(ChannelSlot::Active(id)) => {
                if manager.stream(id).is_some() {
                    return Ok(id);
                }
                // termination is racing us; the index entry goes away next
            }
            Some(ChannelSlot::Starting) => saw_starting = true,
            None => {
                if saw_starting {
                    // absent → STARTING → absent: the cold start failed
                    return Err(HttpError::Internal("stream startup failed".into()));
                }
                if manager.begin_channel_start(channel_key) {
                    debug!(channel = channel_key, "cold starting stream");
                    let request = StartRequest {
                        overrides: overrides_for(&def),
                        url: def.url.clone(),
                        profile_override: def.profile.clone(),
                        channel: Some(def.clone()),
                        client_address: client_address.to_string(),
                    };
                    match setup::start_stream(manager, request).await {
                        Ok(id) => return Ok(id),
                        Err(e) => {
                            manager.abort_channel_start(channel_key);
                            return Err(map_start_error(e));
                        }
                    }
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(HttpError::not_ready("stream is starting"));
        }
        tokio::time::sleep(STARTING_POLL_INTERVAL).await;
    }
}

/// `GET /hls/{channel}/stream.m3u8`
pub async fn playlist(
    State(manager): State<StreamManager>,
    Path(channel): Path<String>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let address = client_address(&headers, Some(&connect_info));
    let id = ensure_channel_stream(&manager, &channel, &address).await?;
    let entry = manager
        .stream(id)
        .ok_or_else(|| HttpError::Internal("stream went away".into()))?;
    entry.touch();

    let playlist = match entry.hls.playlist() {
        Some(playlist) => playlist,
        None => entry
            .hls
            .wait_playlist(manager.settings().navigation_timeout())
            .await
            .ok_or(HttpError::not_ready("playlist not ready"))?,
    };

    manager
        .clients()
        .register_unique(id, &address, ClientType::Hls);
    Ok((
        [(CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        playlist,
    )
        .into_response())
}

/// `GET /hls/{channel}/{segment}`: `init.mp4` (any `?v=` query) or a
/// numbered media segment.
pub async fn segment(
    State(manager): State<StreamManager>,
    Path((channel, segment)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let entry = manager
        .stream_by_channel(&channel)
        .ok_or(HttpError::NotFound("no active stream"))?;

    if segment == "init.mp4" {
        let init = entry
            .hls
            .init_segment()
            .ok_or(HttpError::NotFound("init segment not ready"))?;
        entry.touch();
        return Ok((
            [
                (CONTENT_TYPE, "video/mp4"),
                (CACHE_CONTROL, "no-cache"),
            ],
            init,
        )
            .into_response());
    }

    let data = entry
        .hls
        .segment(&segment)
        .ok_or(HttpError::NotFound("segment rotated out or unknown"))?;
    entry.touch();
    Ok(([(CONTENT_TYPE, "video/mp4")], data).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PlayQuery {
    pub url: String,
    pub profile: Option<String>,
    pub selector: Option<String>,
    #[serde(rename = "clickToPlay")]
    pub click_to_play: Option<bool>,
    #[serde(rename = "clickSelector")]
    pub click_selector: Option<String>,
    #[serde(rename = "noVideo")]
    pub no_video: Option<bool>,
}

/// `GET /play?url=...`: register a synthetic channel for the URL and
/// redirect to its playlist. The same URL always lands on the same channel
/// key, so concurrent viewers share one tab.
pub async fn play(
    State(manager): State<StreamManager>,
    Query(query): Query<PlayQuery>,
) -> Result<Response, HttpError> {
    let key = synthetic_channel_key(&query.url);
    manager.channels().register_synthetic(ChannelDef {
        key: key.clone(),
        url: query.url,
        name: None,
        provider: None,
        profile: query.profile,
        enabled: true,
        channel_selector: query.selector,
        click_to_play: query.click_to_play,
        click_selector: query.click_selector,
        no_video: query.no_video.unwrap_or(false),
    });
    Ok(Redirect::temporary(&format!("/hls/{}/stream.m3u8", key)).into_response())
}
