use crate::egress::StreamEvent;
use crate::http::hls::ensure_channel_stream;
use crate::http::{client_address, HttpError};
use crate::remux::{Remuxer, RemuxJob};
use crate::status::ClientType;
use crate::stream_manager::{StreamEntry, StreamManager};
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// `GET /stream/{channel}`: continuous MPEG-TS.
///
/// Validation failures still produce real status codes; once the stream
/// body is handed to the client, errors can only close the connection.
pub async fn stream(
    State(manager): State<StreamManager>,
    Path(channel): Path<String>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let def = manager
        .channels()
        .get(&channel)
        .ok_or(HttpError::NotFound("unknown channel"))?;
    if !def.enabled {
        return Err(HttpError::NotFound("channel disabled"));
    }
    if manager.channels().login_active() {
        return Err(HttpError::not_ready("provider login in progress"));
    }

    let address = client_address(&headers, Some(&connect_info));
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    // headers flush as soon as this response is returned; the cold start of
    // the underlying stream continues in the background
    tokio::spawn(feed_client(manager, channel, address, tx));

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok((
        [
            ("Content-Type", "video/mpeg"),
            ("Cache-Control", "no-cache"),
            ("Connection", "close"),
            ("transferMode.dlna.org", "Streaming"),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
pub(crate) use feed_client as feed_client_for_test;

pub(crate) async fn feed_client(
    manager: StreamManager,
    channel: String,
    address: String,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    // ensure a stream exists, or wait for the startup already in progress;
    // past this point failures close the connection silently
    let id = match ensure_channel_stream(&manager, &channel, &address).await {
        Ok(id) => id,
        Err(e) => {
            debug!(%channel, "mpeg-ts client gave up: {:?}", e);
            return;
        }
    };
    let Some(entry) = manager.stream(id) else {
        return;
    };

    entry.mpegts_clients.fetch_add(1, Ordering::SeqCst);
    manager.clients().register(id, &address, ClientType::MpegTs);
    entry.touch();

    if let Err(e) = run_session(&manager, &entry, &tx).await {
        debug!(stream = %entry.id_str, "mpeg-ts session ended: {:#}", e);
    }

    // exactly-once cleanup for this connection
    if entry.mpegts_clients.fetch_sub(1, Ordering::SeqCst) == 1 {
        // the last TS client leaving starts the idle clock
        entry.touch();
    }
    manager.clients().unregister(id, &address, ClientType::MpegTs);
}

async fn run_session(
    manager: &StreamManager,
    entry: &Arc<StreamEntry>,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<()> {
    let init = entry
        .hls
        .wait_init(manager.settings().navigation_timeout())
        .await
        .context("init segment never arrived")?;

    let mut remuxer = Remuxer::spawn(&manager.settings().ffmpeg_path, RemuxJob::CopyToMpegTs)
        .context("spawning remuxer")?;
    let mut stdin = remuxer.take_stdin();
    let mut stdout = remuxer.take_stdout();

    let out_tx = tx.clone();
    let output = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx
                        .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // subscribe before replaying so no segment falls between snapshot and
    // live events; the seen-set drops the overlap
    let mut events = entry.hls.subscribe();
    let mut seen: HashSet<String> = HashSet::new();

    let result = async {
        stdin.write_all(&init).await.context("writing init")?;
        for (name, data) in entry.hls.segments_snapshot() {
            stdin
                .write_all(&data)
                .await
                .with_context(|| format!("replaying {}", name))?;
            seen.insert(name);
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = entry.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(StreamEvent::Init { data }) => {
                        // decoder parameters changed (tab replacement)
                        stdin.write_all(&data).await.context("writing new init")?;
                    }
                    Ok(StreamEvent::Segment { name, data }) => {
                        if seen.insert(name) {
                            stdin.write_all(&data).await.context("writing segment")?;
                            entry.touch();
                        }
                    }
                    Ok(StreamEvent::Terminated) => break,
                    Err(RecvError::Lagged(n)) => {
                        warn!(stream = %entry.id_str, "mpeg-ts consumer lagged {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        Ok(())
    }
    .await;

    drop(stdin);
    remuxer.kill().await;
    output.abort();
    result
}
