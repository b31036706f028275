//! Show-name and logo polling against PVR clients.
//!
//! DVR frontends watching our MPEG-TS output usually run their own guide
//! API on the same host. Their addresses are already known from the client
//! registry, so each poll round asks one of them what is currently airing
//! on every active channel and attaches the answer to the stream status.
//! Purely cosmetic; streaming never depends on it.

use crate::settings::ShowInfoSettings;
use crate::stream_manager::StreamManager;
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Deserialize)]
struct NowAiring {
    #[serde(alias = "name")]
    title: Option<String>,
    #[serde(alias = "logo", alias = "imageUrl")]
    image_url: Option<String>,
}

pub fn spawn(
    manager: StreamManager,
    settings: ShowInfoSettings,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                debug!("show-info poller disabled: {}", e);
                return;
            }
        };
        let mut timer = tokio::time::interval(Duration::from_secs(settings.poll_interval));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => poll_round(&manager, &client, settings.port).await,
            }
        }
        debug!("show-info poller stopped");
    })
}

async fn poll_round(manager: &StreamManager, client: &reqwest::Client, port: u16) {
    let addresses = manager.clients().addresses();
    if addresses.is_empty() {
        return;
    }

    for entry in manager.streams() {
        let Some(channel) = entry.channel_key.clone() else {
            continue;
        };
        for address in &addresses {
            match fetch_now_airing(client, address, port, &channel).await {
                Some(info) => {
                    trace!(%channel, title = ?info.title, "show info updated");
                    manager
                        .status()
                        .update_show_info(entry.id, info.title, info.image_url);
                    break;
                }
                None => continue,
            }
        }
    }
}

async fn fetch_now_airing(
    client: &reqwest::Client,
    address: &str,
    port: u16,
    channel: &str,
) -> Option<NowAiring> {
    let url = format!("http://{}:{}/api/guide/now", address, port);
    let response = client
        .get(url)
        .query(&[("channel", channel)])
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<NowAiring>().await.ok()
}
