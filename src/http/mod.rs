use crate::stream_manager::StreamManager;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::Router;
use std::net::SocketAddr;

pub mod api;
pub mod hls;
pub mod ts;

pub fn router(manager: StreamManager) -> Router {
    Router::new()
        .route("/hls/{channel}/stream.m3u8", get(hls::playlist))
        .route("/hls/{channel}/{segment}", get(hls::segment))
        .route("/play", get(hls::play))
        .route("/stream/{channel}", get(ts::stream))
        .route("/streams", get(api::list_streams))
        .route("/streams/status", get(api::status_events))
        .route("/streams/{id}", delete(api::terminate))
        .with_state(manager)
}

/// Best-effort client address: proxy headers first, then the socket peer.
pub(crate) fn client_address(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }
    connect_info
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Error responses shared by the HLS and MPEG-TS handlers.
#[derive(Debug)]
pub enum HttpError {
    NotFound(&'static str),
    /// 503 with Retry-After; `tuners_exhausted` adds the HDHomeRun header
    NotReady {
        message: &'static str,
        tuners_exhausted: bool,
    },
    BadRequest(String),
    Internal(String),
}

impl HttpError {
    pub fn not_ready(message: &'static str) -> Self {
        Self::NotReady {
            message,
            tuners_exhausted: false,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
            HttpError::NotReady {
                message,
                tuners_exhausted,
            } => {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", "5".parse().unwrap());
                if tuners_exhausted {
                    headers.insert(
                        "X-HDHomeRun-Error",
                        "All Tuners In Use".parse().unwrap(),
                    );
                }
                (StatusCode::SERVICE_UNAVAILABLE, headers, message).into_response()
            }
            HttpError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            HttpError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_address_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_address(&headers, None), "10.1.2.3");

        let headers = HeaderMap::new();
        let info = ConnectInfo("192.168.1.5:4242".parse().unwrap());
        assert_eq!(client_address(&headers, Some(&info)), "192.168.1.5");
        assert_eq!(client_address(&headers, None), "unknown");
    }
}
