pub mod background;
pub mod browser;
pub mod capture;
pub mod channels;
pub mod demux;
pub mod egress;
pub mod http;
pub mod monitor;
pub mod mux;
pub mod profile;
pub mod remux;
pub mod settings;
pub mod status;
pub mod stream_manager;
#[cfg(test)]
mod test_pipeline;

use sha2::{Digest, Sha256};

/// Derive a synthetic channel key for ad-hoc `/play` URLs.
///
/// The same URL always maps to the same key so concurrent requests share one
/// capture tab.
pub fn synthetic_channel_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    format!("play-{}", hex::encode(&digest[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_key_is_stable() {
        let a = synthetic_channel_key("https://example.com/live");
        let b = synthetic_channel_key("https://example.com/live");
        assert_eq!(a, b);
        assert!(a.starts_with("play-"));
        assert_eq!(a.len(), "play-".len() + 12);
    }

    #[test]
    fn synthetic_key_differs_by_url() {
        assert_ne!(
            synthetic_channel_key("https://example.com/a"),
            synthetic_channel_key("https://example.com/b")
        );
    }
}
