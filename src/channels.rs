use crate::settings::ChannelSettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named source URL for a live stream.
#[derive(Debug, Clone, Default)]
pub struct ChannelDef {
    pub key: String,
    pub url: String,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub profile: Option<String>,
    pub enabled: bool,

    /// Per-channel tune overrides, set for ad-hoc `/play` channels
    pub channel_selector: Option<String>,
    pub click_to_play: Option<bool>,
    pub click_selector: Option<String>,
    pub no_video: bool,
}

impl From<&ChannelSettings> for ChannelDef {
    fn from(c: &ChannelSettings) -> Self {
        Self {
            key: c.key.clone(),
            url: c.url.clone(),
            name: c.name.clone(),
            provider: c.provider.clone(),
            profile: c.profile.clone(),
            enabled: c.enabled,
            ..Default::default()
        }
    }
}

/// Channel lookup consumed by the request handlers. Configuration CRUD lives
/// outside the core; this is the read side it exposes.
pub trait ChannelDirectory: Send + Sync {
    fn get(&self, key: &str) -> Option<ChannelDef>;

    /// While an interactive provider login is underway streams must not
    /// start; handlers answer 503.
    fn login_active(&self) -> bool;

    /// Register a synthetic channel for an ad-hoc `/play` URL. Directories
    /// that cannot hold runtime entries may ignore this.
    fn register_synthetic(&self, def: ChannelDef) {
        let _ = def;
    }
}

/// Directory backed by the static channel table in settings, plus synthetic
/// channels registered at runtime for ad-hoc `/play` URLs.
pub struct StaticChannelDirectory {
    channels: std::sync::RwLock<HashMap<String, ChannelDef>>,
    login_active: AtomicBool,
}

impl StaticChannelDirectory {
    pub fn new(channels: &[ChannelSettings]) -> Self {
        let map = channels
            .iter()
            .map(|c| (c.key.clone(), ChannelDef::from(c)))
            .collect();
        Self {
            channels: std::sync::RwLock::new(map),
            login_active: AtomicBool::new(false),
        }
    }

    pub fn set_login_active(&self, active: bool) {
        self.login_active.store(active, Ordering::SeqCst);
    }
}

impl ChannelDirectory for StaticChannelDirectory {
    fn get(&self, key: &str) -> Option<ChannelDef> {
        self.channels.read().unwrap().get(key).cloned()
    }

    fn login_active(&self) -> bool {
        self.login_active.load(Ordering::SeqCst)
    }

    /// Existing definitions win so `/play` cannot shadow a configured
    /// channel.
    fn register_synthetic(&self, def: ChannelDef) {
        self.channels
            .write()
            .unwrap()
            .entry(def.key.clone())
            .or_insert(def);
    }
}
