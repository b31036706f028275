use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use sysinfo::System;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamHealth {
    Healthy,
    Buffering,
    Stalled,
    Recovering,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Hls,
    #[serde(rename = "mpegts")]
    MpegTs,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClientCounts {
    pub total: usize,
    pub hls: usize,
    pub mpegts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastIssue {
    pub kind: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub id: u64,
    pub id_str: String,
    pub channel_key: Option<String>,
    pub channel_name: Option<String>,
    pub provider: Option<String>,
    pub url: String,
    pub health: StreamHealth,
    pub escalation_level: u8,
    pub duration_secs: u64,
    pub memory_bytes: usize,
    pub ready_state: Option<u8>,
    pub network_state: Option<u8>,
    pub recovery_attempts: u32,
    pub last_issue: Option<LastIssue>,
    pub show_name: Option<String>,
    pub logo_url: Option<String>,
    pub clients: ClientCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserStatus {
    pub connected: bool,
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsStatus {
    pub active: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    /// Bytes retained in segment stores across all streams
    pub heap_used: usize,
    /// Resident set size of this process
    pub rss: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub browser: BrowserStatus,
    pub streams: StreamsStatus,
    pub memory: MemoryStatus,
    pub uptime_secs: u64,
}

/// Status events delivered to SSE subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    Snapshot {
        streams: Vec<StreamStatus>,
        system: SystemStatus,
    },
    StreamAdded {
        stream: StreamStatus,
    },
    StreamRemoved {
        id: u64,
    },
    StreamHealthChanged {
        stream: StreamStatus,
    },
    SystemStatusChanged {
        system: SystemStatus,
    },
}

impl StatusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Snapshot { .. } => "snapshot",
            StatusEvent::StreamAdded { .. } => "streamAdded",
            StatusEvent::StreamRemoved { .. } => "streamRemoved",
            StatusEvent::StreamHealthChanged { .. } => "streamHealthChanged",
            StatusEvent::SystemStatusChanged { .. } => "systemStatusChanged",
        }
    }
}

/// Holds the current per-stream status map and fans incremental changes out
/// to any number of subscribers.
pub struct StatusEmitter {
    started: Instant,
    stream_limit: usize,
    tx: broadcast::Sender<StatusEvent>,
    streams: RwLock<HashMap<u64, StreamStatus>>,
    /// (browser connected, active streams) that produced the last system event
    last_system: Mutex<Option<(bool, usize)>>,
    system: Mutex<System>,
}

impl StatusEmitter {
    pub fn new(stream_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            started: Instant::now(),
            stream_limit,
            tx,
            streams: RwLock::new(HashMap::new()),
            last_system: Mutex::new(None),
            system: Mutex::new(System::new()),
        }
    }

    /// Current snapshot plus a live event receiver.
    pub fn subscribe(
        &self,
        browser_connected: bool,
        page_count: usize,
    ) -> (StatusEvent, broadcast::Receiver<StatusEvent>) {
        let rx = self.tx.subscribe();
        let snapshot = StatusEvent::Snapshot {
            streams: self.statuses(),
            system: self.build_system_status(browser_connected, page_count),
        };
        (snapshot, rx)
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        use itertools::Itertools;
        self.streams
            .read()
            .unwrap()
            .values()
            .cloned()
            .sorted_by_key(|s| s.id)
            .collect()
    }

    pub fn stream_status(&self, id: u64) -> Option<StreamStatus> {
        self.streams.read().unwrap().get(&id).cloned()
    }

    pub fn stream_added(&self, status: StreamStatus) {
        self.streams
            .write()
            .unwrap()
            .insert(status.id, status.clone());
        let _ = self.tx.send(StatusEvent::StreamAdded { stream: status });
    }

    pub fn stream_removed(&self, id: u64) {
        self.streams.write().unwrap().remove(&id);
        let _ = self.tx.send(StatusEvent::StreamRemoved { id });
    }

    /// Unconditional per-tick health update from the monitor.
    pub fn stream_health_changed(&self, status: StreamStatus) {
        self.streams
            .write()
            .unwrap()
            .insert(status.id, status.clone());
        let _ = self
            .tx
            .send(StatusEvent::StreamHealthChanged { stream: status });
    }

    /// Attach polled show metadata to a stream's status.
    pub fn update_show_info(&self, id: u64, show_name: Option<String>, logo_url: Option<String>) {
        let updated = {
            let mut streams = self.streams.write().unwrap();
            match streams.get_mut(&id) {
                Some(status) => {
                    status.show_name = show_name;
                    status.logo_url = logo_url;
                    Some(status.clone())
                }
                None => None,
            }
        };
        if let Some(status) = updated {
            let _ = self
                .tx
                .send(StatusEvent::StreamHealthChanged { stream: status });
        }
    }

    /// Recompute the system status; emits only when the browser connection
    /// state or the number of active streams actually changed.
    pub fn refresh_system_status(&self, browser_connected: bool, page_count: usize) {
        let active = self.streams.read().unwrap().len();
        {
            let mut last = self.last_system.lock().unwrap();
            if *last == Some((browser_connected, active)) {
                return;
            }
            *last = Some((browser_connected, active));
        }
        let system = self.build_system_status(browser_connected, page_count);
        let _ = self.tx.send(StatusEvent::SystemStatusChanged { system });
    }

    fn build_system_status(&self, browser_connected: bool, page_count: usize) -> SystemStatus {
        let heap_used = self
            .streams
            .read()
            .unwrap()
            .values()
            .map(|s| s.memory_bytes)
            .sum();
        let rss = {
            let mut system = self.system.lock().unwrap();
            match sysinfo::get_current_pid() {
                Ok(pid) => {
                    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                    system.process(pid).map(|p| p.memory()).unwrap_or(0)
                }
                Err(_) => 0,
            }
        };
        SystemStatus {
            browser: BrowserStatus {
                connected: browser_connected,
                page_count,
            },
            streams: StreamsStatus {
                active: self.streams.read().unwrap().len(),
                limit: self.stream_limit,
            },
            memory: MemoryStatus { heap_used, rss },
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Tracks connected clients per stream as a multiset of (address, type).
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, Vec<(String, ClientType)>>>,
}

impl ClientRegistry {
    pub fn register(&self, stream_id: u64, address: &str, kind: ClientType) {
        self.clients
            .write()
            .unwrap()
            .entry(stream_id)
            .or_default()
            .push((address.to_string(), kind));
    }

    /// Register unless an identical (address, type) entry already exists.
    /// HLS clients have no disconnect signal, so each address counts once.
    pub fn register_unique(&self, stream_id: u64, address: &str, kind: ClientType) {
        let mut clients = self.clients.write().unwrap();
        let list = clients.entry(stream_id).or_default();
        if !list.iter().any(|(a, k)| a == address && *k == kind) {
            list.push((address.to_string(), kind));
        }
    }

    /// Remove one matching registration; extra calls are no-ops.
    pub fn unregister(&self, stream_id: u64, address: &str, kind: ClientType) {
        let mut clients = self.clients.write().unwrap();
        if let Some(list) = clients.get_mut(&stream_id) {
            if let Some(pos) = list.iter().position(|(a, k)| a == address && *k == kind) {
                list.remove(pos);
            }
            if list.is_empty() {
                clients.remove(&stream_id);
            }
        }
    }

    pub fn clear_stream(&self, stream_id: u64) {
        self.clients.write().unwrap().remove(&stream_id);
    }

    pub fn counts(&self, stream_id: u64) -> ClientCounts {
        let clients = self.clients.read().unwrap();
        let list = match clients.get(&stream_id) {
            Some(list) => list,
            None => return ClientCounts::default(),
        };
        ClientCounts {
            total: list.len(),
            hls: list.iter().filter(|(_, k)| *k == ClientType::Hls).count(),
            mpegts: list
                .iter()
                .filter(|(_, k)| *k == ClientType::MpegTs)
                .count(),
        }
    }

    /// Distinct client addresses across all streams.
    pub fn addresses(&self) -> Vec<String> {
        use itertools::Itertools;
        self.clients
            .read()
            .unwrap()
            .values()
            .flatten()
            .map(|(a, _)| a.clone())
            .unique()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: u64) -> StreamStatus {
        StreamStatus {
            id,
            id_str: format!("stream-{:06x}", id),
            channel_key: None,
            channel_name: None,
            provider: None,
            url: "https://example.com".into(),
            health: StreamHealth::Healthy,
            escalation_level: 0,
            duration_secs: 0,
            memory_bytes: 1000,
            ready_state: Some(4),
            network_state: Some(2),
            recovery_attempts: 0,
            last_issue: None,
            show_name: None,
            logo_url: None,
            clients: ClientCounts::default(),
        }
    }

    #[test]
    fn snapshot_and_incremental_events() {
        let emitter = StatusEmitter::new(4);
        let (snapshot, mut rx) = emitter.subscribe(true, 0);
        match snapshot {
            StatusEvent::Snapshot { streams, system } => {
                assert!(streams.is_empty());
                assert_eq!(system.streams.limit, 4);
            }
            other => panic!("expected snapshot, got {:?}", other.name()),
        }

        emitter.stream_added(status(1));
        emitter.stream_removed(1);
        assert_eq!(rx.try_recv().unwrap().name(), "streamAdded");
        assert_eq!(rx.try_recv().unwrap().name(), "streamRemoved");
    }

    #[test]
    fn system_status_fires_only_on_change() {
        let emitter = StatusEmitter::new(4);
        let (_, mut rx) = emitter.subscribe(true, 0);

        emitter.refresh_system_status(true, 0);
        assert_eq!(rx.try_recv().unwrap().name(), "systemStatusChanged");

        // same browser state, same stream count: silent
        emitter.refresh_system_status(true, 0);
        assert!(rx.try_recv().is_err());

        emitter.stream_added(status(1));
        let _ = rx.try_recv(); // streamAdded
        emitter.refresh_system_status(true, 1);
        assert_eq!(rx.try_recv().unwrap().name(), "systemStatusChanged");
    }

    #[test]
    fn client_registry_is_a_multiset() {
        let registry = ClientRegistry::default();
        registry.register(1, "10.0.0.1", ClientType::Hls);
        registry.register(1, "10.0.0.1", ClientType::Hls);
        registry.register(1, "10.0.0.2", ClientType::MpegTs);

        let counts = registry.counts(1);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.hls, 2);
        assert_eq!(counts.mpegts, 1);

        registry.unregister(1, "10.0.0.1", ClientType::Hls);
        assert_eq!(registry.counts(1).hls, 1);
        // extra unregister is a no-op
        registry.unregister(1, "10.0.0.1", ClientType::Hls);
        registry.unregister(1, "10.0.0.1", ClientType::Hls);
        assert_eq!(registry.counts(1).hls, 0);

        let mut addresses = registry.addresses();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.2"]);
    }
}
