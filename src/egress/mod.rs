use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Events fanned out to live consumers of one stream.
///
/// Ordering guarantees: `Init` always precedes the first `Segment`, segments
/// fire in index order after they are visible in the store, and `Terminated`
/// fires exactly once after the last media event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Init { data: Bytes },
    Segment { name: String, data: Bytes },
    Terminated,
}

/// Per-stream segment store: retained init segment, bounded FIFO of media
/// segments, current playlist text, one-shot readiness signals and the event
/// fan-out.
///
/// Written only by the segmenter task; read concurrently by any number of
/// HTTP handler tasks.
pub struct HlsStream {
    init: RwLock<Option<Bytes>>,
    init_version: RwLock<u32>,
    segments: RwLock<VecDeque<(String, Bytes)>>,
    playlist: RwLock<Option<String>>,

    init_ready_tx: watch::Sender<bool>,
    playlist_ready_tx: watch::Sender<bool>,
    events: broadcast::Sender<StreamEvent>,
    terminated: AtomicBool,
}

/// Enough queue depth that a stall in one subscriber never drops events for
/// a well-behaved one at typical fan-out (20+ subscribers).
const EVENT_QUEUE_DEPTH: usize = 64;

impl Default for HlsStream {
    fn default() -> Self {
        Self::new()
    }
}

impl HlsStream {
    pub fn new() -> Self {
        let (init_ready_tx, _) = watch::channel(false);
        let (playlist_ready_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        Self {
            init: RwLock::new(None),
            init_version: RwLock::new(1),
            segments: RwLock::new(VecDeque::new()),
            playlist: RwLock::new(None),
            init_ready_tx,
            playlist_ready_tx,
            events,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn set_init(&self, data: Bytes, version: u32) {
        *self.init.write().unwrap() = Some(data.clone());
        *self.init_version.write().unwrap() = version;
        // the signal latches on the first write and stays resolved, whether
        // or not anyone is waiting yet
        self.init_ready_tx.send_replace(true);
        let _ = self.events.send(StreamEvent::Init { data });
    }

    pub fn insert_segment(&self, name: String, data: Bytes, max_segments: usize) {
        {
            let mut segments = self.segments.write().unwrap();
            segments.push_back((name.clone(), data.clone()));
            while segments.len() > max_segments {
                segments.pop_front();
            }
        }
        // only after the segment is visible to readers
        let _ = self.events.send(StreamEvent::Segment { name, data });
    }

    pub fn set_playlist(&self, text: String) {
        *self.playlist.write().unwrap() = Some(text);
        self.playlist_ready_tx.send_replace(true);
    }

    pub fn init_segment(&self) -> Option<Bytes> {
        self.init.read().unwrap().clone()
    }

    pub fn init_version(&self) -> u32 {
        *self.init_version.read().unwrap()
    }

    pub fn playlist(&self) -> Option<String> {
        self.playlist.read().unwrap().clone()
    }

    pub fn segment(&self, name: &str) -> Option<Bytes> {
        self.segments
            .read()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.clone())
    }

    /// Stored segments in insertion (= index) order.
    pub fn segments_snapshot(&self) -> Vec<(String, Bytes)> {
        self.segments.read().unwrap().iter().cloned().collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().unwrap().len()
    }

    /// Bytes retained for this stream: init plus all stored segments.
    pub fn memory_bytes(&self) -> usize {
        let init = self.init.read().unwrap().as_ref().map_or(0, |b| b.len());
        let segments: usize = self
            .segments
            .read()
            .unwrap()
            .iter()
            .map(|(_, b)| b.len())
            .sum();
        init + segments
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Await the first init segment, bounded.
    pub async fn wait_init(&self, timeout: Duration) -> Option<Bytes> {
        let mut rx = self.init_ready_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .ok()?
            .ok()?;
        self.init_segment()
    }

    /// Await the first playlist, bounded.
    pub async fn wait_playlist(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.playlist_ready_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .ok()?
            .ok()?;
        self.playlist()
    }

    /// Fire the terminal event. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(StreamEvent::Terminated);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_ready_latches_once() {
        let store = HlsStream::new();
        let waiter = {
            let rx = store.init_ready_tx.subscribe();
            rx
        };
        drop(waiter);

        store.set_init(Bytes::from_static(b"init"), 1);
        // late waiters resolve immediately
        let init = store.wait_init(Duration::from_millis(10)).await;
        assert_eq!(init.unwrap(), Bytes::from_static(b"init"));
    }

    #[tokio::test]
    async fn wait_init_times_out_when_unset() {
        let store = HlsStream::new();
        assert!(store.wait_init(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn segments_rotate_fifo() {
        let store = HlsStream::new();
        for i in 0..5 {
            store.insert_segment(format!("segment{}.m4s", i), Bytes::from(vec![i as u8; 4]), 3);
        }
        assert_eq!(store.segment_count(), 3);
        assert!(store.segment("segment1.m4s").is_none());
        assert!(store.segment("segment2.m4s").is_some());
        let names: Vec<String> = store
            .segments_snapshot()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["segment2.m4s", "segment3.m4s", "segment4.m4s"]);
    }

    #[tokio::test]
    async fn events_fire_after_visibility_and_in_order() {
        let store = HlsStream::new();
        let mut rx = store.subscribe();

        store.set_init(Bytes::from_static(b"init"), 1);
        store.insert_segment("segment0.m4s".into(), Bytes::from_static(b"a"), 6);
        store.insert_segment("segment1.m4s".into(), Bytes::from_static(b"b"), 6);
        store.terminate();
        store.terminate(); // second call must not produce a second event

        match rx.recv().await.unwrap() {
            StreamEvent::Init { .. } => {}
            other => panic!("expected init, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Segment { name, .. } => {
                assert_eq!(name, "segment0.m4s");
                assert!(store.segment(&name).is_some());
            }
            other => panic!("expected segment, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Segment { name, .. } => assert_eq!(name, "segment1.m4s"),
            other => panic!("expected segment, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Terminated => {}
            other => panic!("expected terminated, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn memory_accounting() {
        let store = HlsStream::new();
        store.set_init(Bytes::from(vec![0u8; 100]), 1);
        store.insert_segment("segment0.m4s".into(), Bytes::from(vec![0u8; 50]), 6);
        assert_eq!(store.memory_bytes(), 150);
    }

    #[test]
    fn many_subscribers_supported() {
        let store = HlsStream::new();
        let receivers: Vec<_> = (0..24).map(|_| store.subscribe()).collect();
        store.set_init(Bytes::from_static(b"init"), 1);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(StreamEvent::Init { .. })));
        }
    }
}
