use crate::demux::fragment::{first_sample_sync, rewrite_moof, track_timescales};
use crate::demux::Mp4Box;
use crate::egress::HlsStream;
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shortest EXTINF ever declared; keeps players from treating a flushed
/// sliver of data as a zero-length segment.
const MIN_SEGMENT_DURATION: f64 = 0.1;

/// Media segments smaller than this count towards the dead-video detector.
const TINY_SEGMENT_BYTES: usize = 500_000;

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub stream_id: u64,
    /// Target segment duration in seconds
    pub segment_duration: f32,
    /// Sliding window size in segments
    pub max_segments: usize,
}

/// Read-only snapshot handed from a stopped segmenter to its successor
/// during tab replacement. The successor copies everything it needs; the two
/// instances never share mutable state.
#[derive(Debug, Clone, Default)]
pub struct SegmenterHandoff {
    /// Next expected decode time per track, in track timescale units
    pub track_timestamps: HashMap<u32, u64>,
    /// Init segment published by the predecessor
    pub previous_init: Option<Bytes>,
    /// Whether the next emitted segment must carry a discontinuity marker
    pub pending_discontinuity: bool,
    pub init_version: u32,
    pub segment_index: u64,
    pub session_stats: SessionStats,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// moofs that could not be parsed and were passed through untouched
    pub malformed_moof_count: u64,
    /// Times the capture tab was replaced over the stream's life
    pub tab_replacements: u32,
    pub sync_spread_min: Option<f64>,
    pub sync_spread_max: Option<f64>,
    sync_spread_sum: f64,
    sync_spread_samples: u64,
}

impl SessionStats {
    fn record_sync_spread(&mut self, spread: f64) {
        self.sync_spread_min = Some(self.sync_spread_min.map_or(spread, |v| v.min(spread)));
        self.sync_spread_max = Some(self.sync_spread_max.map_or(spread, |v| v.max(spread)));
        self.sync_spread_sum += spread;
        self.sync_spread_samples += 1;
    }

    pub fn sync_spread_mean(&self) -> Option<f64> {
        if self.sync_spread_samples == 0 {
            None
        } else {
            Some(self.sync_spread_sum / self.sync_spread_samples as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyframeStats {
    pub keyframe_moofs: u64,
    pub non_keyframe_moofs: u64,
    pub indeterminate_moofs: u64,
}

/// Turns a parsed fMP4 box stream from one captured tab into numbered HLS
/// media segments, an init segment and a live playlist.
///
/// Decode timestamps are rewritten so that a successor constructed with a
/// [SegmenterHandoff] continues the media timeline of its predecessor even
/// though the new tab starts counting from zero again.
pub struct HlsSegmenter {
    config: SegmenterConfig,
    store: Arc<HlsStream>,

    has_init: bool,
    ftyp: Option<Bytes>,
    init: Option<Bytes>,
    init_version: u32,

    segment_index: u64,
    first_segment_emitted: bool,
    pending_discontinuity: bool,
    discontinuity_indices: HashSet<u64>,

    fragment_buffer: BytesMut,
    segment_start: Instant,
    awaiting_mdat: bool,

    /// track_ID → timescale from the moov
    timescales: HashMap<u32, u32>,
    /// track_ID → tfdt rewrite offset, initialized lazily per-moof
    offsets: HashMap<u32, i64>,
    /// track_ID → next expected decode time after the rewrite
    track_timestamps: HashMap<u32, u64>,
    /// Handoff timestamps from the predecessor segmenter
    initial_timestamps: Option<HashMap<u32, u64>>,
    /// Shared media position derived from the handoff, seconds
    normalized_reference_sec: Option<f64>,

    /// Media time accumulated in the open segment, per track
    segment_track_durations: HashMap<u32, u64>,
    /// Durations of the segments currently in the playlist window
    durations: VecDeque<f64>,

    keyframe_stats: KeyframeStats,
    session_stats: SessionStats,
    last_segment_size: usize,
    consecutive_tiny_segments: u32,
}

impl HlsSegmenter {
    pub fn new(
        config: SegmenterConfig,
        store: Arc<HlsStream>,
        handoff: Option<SegmenterHandoff>,
    ) -> Self {
        let (initial_timestamps, previous_init, pending, init_version, segment_index, stats) =
            match handoff {
                Some(h) => {
                    let mut stats = h.session_stats;
                    stats.tab_replacements += 1;
                    (
                        Some(h.track_timestamps),
                        h.previous_init,
                        h.pending_discontinuity,
                        h.init_version,
                        h.segment_index,
                        stats,
                    )
                }
                None => (None, None, false, 1, 0, SessionStats::default()),
            };

        Self {
            config,
            store,
            has_init: false,
            ftyp: None,
            init: previous_init,
            init_version,
            segment_index,
            first_segment_emitted: false,
            pending_discontinuity: pending,
            discontinuity_indices: HashSet::new(),
            fragment_buffer: BytesMut::new(),
            segment_start: Instant::now(),
            awaiting_mdat: false,
            timescales: HashMap::new(),
            offsets: HashMap::new(),
            track_timestamps: HashMap::new(),
            initial_timestamps,
            normalized_reference_sec: None,
            segment_track_durations: HashMap::new(),
            durations: VecDeque::new(),
            keyframe_stats: KeyframeStats::default(),
            session_stats: stats,
            last_segment_size: 0,
            consecutive_tiny_segments: 0,
        }
    }

    pub fn segment_index(&self) -> u64 {
        self.segment_index
    }

    pub fn init_version(&self) -> u32 {
        self.init_version
    }

    pub fn init_segment(&self) -> Option<Bytes> {
        self.init.clone()
    }

    pub fn track_timestamps(&self) -> HashMap<u32, u64> {
        self.track_timestamps.clone()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session_stats.clone()
    }

    pub fn keyframe_stats(&self) -> KeyframeStats {
        self.keyframe_stats
    }

    pub fn last_segment_size(&self) -> usize {
        self.last_segment_size
    }

    pub fn consecutive_tiny_segments(&self) -> u32 {
        self.consecutive_tiny_segments
    }

    /// Snapshot for a successor segmenter. The caller decides whether the
    /// successor starts with a pending discontinuity.
    pub fn handoff(&self) -> SegmenterHandoff {
        SegmenterHandoff {
            track_timestamps: self.track_timestamps.clone(),
            previous_init: self.init.clone(),
            pending_discontinuity: self.pending_discontinuity,
            init_version: self.init_version,
            segment_index: self.segment_index,
            session_stats: self.session_stats.clone(),
        }
    }

    /// Flush the open fragment buffer as a short segment and mark the next
    /// segment as discontinuous.
    pub fn mark_discontinuity(&mut self) {
        if !self.fragment_buffer.is_empty() {
            self.emit_segment();
        }
        self.pending_discontinuity = true;
    }

    pub fn push_box(&mut self, b: Mp4Box) -> Result<()> {
        if !self.has_init {
            return self.push_startup_box(b);
        }

        if b.is_moof() {
            self.push_moof(b);
        } else if b.is_mdat() {
            self.fragment_buffer.put(b.data.as_ref());
            self.awaiting_mdat = false;
        } else {
            // styp/sidx/prft and friends ride along with the open segment
            self.fragment_buffer.put(b.data.as_ref());
        }
        Ok(())
    }

    fn push_startup_box(&mut self, b: Mp4Box) -> Result<()> {
        if b.is_ftyp() {
            self.ftyp = Some(b.data);
            return Ok(());
        }
        if !b.is_moov() {
            return Ok(());
        }

        let mut init = BytesMut::new();
        if let Some(ftyp) = &self.ftyp {
            init.put(ftyp.as_ref());
        }
        init.put(b.data.as_ref());
        let init = init.freeze();

        match self.init.take() {
            Some(previous) if previous == init => {
                // identical decoder parameters, no client-side flush needed
                if self.pending_discontinuity {
                    info!(
                        stream_id = self.config.stream_id,
                        "init unchanged across replacement, discontinuity suppressed"
                    );
                    self.pending_discontinuity = false;
                }
            }
            Some(_) => {
                self.init_version += 1;
                debug!(
                    stream_id = self.config.stream_id,
                    version = self.init_version,
                    "decoder parameters changed, init version bumped"
                );
            }
            None => {}
        }

        self.timescales = track_timescales(&b.data);
        if self.timescales.is_empty() {
            warn!(
                stream_id = self.config.stream_id,
                "no track timescales in moov, EXTINF falls back to wall-clock"
            );
        }

        // One shared reference position eliminates frozen-in A/V jitter: the
        // per-track offsets are all derived from this single value.
        if let Some(initial) = &self.initial_timestamps {
            let positions: Vec<f64> = initial
                .iter()
                .filter_map(|(track, ts)| {
                    self.timescales
                        .get(track)
                        .map(|scale| *ts as f64 / *scale as f64)
                })
                .collect();
            if !positions.is_empty() {
                let reference = positions.iter().sum::<f64>() / positions.len() as f64;
                self.normalized_reference_sec = Some(reference);
                info!(
                    stream_id = self.config.stream_id,
                    "resuming media timeline from handoff at {:.3}s", reference
                );
            }
        }

        self.init = Some(init.clone());
        self.has_init = true;
        self.segment_start = Instant::now();
        self.store.set_init(init, self.init_version);
        Ok(())
    }

    fn push_moof(&mut self, b: Mp4Box) {
        // Cut before ingesting the new moof: the very first segment goes out
        // as soon as one complete fragment is buffered to minimize
        // time-to-first-frame, later ones at the configured cadence.
        if !self.fragment_buffer.is_empty() {
            let due = self.segment_start.elapsed().as_secs_f64()
                >= self.config.segment_duration as f64;
            if !self.first_segment_emitted || due {
                self.emit_segment();
            }
        }

        let mut moof = b.data.to_vec();

        // Read-only pass to learn which tracks appear and their originals.
        let tracks = match rewrite_moof(&mut moof, &HashMap::new()) {
            Ok(tracks) => tracks,
            Err(e) => {
                self.session_stats.malformed_moof_count += 1;
                warn!(
                    stream_id = self.config.stream_id,
                    "malformed moof passed through: {}", e
                );
                self.fragment_buffer.put(b.data.as_ref());
                self.awaiting_mdat = true;
                return;
            }
        };

        // Lazy per-track offset initialization, atomic for the whole moof.
        for (track, frag) in &tracks {
            if self.offsets.contains_key(track) {
                continue;
            }
            let offset = if let (Some(reference), Some(scale)) = (
                self.normalized_reference_sec,
                self.timescales.get(track),
            ) {
                (reference * *scale as f64).round() as i64 - frag.base_decode_time as i64
            } else if let Some(initial) = self
                .initial_timestamps
                .as_ref()
                .and_then(|m| m.get(track))
            {
                *initial as i64 - frag.base_decode_time as i64
            } else {
                0
            };
            self.offsets.insert(*track, offset);
        }

        if self.offsets.values().any(|o| *o != 0) {
            if let Err(e) = rewrite_moof(&mut moof, &self.offsets) {
                // keep the producer's original timestamps rather than a
                // half-rewritten fragment
                self.session_stats.malformed_moof_count += 1;
                warn!(
                    stream_id = self.config.stream_id,
                    "tfdt rewrite failed, passing through original: {}", e
                );
                moof = b.data.to_vec();
            }
        }

        for (track, frag) in &tracks {
            *self.segment_track_durations.entry(*track).or_insert(0) += frag.duration;
            let offset = self.offsets.get(track).copied().unwrap_or(0);
            let rewritten = (frag.base_decode_time as i64 + offset).max(0) as u64;
            self.track_timestamps
                .insert(*track, rewritten + frag.duration);
        }

        match first_sample_sync(&moof) {
            Some(true) => self.keyframe_stats.keyframe_moofs += 1,
            Some(false) => self.keyframe_stats.non_keyframe_moofs += 1,
            None => self.keyframe_stats.indeterminate_moofs += 1,
        }

        self.fragment_buffer.put(moof.as_slice());
        self.awaiting_mdat = true;
    }

    fn emit_segment(&mut self) {
        if self.fragment_buffer.is_empty() {
            return;
        }

        let index = self.segment_index;
        if self.pending_discontinuity {
            self.discontinuity_indices.insert(index);
            self.pending_discontinuity = false;
        }

        let duration = self.segment_media_duration();
        self.durations.push_back(duration);
        while self.durations.len() > self.config.max_segments {
            self.durations.pop_front();
        }

        self.record_sync_spread();

        let data = self.fragment_buffer.split().freeze();
        self.last_segment_size = data.len();
        if data.len() < TINY_SEGMENT_BYTES {
            self.consecutive_tiny_segments += 1;
        } else {
            self.consecutive_tiny_segments = 0;
        }

        let name = segment_name(index);
        debug!(
            stream_id = self.config.stream_id,
            "finished {} [{:.3}s, {:.2} kB]",
            name,
            duration,
            data.len() as f32 / 1024f32,
        );
        self.store.insert_segment(name, data, self.config.max_segments);

        self.segment_index += 1;
        self.first_segment_emitted = true;
        self.segment_track_durations.clear();
        self.segment_start = Instant::now();

        // entries that fell out of the window can never render again
        let window_start = self.segment_index.saturating_sub(self.durations.len() as u64);
        self.discontinuity_indices.retain(|i| *i >= window_start);

        self.store.set_playlist(self.build_playlist());
    }

    fn segment_media_duration(&self) -> f64 {
        let media = self
            .segment_track_durations
            .iter()
            .filter_map(|(track, units)| {
                self.timescales
                    .get(track)
                    .map(|scale| *units as f64 / *scale as f64)
            })
            .fold(0.0f64, f64::max);

        let duration = if media > 0.0 {
            media
        } else {
            self.segment_start.elapsed().as_secs_f64()
        };
        duration.max(MIN_SEGMENT_DURATION)
    }

    fn record_sync_spread(&mut self) {
        let positions: Vec<f64> = self
            .track_timestamps
            .iter()
            .filter_map(|(track, ts)| {
                self.timescales
                    .get(track)
                    .map(|scale| *ts as f64 / *scale as f64)
            })
            .collect();
        if positions.len() >= 2 {
            let max = positions.iter().cloned().fold(f64::MIN, f64::max);
            let min = positions.iter().cloned().fold(f64::MAX, f64::min);
            self.session_stats.record_sync_spread(max - min);
        }
    }

    fn build_playlist(&self) -> String {
        let window = self.durations.len() as u64;
        let start_index = self.segment_index - window;

        let max_extinf = self.durations.iter().cloned().fold(0.0f64, f64::max);
        let target = (max_extinf.ceil() as u64).max(self.config.segment_duration.ceil() as u64);

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:7\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", start_index);
        let _ = writeln!(out, "#EXT-X-MAP:URI=\"init.mp4?v={}\"", self.init_version);

        for (i, duration) in self.durations.iter().enumerate() {
            let index = start_index + i as u64;
            if self.discontinuity_indices.contains(&index) {
                out.push_str("#EXT-X-DISCONTINUITY\n");
                let _ = writeln!(out, "#EXT-X-MAP:URI=\"init.mp4?v={}\"", self.init_version);
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", duration);
            let _ = writeln!(out, "{}", segment_name(index));
        }
        out
    }
}

pub fn segment_name(index: u64) -> String {
    format!("segment{}.m4s", index)
}
