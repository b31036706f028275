use anyhow::{bail, ensure, Result};
use mp4_atom::{Atom, Mdhd, Mdia, Tfdt, Tfhd, Tkhd, Traf, Trak, Trun};
use std::collections::{BTreeMap, HashMap};

use super::{box_payload, child_spans};

/// Per-track result of a moof pass: the decode time as written by the
/// producer and the summed sample durations, both in track timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFragment {
    pub base_decode_time: u64,
    pub duration: u64,
}

/// Extract `track_ID → timescale` from a raw moov box.
///
/// Returns an empty map when the moov cannot be walked; the segmenter falls
/// back to wall-clock durations in that case.
pub fn track_timescales(moov: &[u8]) -> HashMap<u32, u32> {
    parse_timescales(moov).unwrap_or_default()
}

fn parse_timescales(moov: &[u8]) -> Result<HashMap<u32, u32>> {
    let (_, payload_start, payload_end) = box_payload(moov)?;
    let payload = &moov[payload_start..payload_end];

    let mut out = HashMap::new();
    for (kind, start, end) in child_spans(payload)? {
        if kind != Trak::KIND {
            continue;
        }
        let trak = &payload[start..end];
        let mut track_id = None;
        let mut timescale = None;
        for (kind, start, end) in child_spans(trak)? {
            match kind {
                k if k == Tkhd::KIND => {
                    track_id = Some(parse_tkhd_track_id(&trak[start..end])?);
                }
                k if k == Mdia::KIND => {
                    let mdia = &trak[start..end];
                    for (kind, start, end) in child_spans(mdia)? {
                        if kind == Mdhd::KIND {
                            timescale = Some(parse_mdhd_timescale(&mdia[start..end])?);
                        }
                    }
                }
                _ => {}
            }
        }
        if let (Some(id), Some(ts)) = (track_id, timescale) {
            out.insert(id, ts);
        }
    }
    Ok(out)
}

fn parse_tkhd_track_id(payload: &[u8]) -> Result<u32> {
    let version = *payload.first().ok_or_else(|| anyhow::anyhow!("empty tkhd"))?;
    let pos = match version {
        0 => 12, // creation + modification are 32-bit
        1 => 20, // 64-bit times
        v => bail!("unknown tkhd version {}", v),
    };
    read_u32(payload, pos)
}

fn parse_mdhd_timescale(payload: &[u8]) -> Result<u32> {
    let version = *payload.first().ok_or_else(|| anyhow::anyhow!("empty mdhd"))?;
    let pos = match version {
        0 => 12,
        1 => 20,
        v => bail!("unknown mdhd version {}", v),
    };
    read_u32(payload, pos)
}

/// Rewrite every `tfdt.baseMediaDecodeTime` inside a raw moof in place,
/// adding the per-track offset, and accumulate `trun` sample durations.
///
/// The write always starts from the value currently in the buffer, so the
/// caller may run a read-only pass first (empty offsets) and re-apply with
/// real offsets without double-offsetting.
pub fn rewrite_moof(
    moof: &mut [u8],
    offsets: &HashMap<u32, i64>,
) -> Result<BTreeMap<u32, TrackFragment>> {
    let (_, payload_start, payload_end) = box_payload(moof)?;

    let traf_spans: Vec<(usize, usize)> = child_spans(&moof[payload_start..payload_end])?
        .into_iter()
        .filter(|(kind, _, _)| *kind == Traf::KIND)
        .map(|(_, start, end)| (payload_start + start, payload_start + end))
        .collect();

    let mut out = BTreeMap::new();
    for (traf_start, traf_end) in traf_spans {
        let mut track_id = None;
        let mut default_sample_duration = 0u32;
        let mut tfdt_span = None;
        let mut duration = 0u64;

        let spans = child_spans(&moof[traf_start..traf_end])?;
        for (kind, start, end) in &spans {
            let abs = (traf_start + start, traf_start + end);
            match *kind {
                k if k == Tfhd::KIND => {
                    let tfhd = parse_tfhd(&moof[abs.0..abs.1])?;
                    track_id = Some(tfhd.track_id);
                    default_sample_duration = tfhd.default_sample_duration.unwrap_or(0);
                }
                k if k == Tfdt::KIND => tfdt_span = Some(abs),
                k if k == Trun::KIND => {
                    duration += trun_duration(&moof[abs.0..abs.1], default_sample_duration)?;
                }
                _ => {}
            }
        }

        let track_id = match track_id {
            Some(id) => id,
            None => bail!("traf without tfhd"),
        };
        let (tfdt_start, tfdt_end) = match tfdt_span {
            Some(span) => span,
            None => bail!("traf without tfdt"),
        };

        let tfdt = &mut moof[tfdt_start..tfdt_end];
        let version = *tfdt.first().ok_or_else(|| anyhow::anyhow!("empty tfdt"))?;
        let original = match version {
            0 => read_u32(tfdt, 4)? as u64,
            1 => read_u64(tfdt, 4)?,
            v => bail!("unknown tfdt version {}", v),
        };

        let offset = offsets.get(&track_id).copied().unwrap_or(0);
        if offset != 0 {
            let rewritten = (original as i128 + offset as i128).max(0) as u128;
            match version {
                0 => {
                    ensure!(
                        rewritten <= u32::MAX as u128,
                        "rewritten tfdt overflows 32-bit field"
                    );
                    tfdt[4..8].copy_from_slice(&(rewritten as u32).to_be_bytes());
                }
                _ => {
                    ensure!(
                        rewritten <= u64::MAX as u128,
                        "rewritten tfdt overflows 64-bit field"
                    );
                    tfdt[4..12].copy_from_slice(&(rewritten as u64).to_be_bytes());
                }
            }
        }

        out.insert(
            track_id,
            TrackFragment {
                base_decode_time: original,
                duration,
            },
        );
    }
    Ok(out)
}

/// Whether the first sample of the moof is a sync sample.
///
/// `None` when the sample flags cannot be determined. Diagnostics only; the
/// cut decision never depends on this.
pub fn first_sample_sync(moof: &[u8]) -> Option<bool> {
    let (_, payload_start, payload_end) = box_payload(moof).ok()?;
    let payload = &moof[payload_start..payload_end];

    for (kind, start, end) in child_spans(payload).ok()? {
        if kind != Traf::KIND {
            continue;
        }
        let traf = &payload[start..end];
        let mut default_flags = None;
        for (kind, start, end) in child_spans(traf).ok()? {
            match kind {
                k if k == Tfhd::KIND => {
                    default_flags = parse_tfhd(&traf[start..end]).ok()?.default_sample_flags;
                }
                k if k == Trun::KIND => {
                    let flags = first_trun_sample_flags(&traf[start..end]).ok()?;
                    return sample_flags_sync(flags.or(default_flags)?);
                }
                _ => {}
            }
        }
    }
    None
}

fn sample_flags_sync(flags: u32) -> Option<bool> {
    let depends_on = (flags >> 24) & 0x3;
    let non_sync = flags & 0x0001_0000 != 0;
    if non_sync || depends_on == 1 {
        return Some(false);
    }
    if depends_on == 2 {
        return Some(true);
    }
    // depends_on unknown and non-sync bit clear: not conclusive
    None
}

struct TfhdInfo {
    track_id: u32,
    default_sample_duration: Option<u32>,
    default_sample_flags: Option<u32>,
}

fn parse_tfhd(payload: &[u8]) -> Result<TfhdInfo> {
    let flags = read_u32(payload, 0)? & 0x00FF_FFFF;
    let track_id = read_u32(payload, 4)?;

    let mut pos = 8usize;
    if flags & 0x000001 != 0 {
        pos += 8; // base_data_offset
    }
    if flags & 0x000002 != 0 {
        pos += 4; // sample_description_index
    }
    let default_sample_duration = if flags & 0x000008 != 0 {
        let v = read_u32(payload, pos)?;
        pos += 4;
        Some(v)
    } else {
        None
    };
    if flags & 0x000010 != 0 {
        pos += 4; // default_sample_size
    }
    let default_sample_flags = if flags & 0x000020 != 0 {
        Some(read_u32(payload, pos)?)
    } else {
        None
    };

    Ok(TfhdInfo {
        track_id,
        default_sample_duration,
        default_sample_flags,
    })
}

fn trun_duration(payload: &[u8], default_sample_duration: u32) -> Result<u64> {
    let flags = read_u32(payload, 0)? & 0x00FF_FFFF;
    let sample_count = read_u32(payload, 4)? as u64;

    let duration_present = flags & 0x000100 != 0;
    if !duration_present {
        return Ok(sample_count * default_sample_duration as u64);
    }

    let mut pos = 8usize;
    if flags & 0x000001 != 0 {
        pos += 4; // data_offset
    }
    if flags & 0x000004 != 0 {
        pos += 4; // first_sample_flags
    }

    let mut per_sample = 0usize;
    per_sample += 4; // duration, present per the check above
    if flags & 0x000200 != 0 {
        per_sample += 4; // size
    }
    if flags & 0x000400 != 0 {
        per_sample += 4; // flags
    }
    if flags & 0x000800 != 0 {
        per_sample += 4; // composition time offset
    }

    let mut total = 0u64;
    for i in 0..sample_count {
        total += read_u32(payload, pos + i as usize * per_sample)? as u64;
    }
    Ok(total)
}

fn first_trun_sample_flags(payload: &[u8]) -> Result<Option<u32>> {
    let flags = read_u32(payload, 0)? & 0x00FF_FFFF;
    let sample_count = read_u32(payload, 4)?;

    let mut pos = 8usize;
    if flags & 0x000001 != 0 {
        pos += 4; // data_offset
    }
    if flags & 0x000004 != 0 {
        return Ok(Some(read_u32(payload, pos)?));
    }
    if flags & 0x000400 == 0 || sample_count == 0 {
        return Ok(None);
    }
    if flags & 0x000100 != 0 {
        pos += 4; // duration precedes flags in each sample record
    }
    if flags & 0x000200 != 0 {
        pos += 4; // size
    }
    Ok(Some(read_u32(payload, pos)?))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    ensure!(pos + 4 <= data.len(), "short read at offset {}", pos);
    Ok(u32::from_be_bytes(data[pos..pos + 4].try_into()?))
}

fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    ensure!(pos + 8 <= data.len(), "short read at offset {}", pos);
    Ok(u64::from_be_bytes(data[pos..pos + 8].try_into()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test::Fmp4Builder;

    #[test]
    fn timescales_from_generated_moov() {
        let moov = Fmp4Builder::default().moov();
        let scales = track_timescales(&moov);
        assert_eq!(scales.get(&1), Some(&90_000));
        assert_eq!(scales.get(&2), Some(&48_000));
    }

    #[test]
    fn timescales_of_garbage_are_empty() {
        assert!(track_timescales(&[0, 0, 0]).is_empty());
        assert!(track_timescales(b"\x00\x00\x00\x08free").is_empty());
    }

    #[test]
    fn rewrite_reads_without_mutation_when_offsets_empty() {
        let b = Fmp4Builder::default();
        let mut moof = b.moof(1, &[(1, 270_000, 90_000), (2, 144_000, 48_000)]);
        let before = moof.clone();

        let tracks = rewrite_moof(&mut moof, &HashMap::new()).unwrap();
        assert_eq!(moof, before);
        assert_eq!(tracks[&1].base_decode_time, 270_000);
        assert_eq!(tracks[&1].duration, 90_000);
        assert_eq!(tracks[&2].base_decode_time, 144_000);
        assert_eq!(tracks[&2].duration, 48_000);
    }

    #[test]
    fn rewrite_applies_offsets_in_place() {
        let b = Fmp4Builder::default();
        let mut moof = b.moof(1, &[(1, 1_000, 90_000), (2, 500, 48_000)]);

        let offsets = HashMap::from([(1u32, 9_000i64), (2u32, -100i64)]);
        let tracks = rewrite_moof(&mut moof, &offsets).unwrap();
        // returned values are the pre-rewrite originals
        assert_eq!(tracks[&1].base_decode_time, 1_000);
        assert_eq!(tracks[&2].base_decode_time, 500);

        // a second read-only pass sees the rewritten values
        let reread = rewrite_moof(&mut moof, &HashMap::new()).unwrap();
        assert_eq!(reread[&1].base_decode_time, 10_000);
        assert_eq!(reread[&2].base_decode_time, 400);
    }

    #[test]
    fn negative_offset_clamps_at_zero() {
        let b = Fmp4Builder::default();
        let mut moof = b.moof(1, &[(1, 100, 90_000)]);
        let offsets = HashMap::from([(1u32, -500i64)]);
        rewrite_moof(&mut moof, &offsets).unwrap();
        let reread = rewrite_moof(&mut moof, &HashMap::new()).unwrap();
        assert_eq!(reread[&1].base_decode_time, 0);
    }

    #[test]
    fn keyframe_flag_from_first_sample() {
        let b = Fmp4Builder::default();
        let key = b.moof_with_key(1, &[(1, 0, 90_000)], true);
        assert_eq!(first_sample_sync(&key), Some(true));

        let non_key = b.moof_with_key(1, &[(1, 0, 90_000)], false);
        assert_eq!(first_sample_sync(&non_key), Some(false));
    }

    #[test]
    fn malformed_moof_is_an_error() {
        let mut bogus = b"\x00\x00\x00\x10moof\x00\x00\x00\x08traf".to_vec();
        assert!(rewrite_moof(&mut bogus, &HashMap::new()).is_err());
    }
}
