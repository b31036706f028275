use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use mp4_atom::{Atom, DecodeMaybe, Ftyp, Header, Mdat, Moof, Moov};

pub mod fragment;

/// A complete top-level box, raw bytes including the header.
#[derive(Debug, Clone)]
pub struct Mp4Box {
    pub kind: mp4_atom::FourCC,
    pub data: Bytes,
}

impl Mp4Box {
    pub fn is_ftyp(&self) -> bool {
        self.kind == Ftyp::KIND
    }

    pub fn is_moov(&self) -> bool {
        self.kind == Moov::KIND
    }

    pub fn is_moof(&self) -> bool {
        self.kind == Moof::KIND
    }

    pub fn is_mdat(&self) -> bool {
        self.kind == Mdat::KIND
    }
}

/// Incremental top-level MP4 box parser.
///
/// Bytes arrive in arbitrary chunks from the capture stream; complete boxes
/// come out with their raw bytes intact so downstream can pass them through
/// untouched. Handles both 32-bit and 64-bit box sizes.
pub struct BoxReader {
    buffer: BytesMut,
}

impl Default for BoxReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.buffer.put(data);
        }
    }

    /// Number of buffered bytes not yet framed into a box.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete top-level box, or `None` if more data is needed.
    pub fn next(&mut self) -> Result<Option<Mp4Box>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(&self.buffer[..]);
        let header = match Header::decode_maybe(&mut cursor)? {
            Some(header) => header,
            None => return Ok(None), // need more data for the header
        };
        let header_size = cursor.position() as usize;

        // Header.size is the payload size; an indeterminate size (0 = "to end
        // of file") never terminates on a live stream.
        let payload_size = match header.size {
            Some(s) => s,
            None => bail!("indeterminate box size in live stream"),
        };
        let total_size = header_size + payload_size;

        if self.buffer.len() < total_size {
            return Ok(None);
        }

        let data = self.buffer.split_to(total_size).freeze();
        Ok(Some(Mp4Box {
            kind: header.kind,
            data,
        }))
    }
}

/// Payload span of the box at the start of `data`: (kind, start, end).
///
/// `end` is bounded by the declared box size, so trailing bytes (say an mdat
/// concatenated after a moof) are never walked as children.
pub(crate) fn box_payload(data: &[u8]) -> Result<(mp4_atom::FourCC, usize, usize)> {
    let mut cursor = std::io::Cursor::new(data);
    let header = match Header::decode_maybe(&mut cursor)? {
        Some(h) => h,
        None => bail!("truncated box header"),
    };
    let start = cursor.position() as usize;
    let end = match header.size {
        Some(s) => start + s,
        None => data.len(),
    };
    if end > data.len() {
        bail!("box {} overruns buffer", header.kind);
    }
    Ok((header.kind, start, end))
}

/// Child box payload spans within a container payload, relative to `data`.
pub(crate) fn child_spans(data: &[u8]) -> Result<Vec<(mp4_atom::FourCC, usize, usize)>> {
    let mut spans = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let mut cursor = std::io::Cursor::new(&data[pos..]);
        let header = match Header::decode_maybe(&mut cursor)? {
            Some(h) => h,
            None => bail!("truncated child box at offset {}", pos),
        };
        let header_size = cursor.position() as usize;
        let payload_size = match header.size {
            Some(s) => s,
            None => data.len() - pos - header_size,
        };
        let start = pos + header_size;
        let end = start + payload_size;
        if end > data.len() {
            bail!("child box {} overruns container", header.kind);
        }
        spans.push((header.kind, start, end));
        pos = end;
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    fn raw_box64(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(&((payload.len() + 16) as u64).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn partial_header_needs_more_data() {
        let mut reader = BoxReader::new();
        reader.push(&16u32.to_be_bytes());
        assert!(reader.next().unwrap().is_none());

        reader.push(b"moof");
        // header complete, 8 payload bytes still missing
        assert!(reader.next().unwrap().is_none());

        reader.push(&[0u8; 8]);
        let b = reader.next().unwrap().expect("complete box");
        assert!(b.is_moof());
        assert_eq!(b.data.len(), 16);
    }

    #[test]
    fn split_payload_reassembles() {
        let raw = raw_box(b"free", b"0123456789");
        let mut reader = BoxReader::new();
        reader.push(&raw[..11]);
        assert!(reader.next().unwrap().is_none());
        reader.push(&raw[11..]);
        let b = reader.next().unwrap().expect("complete box");
        assert_eq!(&b.data[..], &raw[..]);
    }

    #[test]
    fn large_size_box() {
        let raw = raw_box64(b"mdat", &[7u8; 32]);
        let mut reader = BoxReader::new();
        reader.push(&raw);
        let b = reader.next().unwrap().expect("complete box");
        assert!(b.is_mdat());
        assert_eq!(b.data.len(), raw.len());
    }

    #[test]
    fn multiple_boxes_in_one_push() {
        let mut raw = raw_box(b"ftyp", b"iso5\x00\x00\x00\x00");
        raw.extend_from_slice(&raw_box(b"free", b"abcd"));
        let mut reader = BoxReader::new();
        reader.push(&raw);

        let first = reader.next().unwrap().expect("ftyp");
        assert!(first.is_ftyp());
        let second = reader.next().unwrap().expect("free");
        assert_eq!(second.kind, mp4_atom::Free::KIND);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn raw_bytes_round_trip() {
        // parser ∘ serializer must be the identity on well-formed input
        let mut raw = raw_box(b"ftyp", b"iso5\x00\x00\x00\x01");
        raw.extend_from_slice(&raw_box(b"moov", &raw_box(b"mvhd", &[0u8; 20])));
        raw.extend_from_slice(&raw_box64(b"mdat", &[3u8; 64]));

        let mut reader = BoxReader::new();
        reader.push(&raw);
        let mut out = Vec::new();
        while let Some(b) = reader.next().unwrap() {
            out.extend_from_slice(&b.data);
        }
        assert_eq!(out, raw);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn child_spans_walk() {
        let mut payload = raw_box(b"tkhd", &[0u8; 20]);
        payload.extend_from_slice(&raw_box(b"mdia", b""));
        let spans = child_spans(&payload).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].1, 8);
        assert_eq!(spans[0].2, 28);
    }
}
