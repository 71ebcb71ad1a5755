//! Segment transmuxing into fragmented ISO-BMFF
//!
//! Container-level only: MPEG-TS packets are validated and counted at
//! fragment boundaries (payload-unit starts per PID) and the payload is
//! wrapped in `moof`/`mdat`. Elementary streams are never decoded.

use crate::{types::Segment, Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const PID_NULL: u16 = 0x1fff;

/// Output of one transmuxed segment
#[derive(Debug, Clone, PartialEq)]
pub struct TransmuxOutput {
    /// Initialization segment, present only until it has been emitted once
    pub init: Option<Bytes>,
    /// Media fragment
    pub data: Bytes,
    /// Payload-unit starts seen per PID
    pub boundaries: BTreeMap<u16, usize>,
}

/// Repackages downloaded segments for the buffer sink
pub trait Transmuxer: Send {
    /// MIME type of the produced stream
    fn mime_type(&self) -> &str;

    /// Provide the level's initialization segment (`EXT-X-MAP`)
    fn set_init(&mut self, init: Bytes);

    /// Transmux one segment
    fn push(&mut self, segment: &Segment, data: Bytes) -> Result<TransmuxOutput>;

    /// Forget emitted state so the next push re-emits the init segment
    fn reset(&mut self);
}

/// Choose the transmuxer for a level from its first segment
pub fn transmuxer_for(segment: &Segment, codecs: Option<&str>) -> Box<dyn Transmuxer> {
    let path = segment.uri.path().to_ascii_lowercase();
    if segment.init_uri.is_some() || path.ends_with(".m4s") || path.ends_with(".mp4") {
        Box::new(Fmp4Passthrough::new())
    } else {
        Box::new(TsRemuxer::new(codecs.map(str::to_string)))
    }
}

/// MPEG-TS to fragmented MP4 remuxer
pub struct TsRemuxer {
    codecs: Option<String>,
    init_emitted: bool,
    fragment_sequence: u32,
}

impl TsRemuxer {
    pub fn new(codecs: Option<String>) -> Self {
        Self {
            codecs,
            init_emitted: false,
            fragment_sequence: 0,
        }
    }

    /// Offset of the first sync byte that is followed by another one a packet later
    fn find_sync(data: &[u8]) -> Option<usize> {
        (0..data.len().min(TS_PACKET_SIZE)).find(|&i| {
            data[i] == TS_SYNC_BYTE
                && data
                    .get(i + TS_PACKET_SIZE)
                    .map(|b| *b == TS_SYNC_BYTE)
                    .unwrap_or(data.len() - i == TS_PACKET_SIZE)
        })
    }

    /// Validate packet alignment and count payload-unit starts per PID
    fn scan_packets(data: &[u8]) -> Result<(usize, usize, BTreeMap<u16, usize>)> {
        let start = Self::find_sync(data)
            .ok_or_else(|| Error::Transmux("no MPEG-TS sync byte found".into()))?;
        if start > 0 {
            warn!(skipped = start, "Resynchronised MPEG-TS stream");
        }

        let mut boundaries = BTreeMap::new();
        let mut offset = start;
        while offset + TS_PACKET_SIZE <= data.len() {
            let packet = &data[offset..offset + TS_PACKET_SIZE];
            if packet[0] != TS_SYNC_BYTE {
                return Err(Error::Transmux(format!("lost MPEG-TS sync at offset {offset}")));
            }
            let payload_unit_start = packet[1] & 0x40 != 0;
            let pid = (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2]);
            if payload_unit_start && pid != PID_NULL {
                *boundaries.entry(pid).or_insert(0) += 1;
            }
            offset += TS_PACKET_SIZE;
        }

        let trailing = data.len() - offset;
        if trailing > 0 {
            warn!(trailing, "Dropping partial MPEG-TS packet");
        }
        Ok((start, offset, boundaries))
    }

    fn init_segment(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_box(&mut buf, b"ftyp", |b| {
            b.put_slice(b"iso6");
            b.put_u32(0);
            b.put_slice(b"iso6");
            b.put_slice(b"mp41");
        });
        let codecs = self.codecs.clone().unwrap_or_default();
        write_box(&mut buf, b"moov", |b| {
            write_box(b, b"mvex", |_| {});
            if !codecs.is_empty() {
                // Carry the advertised codecs for the sink's type check
                write_box(b, b"udta", |u| u.put_slice(codecs.as_bytes()));
            }
        });
        buf.freeze()
    }
}

impl Transmuxer for TsRemuxer {
    fn mime_type(&self) -> &str {
        "video/mp4"
    }

    fn set_init(&mut self, _init: Bytes) {
        // TS carries no separate init segment
    }

    fn push(&mut self, segment: &Segment, data: Bytes) -> Result<TransmuxOutput> {
        let (start, end, boundaries) = Self::scan_packets(&data)?;
        if boundaries.is_empty() {
            return Err(Error::Transmux(format!(
                "segment {} carries no payload units",
                segment.number
            )));
        }

        self.fragment_sequence += 1;
        let payload = data.slice(start..end);
        let mut buf = BytesMut::with_capacity(payload.len() + 64);
        let sequence = self.fragment_sequence;
        write_box(&mut buf, b"moof", |b| {
            write_box(b, b"mfhd", |m| {
                m.put_u32(0);
                m.put_u32(sequence);
            });
        });
        write_box(&mut buf, b"mdat", |b| b.put_slice(&payload));

        let init = if self.init_emitted {
            None
        } else {
            self.init_emitted = true;
            Some(self.init_segment())
        };

        debug!(
            segment = segment.number,
            packets = (end - start) / TS_PACKET_SIZE,
            pids = boundaries.len(),
            "Remuxed segment"
        );

        Ok(TransmuxOutput {
            init,
            data: buf.freeze(),
            boundaries,
        })
    }

    fn reset(&mut self) {
        self.init_emitted = false;
        self.fragment_sequence = 0;
    }
}

/// Pass-through for levels already packaged as fragmented MP4
#[derive(Default)]
pub struct Fmp4Passthrough {
    init: Option<Bytes>,
    init_emitted: bool,
}

impl Fmp4Passthrough {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transmuxer for Fmp4Passthrough {
    fn mime_type(&self) -> &str {
        "video/mp4"
    }

    fn set_init(&mut self, init: Bytes) {
        if self.init.as_ref() != Some(&init) {
            self.init = Some(init);
            self.init_emitted = false;
        }
    }

    fn push(&mut self, segment: &Segment, data: Bytes) -> Result<TransmuxOutput> {
        if data.len() < 8 {
            return Err(Error::Transmux(format!(
                "segment {} too short for an ISO-BMFF box",
                segment.number
            )));
        }
        let init = match (&self.init, self.init_emitted) {
            (Some(init), false) => {
                self.init_emitted = true;
                Some(init.clone())
            }
            _ => None,
        };
        Ok(TransmuxOutput {
            init,
            data,
            boundaries: BTreeMap::new(),
        })
    }

    fn reset(&mut self) {
        self.init_emitted = false;
    }
}

/// Write a size-prefixed ISO-BMFF box
fn write_box(buf: &mut BytesMut, kind: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let mut inner = BytesMut::new();
    body(&mut inner);
    buf.put_u32((inner.len() + 8) as u32);
    buf.put_slice(kind);
    buf.put_slice(&inner);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;

    /// `count` TS packets alternating video (0x100) and audio (0x101) PIDs
    pub(crate) fn ts_payload(count: usize) -> Bytes {
        let mut buf = BytesMut::new();
        for i in 0..count {
            let pid: u16 = if i % 2 == 0 { 0x100 } else { 0x101 };
            buf.put_u8(TS_SYNC_BYTE);
            buf.put_u8(0x40 | ((pid >> 8) as u8 & 0x1f));
            buf.put_u8((pid & 0xff) as u8);
            buf.put_u8(0x10);
            buf.put_slice(&[0xffu8; TS_PACKET_SIZE - 4]);
        }
        buf.freeze()
    }

    fn segment(number: u64) -> Segment {
        Segment {
            number,
            uri: Url::parse(&format!("https://ads.test/seg{number}.ts")).unwrap(),
            duration: Duration::from_secs(10),
            start: number as f64 * 10.0,
            init_uri: None,
        }
    }

    #[test]
    fn test_init_emitted_once() {
        let mut remuxer = TsRemuxer::new(Some("avc1.4d401e".into()));
        let first = remuxer.push(&segment(0), ts_payload(4)).unwrap();
        let second = remuxer.push(&segment(1), ts_payload(4)).unwrap();

        assert!(first.init.is_some());
        assert!(second.init.is_none());
        assert_eq!(&first.data[4..8], b"moof");
        assert_eq!(first.boundaries.get(&0x100), Some(&2));
        assert_eq!(first.boundaries.get(&0x101), Some(&2));
    }

    #[test]
    fn test_resync_and_partial_packet() {
        let mut data = BytesMut::new();
        data.put_slice(&[0u8; 5]);
        data.put_slice(&ts_payload(3));
        data.put_slice(&[TS_SYNC_BYTE, 0, 0]);
        let mut remuxer = TsRemuxer::new(None);
        let out = remuxer.push(&segment(0), data.freeze()).unwrap();
        let total: usize = out.boundaries.values().sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_garbage_rejected() {
        let mut remuxer = TsRemuxer::new(None);
        let err = remuxer
            .push(&segment(0), Bytes::from(vec![0u8; 400]))
            .unwrap_err();
        assert!(matches!(err, Error::Transmux(_)));
    }

    #[test]
    fn test_fmp4_passthrough_init() {
        let mut passthrough = Fmp4Passthrough::new();
        passthrough.set_init(Bytes::from_static(b"init-box"));
        let first = passthrough
            .push(&segment(0), Bytes::from_static(b"\0\0\0\x08moof"))
            .unwrap();
        let second = passthrough
            .push(&segment(1), Bytes::from_static(b"\0\0\0\x08moof"))
            .unwrap();
        assert_eq!(first.init, Some(Bytes::from_static(b"init-box")));
        assert!(second.init.is_none());
    }
}
