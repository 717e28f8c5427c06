//! Frame codec
//!
//! Turns payloads into wire frames and reassembles frames from arbitrarily
//! chunked input.
//!
//! # Wire Format
//!
//! ```text
//! [start][length][payload][checksum][0x03]
//! ```
//!
//! | start | length field | payload length |
//! |-------|--------------|----------------|
//! | 0x02  | u8           | 1..=255        |
//! | 0x03  | u16 BE       | 255..=65535    |
//! | 0x04  | u24 BE       | >= 65535       |
//!
//! The checksum covers only the payload and is big-endian. The default is
//! CRC-16/XMODEM, which is what the motor controller firmware speaks.
//!
//! # Resynchronization
//!
//! A candidate frame that fails its checksum or end marker is skipped one byte
//! at a time. An incomplete candidate at the head of the buffer is always
//! waited for while bytes keep arriving, so the decoded output depends only on
//! the byte sequence and never on how it was chunked. Once the link has been
//! silent for the byte timeout, [`FrameCodec::expire_stale`] treats the head
//! as a false start and drops it one byte at a time, delivering any complete
//! frames that were buffered behind a corrupted length field.

use crate::config::FramingConfig;
use crate::error::{LinkError, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_XMODEM, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Start marker for frames with an 8-bit length
pub const START_SHORT: u8 = 0x02;
/// Start marker for frames with a 16-bit length
pub const START_LONG: u8 = 0x03;
/// Start marker for frames with a 24-bit length
pub const START_HUGE: u8 = 0x04;
/// End marker of every frame
pub const END_MARKER: u8 = 0x03;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum appended to each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Checksum {
    /// CRC-16/XMODEM, 2 bytes
    #[default]
    Crc16,
    /// CRC-32C (Castagnoli), 4 bytes
    Crc32c,
}

impl Checksum {
    /// Width on the wire in bytes
    pub fn width(&self) -> usize {
        match self {
            Checksum::Crc16 => 2,
            Checksum::Crc32c => 4,
        }
    }

    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            Checksum::Crc16 => CRC16.checksum(data) as u32,
            Checksum::Crc32c => CRC32C.checksum(data),
        }
    }

    fn put(&self, out: &mut BytesMut, value: u32) {
        match self {
            Checksum::Crc16 => out.put_u16(value as u16),
            Checksum::Crc32c => out.put_u32(value),
        }
    }

    fn read(&self, data: &[u8]) -> u32 {
        data[..self.width()]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32)
    }
}

/// CRC-16/XMODEM over `data`, as used by firmware image headers
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Codec counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub checksum_failures: u64,
    pub bytes_discarded: u64,
    pub stale_resets: u64,
    pub quality_warnings: u64,
}

enum Candidate {
    /// Not a plausible frame start
    NotStart,
    /// Plausible start, more bytes required
    NeedMore,
    /// Complete but the checksum or end marker is wrong
    Corrupt { expected: u32, actual: u32 },
    /// Valid frame; payload is `header..header + len`
    Frame { header: usize, len: usize, total: usize },
}

fn is_start(b: u8) -> bool {
    matches!(b, START_SHORT | START_LONG | START_HUGE)
}

/// Stateful encoder/decoder for one link
#[derive(Debug)]
pub struct FrameCodec {
    checksum: Checksum,
    max_payload_len: usize,
    buffer_cap: usize,
    byte_timeout: Duration,
    warning_threshold: u32,
    buf: BytesMut,
    last_rx: Option<Instant>,
    consecutive_failures: u32,
    pending_warning: Option<u32>,
    stats: CodecStats,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&FramingConfig::default())
    }
}

impl FrameCodec {
    /// Create a codec from the framing configuration
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            checksum: config.checksum,
            max_payload_len: config.max_payload_len,
            buffer_cap: config.buffer_cap,
            byte_timeout: Duration::from_millis(config.byte_timeout_ms),
            warning_threshold: config.checksum_warning_threshold.max(1),
            buf: BytesMut::with_capacity(1024),
            last_rx: None,
            consecutive_failures: 0,
            pending_warning: None,
            stats: CodecStats::default(),
        }
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn stats(&self) -> &CodecStats {
        &self.stats
    }

    /// Number of bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop partial data and failure counters, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_rx = None;
        self.consecutive_failures = 0;
        self.pending_warning = None;
    }

    /// Frame one payload
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let len = payload.len();
        if len == 0 {
            return Err(LinkError::InvalidPayload("empty payload".to_string()));
        }
        if len > self.max_payload_len || len > 0xFF_FFFF {
            return Err(LinkError::InvalidPayload(format!(
                "payload of {} bytes exceeds limit of {}",
                len, self.max_payload_len
            )));
        }

        let mut out = BytesMut::with_capacity(len + 5 + self.checksum.width());
        if len <= 0xFF {
            out.put_u8(START_SHORT);
            out.put_u8(len as u8);
        } else if len <= 0xFFFF {
            out.put_u8(START_LONG);
            out.put_u16(len as u16);
        } else {
            out.put_u8(START_HUGE);
            out.put_u8((len >> 16) as u8);
            out.put_u16(len as u16);
        }
        out.put_slice(payload);
        self.checksum.put(&mut out, self.checksum.compute(payload));
        out.put_u8(END_MARKER);

        self.stats.frames_encoded += 1;
        Ok(out.to_vec())
    }

    /// Feed received bytes and collect every payload completed by them
    ///
    /// Returns [`LinkError::FrameOverflow`] if the undecoded remainder exceeds
    /// the buffer cap; the buffer is cleared in that case.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.last_rx = Some(Instant::now());
        self.buf.extend_from_slice(data);

        let mut payloads = Vec::new();
        self.drain(&mut payloads, false);

        if self.buf.len() > self.buffer_cap {
            let buffered = self.buf.len();
            self.stats.bytes_discarded += buffered as u64;
            self.buf.clear();
            tracing::error!("Frame buffer overflow: {} bytes (cap {})", buffered, self.buffer_cap);
            return Err(LinkError::FrameOverflow {
                buffered,
                cap: self.buffer_cap,
            });
        }

        Ok(payloads)
    }

    /// Take the transport quality warning raised by repeated checksum failures
    ///
    /// Returns the number of consecutive failures that triggered it.
    pub fn take_quality_warning(&mut self) -> Option<u32> {
        self.pending_warning.take()
    }

    /// Flush partial data that has not been extended within the byte timeout
    ///
    /// Incomplete candidates are dropped as false starts and any complete
    /// frames buffered behind them are returned. Returns `None` if nothing was
    /// stale; otherwise the buffer is empty afterwards.
    pub fn expire_stale(&mut self, now: Instant) -> Option<Vec<Vec<u8>>> {
        match self.last_rx {
            Some(last) if !self.buf.is_empty() && now.duration_since(last) >= self.byte_timeout => {
                tracing::debug!("Flushing {} stale bytes", self.buf.len());
                let mut payloads = Vec::new();
                self.drain(&mut payloads, true);
                self.stats.stale_resets += 1;
                Some(payloads)
            }
            _ => None,
        }
    }

    /// Decode frames from the head of the buffer
    ///
    /// Stops at an incomplete candidate unless `flush` is set, in which case
    /// the candidate's start byte is dropped and decoding continues.
    fn drain(&mut self, payloads: &mut Vec<Vec<u8>>, flush: bool) {
        loop {
            match self.buf.iter().position(|&b| is_start(b)) {
                Some(0) => {}
                Some(n) => self.discard(n),
                None => {
                    let n = self.buf.len();
                    self.discard(n);
                    break;
                }
            }

            match self.inspect(&self.buf) {
                Candidate::NotStart => self.discard(1),
                Candidate::NeedMore if flush => self.discard(1),
                Candidate::NeedMore => break,
                Candidate::Corrupt { expected, actual } => {
                    tracing::trace!(
                        "Frame check failed (expected 0x{:X}, got 0x{:X}), resyncing",
                        expected,
                        actual
                    );
                    self.record_failure();
                    self.discard(1);
                }
                Candidate::Frame { header, len, total } => {
                    payloads.push(self.buf[header..header + len].to_vec());
                    self.buf.advance(total);
                    self.consecutive_failures = 0;
                    self.stats.frames_decoded += 1;
                }
            }
        }
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.bytes_discarded += n as u64;
    }

    fn record_failure(&mut self) {
        self.stats.checksum_failures += 1;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.warning_threshold {
            tracing::warn!(
                "{} consecutive frame check failures, link quality is poor",
                self.consecutive_failures
            );
            self.pending_warning = Some(self.consecutive_failures);
            self.stats.quality_warnings += 1;
            self.consecutive_failures = 0;
        }
    }

    fn inspect(&self, data: &[u8]) -> Candidate {
        let Some(&marker) = data.first() else {
            return Candidate::NeedMore;
        };
        let (len_bytes, min_len) = match marker {
            START_SHORT => (1, 1),
            START_LONG => (2, 255),
            START_HUGE => (3, 65535),
            _ => return Candidate::NotStart,
        };
        if data.len() < 1 + len_bytes {
            return Candidate::NeedMore;
        }

        let len = data[1..1 + len_bytes]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        if len < min_len || len > self.max_payload_len {
            return Candidate::NotStart;
        }

        let header = 1 + len_bytes;
        let width = self.checksum.width();
        let total = header + len + width + 1;
        if data.len() < total {
            return Candidate::NeedMore;
        }

        let payload = &data[header..header + len];
        let actual = self.checksum.read(&data[header + len..]);
        if data[total - 1] != END_MARKER {
            return Candidate::Corrupt {
                expected: self.checksum.compute(payload),
                actual,
            };
        }
        let expected = self.checksum.compute(payload);
        if expected != actual {
            return Candidate::Corrupt { expected, actual };
        }

        Candidate::Frame { header, len, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn test_get_values_frame_is_bit_exact() {
        let mut c = codec();
        assert_eq!(c.encode(&[0x04]).unwrap(), vec![0x02, 0x01, 0x04, 0x40, 0x84, 0x03]);
        assert_eq!(c.encode(&[0x00]).unwrap(), vec![0x02, 0x01, 0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_length_form_selection() {
        let mut c = codec();
        assert_eq!(c.encode(&[7u8; 255]).unwrap()[0], START_SHORT);
        let long = c.encode(&[7u8; 256]).unwrap();
        assert_eq!(&long[..3], &[START_LONG, 0x01, 0x00]);
        assert_eq!(long.len(), 256 + 3 + 2 + 1);
    }

    #[test]
    fn test_empty_and_oversized_payloads_rejected() {
        let mut c = FrameCodec::new(&FramingConfig {
            max_payload_len: 16,
            ..FramingConfig::default()
        });
        assert!(matches!(c.encode(&[]), Err(LinkError::InvalidPayload(_))));
        assert!(matches!(c.encode(&[0u8; 17]), Err(LinkError::InvalidPayload(_))));
    }

    #[test]
    fn test_zero_length_frame_is_skipped() {
        let mut c = codec();
        let good = c.encode(b"ok").unwrap();
        let mut input = vec![START_SHORT, 0x00, 0x00, 0x00, END_MARKER];
        input.extend_from_slice(&good);
        assert_eq!(c.feed(&input).unwrap(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut c = codec();
        let frame = c.encode(b"hello").unwrap();
        assert!(c.feed(&frame[..4]).unwrap().is_empty());
        assert_eq!(c.buffered(), 4);
        assert_eq!(c.feed(&frame[4..]).unwrap(), vec![b"hello".to_vec()]);
        assert_eq!(c.buffered(), 0);
    }

    #[test]
    fn test_garbage_between_frames_is_discarded() {
        let mut c = codec();
        let a = c.encode(b"first").unwrap();
        let b = c.encode(b"second").unwrap();
        let mut input = vec![0xFF, 0x00, 0x99];
        input.extend_from_slice(&a);
        input.extend_from_slice(&[0x10, 0x20]);
        input.extend_from_slice(&b);
        let out = c.feed(&input).unwrap();
        assert_eq!(out, vec![b"first".to_vec(), b"second".to_vec()]);
        assert!(c.stats().bytes_discarded >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_length_recovers_after_silence() {
        let mut c = codec();
        let mut a = c.encode(&[0x11; 20]).unwrap();
        let b = c.encode(b"next").unwrap();
        // declared length now points far past the buffered data
        a[1] = 0xF0;
        let mut input = a;
        input.extend_from_slice(&b);
        assert!(c.feed(&input).unwrap().is_empty());
        assert_eq!(c.expire_stale(Instant::now()), None);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(c.expire_stale(Instant::now()), Some(vec![b"next".to_vec()]));
        assert_eq!(c.buffered(), 0);
        assert_eq!(c.stats().stale_resets, 1);
    }

    #[test]
    fn test_embedded_frame_split_matches_whole_feed() {
        let mut c = codec();
        let inner = c.encode(b"hi").unwrap();
        let mut outer = vec![0x20];
        outer.extend_from_slice(&inner);
        outer.extend_from_slice(&[0x55; 10]);
        let mut wire = c.encode(&outer).unwrap();
        wire.extend(c.encode(b"tail").unwrap());

        let expected = vec![outer, b"tail".to_vec()];
        assert_eq!(codec().feed(&wire).unwrap(), expected);

        // first chunk ends right after the embedded frame
        let at = 3 + inner.len();
        let mut split = codec();
        let mut out = split.feed(&wire[..at]).unwrap();
        assert!(out.is_empty());
        out.extend(split.feed(&wire[at..]).unwrap());
        assert_eq!(out, expected);
    }

    #[test]
    fn test_quality_warning_after_threshold() {
        let mut c = FrameCodec::new(&FramingConfig {
            checksum_warning_threshold: 3,
            ..FramingConfig::default()
        });
        let mut bad = c.encode(b"abcde").unwrap();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        c.feed(&bad).unwrap();
        c.feed(&bad).unwrap();
        assert_eq!(c.take_quality_warning(), None);
        c.feed(&bad).unwrap();
        assert_eq!(c.take_quality_warning(), Some(3));
        assert_eq!(c.take_quality_warning(), None);
        assert_eq!(c.stats().quality_warnings, 1);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut c = FrameCodec::new(&FramingConfig {
            max_payload_len: 4096,
            buffer_cap: 64,
            ..FramingConfig::default()
        });
        let mut input = vec![START_LONG, 0x02, 0x00];
        input.extend_from_slice(&[0x55; 100]);
        let err = c.feed(&input).unwrap_err();
        assert!(matches!(err, LinkError::FrameOverflow { cap: 64, .. }));
        assert_eq!(c.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partial_frame_expires() {
        let mut c = codec();
        let frame = c.encode(b"late").unwrap();
        c.feed(&frame[..3]).unwrap();
        assert_eq!(c.expire_stale(Instant::now()), None);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(c.expire_stale(Instant::now()), Some(Vec::new()));
        assert_eq!(c.buffered(), 0);
        assert_eq!(c.expire_stale(Instant::now()), None);
        assert_eq!(c.feed(&frame).unwrap(), vec![b"late".to_vec()]);
    }

    #[test]
    fn test_crc32c_checksum_round_trip() {
        let mut c = FrameCodec::new(&FramingConfig {
            checksum: Checksum::Crc32c,
            ..FramingConfig::default()
        });
        let frame = c.encode(b"castagnoli").unwrap();
        assert_eq!(frame.len(), 2 + 10 + 4 + 1);
        assert_eq!(c.feed(&frame).unwrap(), vec![b"castagnoli".to_vec()]);
    }

    proptest! {
        #[test]
        fn prop_round_trip(payload in prop::collection::vec(any::<u8>(), 1..=65535usize)) {
            let mut c = codec();
            let frame = c.encode(&payload).unwrap();
            prop_assert_eq!(c.feed(&frame).unwrap(), vec![payload]);
        }

        #[test]
        fn prop_chunk_boundary_independence(
            a in prop::collection::vec(any::<u8>(), 1..600),
            b in prop::collection::vec(any::<u8>(), 1..600),
            split in any::<prop::sample::Index>(),
        ) {
            let mut c = codec();
            let mut wire = c.encode(&a).unwrap();
            wire.extend(c.encode(&b).unwrap());

            let whole = codec().feed(&wire).unwrap();

            let at = split.index(wire.len() + 1);
            let mut split_codec = codec();
            let mut pieces = split_codec.feed(&wire[..at]).unwrap();
            pieces.extend(split_codec.feed(&wire[at..]).unwrap());

            prop_assert_eq!(&pieces, &whole);
            prop_assert_eq!(pieces, vec![a, b]);
        }

        #[test]
        fn prop_single_corruption_drops_one_frame(
            a in prop::collection::vec(any::<u8>(), 1..300),
            b in prop::collection::vec(any::<u8>(), 1..300),
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut c = codec();
            let mut first = c.encode(&a).unwrap();
            let at = pos.index(first.len());
            first[at] ^= flip;
            let mut wire = first;
            wire.extend(c.encode(&b).unwrap());

            let mut c = codec();
            let mut out = c.feed(&wire).unwrap();
            // a corrupted length may hold the rest back until the link goes quiet
            let quiet = Instant::now() + Duration::from_secs(10);
            out.extend(c.expire_stale(quiet).unwrap_or_default());
            prop_assert_eq!(out, vec![b]);
        }
    }
}
