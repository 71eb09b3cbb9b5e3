//! Incremental frame decoder.
//!
//! Bytes are fed as they arrive from the wire; decoded frames and
//! diagnostics come out as [`DecodeEvent`]s in arrival order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use serde::Serialize;
use tracing::{debug, warn};

use crate::checksum::{verify_frame, ChecksumFault, ChecksumMode};
use crate::codec::{Frame, HEADER, HEADER_SIZE, MAX_BUFFER_SIZE, TRAILER};

/// With no header anywhere in a buffer larger than this, trim it.
const NO_HEADER_TRIM_THRESHOLD: usize = 1024;
/// Bytes kept after a no-header trim.
const NO_HEADER_KEEP: usize = 512;

/// Decoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Checksum variant configured for the link.
    pub mode: ChecksumMode,
    /// Also accept frames carrying the other checksum variant when their
    /// layout lines up.
    pub accept_alternate: bool,
    /// Receive buffer cap. Default: 2 KiB.
    pub max_buffer: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            mode: ChecksumMode::Crc16Modbus,
            accept_alternate: true,
            max_buffer: MAX_BUFFER_SIZE,
        }
    }
}

impl DecoderConfig {
    pub fn with_mode(mode: ChecksumMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Why bytes were dropped without a checksum verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FramingFault {
    /// Bytes with no frame header were discarded.
    Garbage { discarded: usize },
    /// A header was found but the trailer byte was not where the length
    /// byte says it should be.
    TrailerMismatch { code: u8 },
}

/// One outcome of decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// A frame that passed every integrity check.
    Frame(Frame),
    /// Bytes dropped while resynchronizing.
    Framing(FramingFault),
    /// A complete frame whose checksum failed under every accepted mode.
    Checksum {
        code: u8,
        mode: ChecksumMode,
        fault: ChecksumFault,
    },
    /// The receive buffer would have exceeded its cap and was cleared.
    Overflow { discarded: usize },
}

/// Running decoder counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub bytes_processed: u64,
    pub frames_processed: u64,
    /// Frames accepted under the alternate checksum mode.
    pub alternate_matches: u64,
    pub framing_errors: u64,
    pub checksum_errors: u64,
    pub overflows: u64,
    pub bytes_discarded: u64,
    pub feeds: u64,
    pub total_parse_time: Duration,
}

impl ParseStats {
    /// Mean time spent per `feed` call.
    pub fn avg_parse_time(&self) -> Duration {
        if self.feeds == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_parse_time.as_nanos() / u128::from(self.feeds);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Bytes decoded per second of parse time.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_parse_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_processed as f64 / secs
    }
}

enum Candidate {
    Incomplete,
    Valid(usize),
    BadTrailer,
    BadChecksum(ChecksumFault),
}

/// Decodes frames from an incremental receive buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    cursor: usize,
    config: DecoderConfig,
    events: VecDeque<DecodeEvent>,
    stats: ParseStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl FrameDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(config.max_buffer),
            cursor: 0,
            config,
            events: VecDeque::new(),
            stats: ParseStats::default(),
        }
    }

    pub fn with_mode(mode: ChecksumMode) -> Self {
        Self::new(DecoderConfig::with_mode(mode))
    }

    /// Append wire bytes and decode every complete frame they finish.
    pub fn feed(&mut self, data: &[u8]) {
        let started = Instant::now();
        self.stats.bytes_processed += data.len() as u64;
        self.stats.feeds += 1;

        if self.buf.len() + data.len() > self.config.max_buffer {
            let discarded = self.buf.len() + data.len();
            self.buf.clear();
            self.cursor = 0;
            self.stats.overflows += 1;
            self.stats.bytes_discarded += discarded as u64;
            warn!(discarded, "receive buffer overflow, buffer cleared");
            self.events.push_back(DecodeEvent::Overflow { discarded });
        } else {
            self.buf.extend_from_slice(data);
            self.drain_frames();
        }

        self.stats.total_parse_time += started.elapsed();
    }

    /// Feed bytes and take every event produced so far.
    pub fn decode(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        self.feed(data);
        self.events.drain(..).collect()
    }

    /// Next pending event, oldest first.
    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        self.events.pop_front()
    }

    /// Take all pending events.
    pub fn drain_events(&mut self) -> impl Iterator<Item = DecodeEvent> + '_ {
        self.events.drain(..)
    }

    /// Bytes currently held in the receive buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Offset where the next header scan starts.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn set_mode(&mut self, mode: ChecksumMode) {
        self.config.mode = mode;
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParseStats::default();
    }

    /// Drop buffered bytes and pending events (used when a link reconnects).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
        self.events.clear();
    }

    fn drain_frames(&mut self) {
        loop {
            let Some(pos) = find_header(&self.buf, self.cursor) else {
                if self.buf.len() > NO_HEADER_TRIM_THRESHOLD {
                    // The tail may hold the first half of a header.
                    self.discard(self.buf.len() - NO_HEADER_KEEP);
                    self.cursor = 0;
                } else {
                    self.cursor = self.buf.len().saturating_sub(1);
                }
                return;
            };

            if pos > 0 {
                self.discard(pos);
            }
            self.cursor = 0;

            let primary = self.config.mode;
            let alternate = primary.alternate();

            let p = check(&self.buf, primary);
            if let Candidate::Valid(total) = p {
                self.emit_frame(total, primary);
                continue;
            }

            let a = self
                .config
                .accept_alternate
                .then(|| check(&self.buf, alternate));
            if let Some(Candidate::Valid(total)) = a {
                self.stats.alternate_matches += 1;
                self.emit_frame(total, alternate);
                continue;
            }

            // A longer alternate frame may still complete the candidate.
            let waiting = matches!(
                (&p, &a),
                (Candidate::Incomplete, _)
                    | (Candidate::BadTrailer, Some(Candidate::Incomplete))
                    | (Candidate::BadChecksum(_), Some(Candidate::Incomplete))
            );
            if waiting {
                if let Some(next) = self.find_complete_frame_after(1) {
                    self.discard(next);
                    continue;
                }
                return;
            }

            let code = self.buf[HEADER_SIZE];
            match (p, a) {
                (Candidate::BadChecksum(fault), _) => self.checksum_failure(code, primary, fault),
                (_, Some(Candidate::BadChecksum(fault))) => {
                    self.checksum_failure(code, alternate, fault)
                }
                _ => {
                    self.stats.framing_errors += 1;
                    debug!(code, "trailer mismatch, dropping header byte");
                    self.events
                        .push_back(DecodeEvent::Framing(FramingFault::TrailerMismatch { code }));
                }
            }

            // The next valid frame may start one byte in.
            self.buf.advance(1);
            self.stats.bytes_discarded += 1;
        }
    }

    fn emit_frame(&mut self, total: usize, mode: ChecksumMode) {
        let raw = self.buf.split_to(total).freeze();
        let len = raw[HEADER_SIZE + 1] as usize;
        let payload_start = HEADER_SIZE + 2;
        let frame = Frame {
            code: raw[HEADER_SIZE],
            payload: raw.slice(payload_start..payload_start + len),
            checksum: mode,
        };
        self.stats.frames_processed += 1;
        self.events.push_back(DecodeEvent::Frame(frame));
    }

    fn checksum_failure(&mut self, code: u8, mode: ChecksumMode, fault: ChecksumFault) {
        self.stats.checksum_errors += 1;
        debug!(code, %mode, %fault, "checksum mismatch, dropping header byte");
        self.events
            .push_back(DecodeEvent::Checksum { code, mode, fault });
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.framing_errors += 1;
        self.stats.bytes_discarded += n as u64;
        debug!(discarded = n, "discarding bytes without frame header");
        self.events
            .push_back(DecodeEvent::Framing(FramingFault::Garbage { discarded: n }));
    }

    /// First header at or after `from` that starts a complete, valid frame.
    fn find_complete_frame_after(&self, from: usize) -> Option<usize> {
        let mut start = from;
        while let Some(pos) = find_header(&self.buf, start) {
            let rest = &self.buf[pos..];
            if matches!(check(rest, self.config.mode), Candidate::Valid(_)) {
                return Some(pos);
            }
            if self.config.accept_alternate
                && matches!(check(rest, self.config.mode.alternate()), Candidate::Valid(_))
            {
                return Some(pos);
            }
            start = pos + 1;
        }
        None
    }
}

fn find_header(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(HEADER_SIZE)
        .position(|w| w == HEADER)
        .map(|p| p + from)
}

/// Examine a candidate frame at the start of `buf` (which begins with the
/// header) under one checksum mode.
fn check(buf: &[u8], mode: ChecksumMode) -> Candidate {
    if buf.len() < mode.min_frame_size() {
        return Candidate::Incomplete;
    }
    let total = mode.frame_size(buf[HEADER_SIZE + 1] as usize);
    if buf.len() < total {
        return Candidate::Incomplete;
    }
    if buf[total - 1] != TRAILER {
        return Candidate::BadTrailer;
    }
    match verify_frame(&buf[..total], mode) {
        Ok(()) => Candidate::Valid(total),
        Err(fault) => Candidate::BadChecksum(fault),
    }
}
