//! Reassemble protocol frames from a stream of raw bytes.
//!
//! Bytes arrive in arbitrary pieces: a frame may be split over several reads and garbage may sit
//! between frames. The [`StringChunker`] buffers everything it is fed and asks a [`Sieve`] where
//! the complete frames are. Everything the sieve does not recognize is non-data, which is handed
//! to the caller as well, such that every byte is accounted for exactly once. Bytes behind the
//! last frame may still turn into one, so they stay pending until the stream ends, see
//! [`StringChunker::flush_non_data`].

use std::collections::VecDeque;

use regex::bytes::Regex;
use tracing::debug;

use crate::InstrumentError;

/// Compact the buffer once this many bytes are consumed and they make up most of it.
const COMPACT_THRESHOLD: usize = 4096;

/// A function that finds complete frames in a buffer.
///
/// Returns `(start, end)` byte ranges (end exclusive) relative to the buffer it was given. A sieve
/// must be pure: it is called over and over again on a growing buffer. Ranges that are empty or
/// that reach past the end of the buffer are ignored, the order does not matter.
///
/// Any `Fn(&[u8]) -> Vec<(usize, usize)>` is a sieve.
pub trait Sieve: Send + Sync {
    /// Find the frames in `buffer`.
    fn sieve(&self, buffer: &[u8]) -> Vec<(usize, usize)>;
}

impl<F> Sieve for F
where
    F: Fn(&[u8]) -> Vec<(usize, usize)> + Send + Sync,
{
    fn sieve(&self, buffer: &[u8]) -> Vec<(usize, usize)> {
        self(buffer)
    }
}

/// A sieve built from regular expressions, one per frame type.
///
/// Matches of all patterns are collected. Where matches overlap, the one starting first wins and,
/// for matches starting at the same byte, the longer one.
#[derive(Debug, Clone)]
pub struct RegexSieve {
    patterns: Vec<Regex>,
}

impl RegexSieve {
    /// Compile the given patterns into a sieve.
    ///
    /// Fails with [`InstrumentError::Config`] if a pattern does not compile.
    pub fn new(patterns: &[&str]) -> Result<Self, InstrumentError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    InstrumentError::Config(format!("Invalid frame pattern '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegexSieve { patterns })
    }
}

impl Sieve for RegexSieve {
    fn sieve(&self, buffer: &[u8]) -> Vec<(usize, usize)> {
        let mut matches: Vec<(usize, usize)> = self
            .patterns
            .iter()
            .flat_map(|re| re.find_iter(buffer).map(|m| (m.start(), m.end())))
            .filter(|(start, end)| end > start)
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(matches.len());
        for (start, end) in matches {
            match spans.last() {
                Some(&(_, last_end)) if start < last_end => continue,
                _ => spans.push((start, end)),
            }
        }
        spans
    }
}

/// What a [`RawSpan`] contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// A frame recognized by the sieve.
    Data,
    /// Bytes that are not part of a recognized frame.
    NonData,
}

/// A range of bytes in the chunker, counted from the first byte the chunker was ever fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSpan {
    /// Offset of the first byte.
    pub start: usize,
    /// Offset one past the last byte.
    pub end: usize,
    /// Frame or noise.
    pub kind: SpanKind,
}

impl RawSpan {
    /// Number of bytes in the span.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// `true` if the span contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Non-data that was skipped by [`StringChunker::get_next_data`] and not yet reported.
#[derive(Debug)]
struct Skipped {
    timestamp: f64,
    bytes: Vec<u8>,
    start: usize,
    end: usize,
}

/// Buffer raw bytes and hand them out again as frames and non-data.
///
/// All offsets the chunker reports are absolute, i.e., counted from the first byte ever fed to
/// it. Timestamps are attached per [`StringChunker::add_chunk`] call: a frame or non-data run gets
/// the timestamp of the chunk its first byte arrived with.
///
/// # Example
///
/// ```
/// use protocolrs::{RegexSieve, StringChunker};
///
/// let sieve = RegexSieve::new(&[r"#\d+\r\n"]).unwrap();
/// let mut chunker = StringChunker::new(sieve);
///
/// chunker.add_chunk(b"xx#12", 1.0);
/// assert!(chunker.get_next_data(false).is_none());
///
/// chunker.add_chunk(b"34\r\n", 2.0);
/// let (timestamp, frame) = chunker.get_next_data(false).unwrap();
/// assert_eq!(timestamp, 1.0);
/// assert_eq!(frame, b"#1234\r\n");
///
/// let (_, noise, start, end) = chunker.get_next_non_data().unwrap();
/// assert_eq!((noise.as_slice(), start, end), (b"xx".as_slice(), 0, 2));
/// ```
pub struct StringChunker {
    sieve: Box<dyn Sieve>,
    buffer: Vec<u8>,
    /// Absolute offset of `buffer[0]`.
    origin: usize,
    /// Absolute offset of the first byte not handed out yet.
    consumed: usize,
    /// Absolute offset of the first byte of each chunk with its timestamp, oldest first.
    timestamps: VecDeque<(usize, f64)>,
    skipped: VecDeque<Skipped>,
}

impl StringChunker {
    /// Create a new, empty chunker that finds frames with the given sieve.
    pub fn new<S: Sieve + 'static>(sieve: S) -> Self {
        StringChunker {
            sieve: Box::new(sieve),
            buffer: Vec::new(),
            origin: 0,
            consumed: 0,
            timestamps: VecDeque::new(),
            skipped: VecDeque::new(),
        }
    }

    /// Append received bytes.
    ///
    /// # Arguments
    /// * `bytes` - The bytes as they were received.
    /// * `timestamp` - When they were received.
    pub fn add_chunk(&mut self, bytes: &[u8], timestamp: f64) {
        if bytes.is_empty() {
            return;
        }
        self.timestamps.push_back((self.end_offset(), timestamp));
        self.buffer.extend_from_slice(bytes);
    }

    /// Get the next complete frame with the timestamp of its first byte.
    ///
    /// Bytes in front of the frame are consumed as well. If `clean` is `true` they are dropped,
    /// otherwise they are kept and reported by the next calls to
    /// [`StringChunker::get_next_non_data`].
    pub fn get_next_data(&mut self, clean: bool) -> Option<(f64, Vec<u8>)> {
        self.get_next_data_with_index(clean)
            .map(|(timestamp, frame, _, _)| (timestamp, frame))
    }

    /// Like [`StringChunker::get_next_data`], but also returns the absolute start and end offset
    /// of the frame.
    pub fn get_next_data_with_index(
        &mut self,
        clean: bool,
    ) -> Option<(f64, Vec<u8>, usize, usize)> {
        let (start, end) = self.next_frame()?;

        if start > self.consumed {
            if clean {
                debug!(bytes = start - self.consumed, "dropping non-data in front of frame");
            } else {
                self.skipped.push_back(Skipped {
                    timestamp: self.timestamp_at(self.consumed),
                    bytes: self.slice(self.consumed, start).to_vec(),
                    start: self.consumed,
                    end: start,
                });
            }
        }

        let timestamp = self.timestamp_at(start);
        let frame = self.slice(start, end).to_vec();
        self.consume_to(end);
        Some((timestamp, frame, start, end))
    }

    /// Get the next run of bytes that is not part of a frame.
    ///
    /// Returns the timestamp, the bytes, and their absolute start and end offset. Non-data that
    /// [`StringChunker::get_next_data`] skipped over is reported first. Otherwise, these are the
    /// bytes in front of the next frame. Without a frame behind them, pending bytes may be the
    /// start of a frame that is still being received: they are kept and `None` is returned.
    pub fn get_next_non_data(&mut self) -> Option<(f64, Vec<u8>, usize, usize)> {
        if let Some(skipped) = self.skipped.pop_front() {
            return Some((skipped.timestamp, skipped.bytes, skipped.start, skipped.end));
        }
        let (start, _) = self.next_frame()?;
        self.take_non_data(start)
    }

    /// Like [`StringChunker::get_next_non_data`], but at the end of the stream: pending bytes
    /// without a frame behind them are returned as well.
    ///
    /// Call it once no more bytes will be added, after all frames were taken. If the next pending
    /// byte starts a frame, `None` is returned and the frame stays pending.
    pub fn flush_non_data(&mut self) -> Option<(f64, Vec<u8>, usize, usize)> {
        if let Some(skipped) = self.skipped.pop_front() {
            return Some((skipped.timestamp, skipped.bytes, skipped.start, skipped.end));
        }
        let end = match self.next_frame() {
            Some((start, _)) => start,
            None => self.end_offset(),
        };
        self.take_non_data(end)
    }

    /// Classify the pending bytes into frames and non-data without consuming anything.
    ///
    /// Non-data skipped by [`StringChunker::get_next_data`] but not reported yet is not included.
    /// Trailing bytes after the last frame are listed as non-data.
    pub fn spans(&self) -> Vec<RawSpan> {
        let mut spans = Vec::new();
        let mut pos = self.consumed;
        for (start, end) in self.frames() {
            if start > pos {
                spans.push(RawSpan {
                    start: pos,
                    end: start,
                    kind: SpanKind::NonData,
                });
            }
            spans.push(RawSpan {
                start,
                end,
                kind: SpanKind::Data,
            });
            pos = end;
        }
        if self.end_offset() > pos {
            spans.push(RawSpan {
                start: pos,
                end: self.end_offset(),
                kind: SpanKind::NonData,
            });
        }
        spans
    }

    /// Number of bytes that were fed but not handed out yet.
    pub fn pending_len(&self) -> usize {
        self.end_offset() - self.consumed
            + self.skipped.iter().map(|s| s.bytes.len()).sum::<usize>()
    }

    /// Drop everything that is buffered. Offsets keep counting from where they are.
    pub fn clear(&mut self) {
        self.consumed = self.end_offset();
        self.skipped.clear();
        self.compact();
    }

    fn take_non_data(&mut self, end: usize) -> Option<(f64, Vec<u8>, usize, usize)> {
        if end <= self.consumed {
            return None;
        }
        let start = self.consumed;
        let timestamp = self.timestamp_at(start);
        let bytes = self.slice(start, end).to_vec();
        self.consume_to(end);
        Some((timestamp, bytes, start, end))
    }

    /// Absolute offset one past the last byte fed so far.
    fn end_offset(&self) -> usize {
        self.origin + self.buffer.len()
    }

    fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.buffer[start - self.origin..end - self.origin]
    }

    /// Valid frames in the pending bytes, as absolute offsets, sorted and without overlaps.
    fn frames(&self) -> Vec<(usize, usize)> {
        let pending = self.slice(self.consumed, self.end_offset());
        let mut spans: Vec<(usize, usize)> = self
            .sieve
            .sieve(pending)
            .into_iter()
            .filter(|(start, end)| start < end && *end <= pending.len())
            .collect();
        spans.sort_unstable();

        let mut frames: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            let (start, end) = (start + self.consumed, end + self.consumed);
            match frames.last() {
                Some(&(_, last_end)) if start < last_end => continue,
                _ => frames.push((start, end)),
            }
        }
        frames
    }

    fn next_frame(&self) -> Option<(usize, usize)> {
        self.frames().into_iter().next()
    }

    fn timestamp_at(&self, offset: usize) -> f64 {
        self.timestamps
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .or_else(|| self.timestamps.front())
            .map(|(_, timestamp)| *timestamp)
            .unwrap_or_default()
    }

    fn consume_to(&mut self, offset: usize) {
        self.consumed = offset;
        // Keep the timestamp of the chunk the next pending byte belongs to.
        while self.timestamps.len() > 1 && self.timestamps[1].0 <= self.consumed {
            self.timestamps.pop_front();
        }
        self.compact();
    }

    fn compact(&mut self) {
        let consumed = self.consumed - self.origin;
        if consumed == self.buffer.len()
            || (consumed >= COMPACT_THRESHOLD && consumed * 2 > self.buffer.len())
        {
            self.buffer.drain(..consumed);
            self.origin = self.consumed;
        }
        if self.buffer.is_empty() {
            self.timestamps.clear();
        }
    }
}
