//! Tests for reassembling frames with the StringChunker.

use rstest::*;

use protocolrs::{RawSpan, RegexSieve, SpanKind, StringChunker};

/// Build a frame `$<payload>*<checksum>\r\n` where the checksum is the XOR of the payload bytes.
fn frame(payload: &str) -> Vec<u8> {
    let checksum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${payload}*{checksum:02X}\r\n").into_bytes()
}

/// Find all frames with a valid checksum. Frames with a wrong checksum are not frames.
fn checksum_sieve(buffer: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(offset) = buffer[pos..].iter().position(|b| *b == b'$') {
        let start = pos + offset;
        pos = start + 1;
        let Some(star) = buffer[start..].iter().position(|b| *b == b'*') else {
            break;
        };
        let star = start + star;
        let end = star + 5;
        if end > buffer.len() || &buffer[star + 3..end] != b"\r\n" {
            continue;
        }
        let checksum = buffer[start + 1..star].iter().fold(0u8, |acc, b| acc ^ b);
        let given = std::str::from_utf8(&buffer[star + 1..star + 3])
            .ok()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        if given == Some(checksum) {
            spans.push((start, end));
            pos = end;
        }
    }
    spans
}

#[fixture]
fn chunker() -> StringChunker {
    StringChunker::new(checksum_sieve)
}

/// Noise in front of and behind a frame is reported as non-data, the frame as data.
#[rstest]
fn frame_between_noise(mut chunker: StringChunker) {
    let frame = frame("TEMP,21.5");
    let mut stream = b"AB".to_vec();
    stream.extend_from_slice(&frame);
    stream.extend_from_slice(b"CD");
    chunker.add_chunk(&stream, 10.0);

    let (_, noise, start, end) = chunker.get_next_non_data().unwrap();
    assert_eq!((noise.as_slice(), start, end), (b"AB".as_slice(), 0, 2));

    let (timestamp, data) = chunker.get_next_data(false).unwrap();
    assert_eq!(timestamp, 10.0);
    assert_eq!(data, frame);

    // "CD" could still become a frame until the stream ends.
    assert!(chunker.get_next_non_data().is_none());
    assert_eq!(chunker.pending_len(), 2);

    let (_, noise, start, end) = chunker.flush_non_data().unwrap();
    assert_eq!(noise, b"CD");
    assert_eq!((start, end), (2 + frame.len(), 4 + frame.len()));

    assert!(chunker.get_next_data(false).is_none());
    assert!(chunker.flush_non_data().is_none());
    assert_eq!(chunker.pending_len(), 0);
}

/// Splitting the stream anywhere yields the same frames and noise.
#[rstest]
fn fragmentation_is_transparent() {
    let mut stream = b"AB".to_vec();
    stream.extend_from_slice(&frame("PRES,1013"));
    stream.extend_from_slice(b"xyz");
    stream.extend_from_slice(&frame("COND,4.2"));
    stream.extend_from_slice(b"CD");

    let read_all = |chunks: &[&[u8]]| {
        let mut chunker = StringChunker::new(checksum_sieve);
        let mut frames = Vec::new();
        for chunk in chunks {
            chunker.add_chunk(chunk, 0.0);
            while let Some((_, data)) = chunker.get_next_data(false) {
                frames.push(data);
            }
        }
        let mut noise = Vec::new();
        while let Some((_, bytes, _, _)) = chunker.flush_non_data() {
            noise.extend_from_slice(&bytes);
        }
        (frames, noise)
    };

    let expected = read_all(&[&stream]);
    assert_eq!(expected.0.len(), 2);
    assert_eq!(expected.1, b"ABxyzCD");

    for split in 1..stream.len() {
        let (first, second) = stream.split_at(split);
        assert_eq!(read_all(&[first, second]), expected, "split at {split}");
    }
    let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
    assert_eq!(read_all(&bytewise), expected);
}

/// Draining frames and non-data after every read keeps frames that are split over two reads.
#[rstest]
fn drain_after_every_read() {
    let mut chunker = StringChunker::new(RegexSieve::new(&[r"\$[A-Z]+\*\r\n"]).unwrap());
    let mut frames = Vec::new();
    let mut noise = Vec::new();
    for chunk in [b"AB$TE".as_slice(), b"MP*\r\nCD".as_slice()] {
        chunker.add_chunk(chunk, 0.0);
        while let Some((_, frame)) = chunker.get_next_data(false) {
            frames.push(frame);
        }
        while let Some((_, bytes, _, _)) = chunker.get_next_non_data() {
            noise.push(bytes);
        }
    }
    assert_eq!(frames, vec![b"$TEMP*\r\n".to_vec()]);
    assert_eq!(noise, vec![b"AB".to_vec()]);

    let (_, tail, _, _) = chunker.flush_non_data().unwrap();
    assert_eq!(tail, b"CD");
    assert_eq!(chunker.pending_len(), 0);
}

/// An incomplete frame is neither data nor, while more frames follow, non-data.
#[rstest]
fn partial_frame_waits(mut chunker: StringChunker) {
    let frame = frame("SAL,35.1");
    chunker.add_chunk(&frame[..4], 1.0);
    assert!(chunker.get_next_data(false).is_none());

    chunker.add_chunk(&frame[4..], 2.0);
    let (timestamp, data) = chunker.get_next_data(false).unwrap();
    assert_eq!(timestamp, 1.0);
    assert_eq!(data, frame);
}

/// A frame with a wrong checksum is noise.
#[rstest]
fn bad_checksum_is_noise(mut chunker: StringChunker) {
    chunker.add_chunk(b"$TEMP*00\r\n", 0.0);
    assert!(chunker.get_next_data(false).is_none());
    let (_, noise, _, _) = chunker.flush_non_data().unwrap();
    assert_eq!(noise, b"$TEMP*00\r\n");
}

/// `clean` drops the noise in front of the frame instead of keeping it.
#[rstest]
#[case(true, None)]
#[case(false, Some(b"garbage".to_vec()))]
fn clean_flag(mut chunker: StringChunker, #[case] clean: bool, #[case] noise: Option<Vec<u8>>) {
    let frame = frame("A");
    let mut stream = b"garbage".to_vec();
    stream.extend_from_slice(&frame);
    chunker.add_chunk(&stream, 0.0);

    let (_, data, start, end) = chunker.get_next_data_with_index(clean).unwrap();
    assert_eq!(data, frame);
    assert_eq!((start, end), (7, 7 + frame.len()));
    assert_eq!(chunker.get_next_non_data().map(|n| n.1), noise);
}

/// Every chunk keeps its timestamp.
#[rstest]
fn timestamps_follow_chunks(mut chunker: StringChunker) {
    chunker.add_chunk(&frame("ONE"), 1.5);
    chunker.add_chunk(b"..", 2.5);
    chunker.add_chunk(&frame("TWO"), 3.5);

    assert_eq!(chunker.get_next_data(false).unwrap().0, 1.5);
    assert_eq!(chunker.get_next_data(false).unwrap().0, 3.5);
    let (timestamp, noise, _, _) = chunker.get_next_non_data().unwrap();
    assert_eq!((timestamp, noise.as_slice()), (2.5, b"..".as_slice()));
}

#[rstest]
fn spans_classify_without_consuming(mut chunker: StringChunker) {
    let frame = frame("X");
    let mut stream = b"ab".to_vec();
    stream.extend_from_slice(&frame);
    stream.extend_from_slice(b"c");
    chunker.add_chunk(&stream, 0.0);

    let n = frame.len();
    assert_eq!(
        chunker.spans(),
        vec![
            RawSpan {
                start: 0,
                end: 2,
                kind: SpanKind::NonData
            },
            RawSpan {
                start: 2,
                end: 2 + n,
                kind: SpanKind::Data
            },
            RawSpan {
                start: 2 + n,
                end: 3 + n,
                kind: SpanKind::NonData
            },
        ]
    );
    assert_eq!(chunker.pending_len(), stream.len());
}

/// Offsets keep counting after clearing and after the buffer is compacted.
#[rstest]
fn offsets_are_absolute(mut chunker: StringChunker) {
    chunker.add_chunk(b"0123456789", 0.0);
    chunker.clear();
    assert_eq!(chunker.pending_len(), 0);

    let noise = vec![b'.'; 5000];
    chunker.add_chunk(&noise, 1.0);
    chunker.add_chunk(&frame("LATE"), 2.0);
    let (_, _, start, _) = chunker.get_next_data_with_index(true).unwrap();
    assert_eq!(start, 10 + 5000);
}

#[rstest]
fn regex_sieve_prefers_earliest_then_longest() {
    let sieve = RegexSieve::new(&[r"#\d+\r\n", r"#\d+\r\n#\d+\r\n", r"\d+\r\n"]).unwrap();
    let mut chunker = StringChunker::new(sieve);
    chunker.add_chunk(b"--#1\r\n#2\r\n--#3\r\n", 0.0);

    assert_eq!(chunker.get_next_data(true).unwrap().1, b"#1\r\n#2\r\n");
    assert_eq!(chunker.get_next_data(true).unwrap().1, b"#3\r\n");
    assert!(chunker.get_next_data(true).is_none());
}

#[rstest]
fn regex_sieve_rejects_invalid_pattern() {
    assert!(RegexSieve::new(&["(unclosed"]).is_err());
}
