//! Decoder for `script(1)` timing files.
//!
//! Builds run under `script --log-out logs.txt --log-timing timings.txt`;
//! the timing file records `(seconds, length)` pairs per output burst. This
//! module reconstructs timestamped log segments from the pair of files.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::OutputLine;

/// Byte offset of the log payload: length of the first line plus its
/// terminator. Skips the `Script started on ...` banner.
pub fn log_offset(logs: &str) -> usize {
    match logs.find('\n') {
        Some(idx) => idx + 1,
        None => logs.len() + 1,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingPart {
    pub timestamp: DateTime<Utc>,
    /// Signed byte count: positive for output, negative for adjustments.
    /// Readers slice `|length|` bytes and advance the cursor by the signed
    /// value.
    pub length: i64,
}

/// Parse a timing line `"{seconds} {length}"` into a part relative to
/// `start`. Malformed lines are skipped.
pub fn parse_timing_line(line: &str, start: DateTime<Utc>) -> Option<TimingPart> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.split(' ');
    let seconds: f64 = fields.next()?.parse().ok()?;
    let length: i64 = fields.next()?.parse().ok()?;
    let timestamp = start + chrono::Duration::microseconds((seconds * 1_000_000.0) as i64);
    Some(TimingPart { timestamp, length })
}

pub fn parse_timing(timings: &str, start: DateTime<Utc>) -> Vec<TimingPart> {
    timings
        .lines()
        .filter_map(|line| parse_timing_line(line, start))
        .collect()
}

/// ISO-8601 with an explicit `+00:00` offset rather than `Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Slice `logs` according to `part`, starting at byte `intro + cursor`.
/// Returns the segment content; out-of-range slices clamp to the available
/// bytes.
pub fn slice_segment(logs: &str, intro: usize, cursor: i64, part: &TimingPart) -> String {
    let bytes = logs.as_bytes();
    let size = part.length.unsigned_abs() as usize;
    let from = (intro as i64 + cursor).clamp(0, bytes.len() as i64) as usize;
    let to = from.saturating_add(size).min(bytes.len());
    String::from_utf8_lossy(&bytes[from..to]).into_owned()
}

/// Decode a completed `(logs, timings)` pair into timestamped segments.
pub fn decode_segments(logs: &str, timings: &str, start: DateTime<Utc>) -> Vec<OutputLine> {
    let intro = log_offset(logs);
    let mut cursor: i64 = 0;
    let mut segments = Vec::new();
    for part in parse_timing(timings, start) {
        segments.push(OutputLine {
            timestamp: format_timestamp(part.timestamp),
            content: slice_segment(logs, intro, cursor, &part),
        });
        cursor += part.length;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn offset_skips_the_banner_line() {
        let logs = "Script started on 2024-05-01\nhello";
        assert_eq!(log_offset(logs), 29);
        assert_eq!(&logs[log_offset(logs)..], "hello");
    }

    #[test]
    fn timestamps_render_with_explicit_offset() {
        let rendered = format_timestamp(start());
        assert!(rendered.ends_with("+00:00"), "got {rendered}");
        assert!(!rendered.ends_with('Z'));
    }

    #[test]
    fn parses_fractional_seconds_and_signed_lengths() {
        let parts = parse_timing("0.5 5\n1.25 -2\n\nbogus line\n2 3\n", start());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].length, 5);
        assert_eq!(parts[1].length, -2);
        assert_eq!(
            parts[0].timestamp,
            start() + chrono::Duration::microseconds(500_000)
        );
    }

    #[test]
    fn decodes_segments_against_the_log_body() {
        let logs = "banner\nhello world";
        let timings = "0.1 5\n0.2 6\n";
        let segments = decode_segments(logs, timings, start());
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "hello");
        assert_eq!(segments[1].content, " world");
    }

    #[test]
    fn negative_length_rewinds_the_cursor() {
        let logs = "banner\nabcdef";
        // Read 4, rewind 2, read 3: "abcd", "ef" (slice of |-2| at cursor 4), "cde".
        let timings = "0.1 4\n0.2 -2\n0.3 3\n";
        let segments = decode_segments(logs, timings, start());
        assert_eq!(segments[0].content, "abcd");
        assert_eq!(segments[1].content, "ef");
        assert_eq!(segments[2].content, "cde");
    }

    #[test]
    fn out_of_range_slices_clamp() {
        let logs = "banner\nxy";
        let timings = "0.1 50\n";
        let segments = decode_segments(logs, timings, start());
        assert_eq!(segments[0].content, "xy");
    }

    #[test]
    fn render_parse_round_trip() {
        let parts = vec![
            TimingPart {
                timestamp: start() + chrono::Duration::microseconds(100_000),
                length: 12,
            },
            TimingPart {
                timestamp: start() + chrono::Duration::microseconds(2_340_000),
                length: -4,
            },
        ];
        let rendered: String = parts
            .iter()
            .map(|p| {
                let secs = (p.timestamp - start()).num_microseconds().unwrap() as f64 / 1_000_000.0;
                format!("{secs} {}\n", p.length)
            })
            .collect();
        let reparsed = parse_timing(&rendered, start());
        assert_eq!(reparsed, parts);
    }
}
