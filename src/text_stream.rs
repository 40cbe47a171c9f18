//! Reassembly of measurement records from the external parser's text stream.
//!
//! The external measurement process prints one scalar field per line:
//!
//! ```text
//! ID Label DeviceId TimeSent TimeRecv Freq SParam Format Value
//! ```
//!
//! Four such lines make up one [`DataPoint`], keyed by
//! `(frequency, device, time_sent)`. The producer emits the fields of a key
//! in the fixed order S11/REAL, S11/IMG, S21/REAL, S21/IMG, and a record is
//! considered complete exactly when its S21/IMG field is written.
//!
//! That terminal-field rule is a contract with the upstream producer, not
//! something this parser can verify: if the producer ever reorders its
//! output, a record whose S21/IMG line never arrives stays in the pending
//! map until the stream ends and is then discarded. Do not "fix" this with
//! an all-four-fields-seen heuristic; the upstream order is the protocol.

use crate::measurement::{Component, DataPoint, SParameter};
use num_complex::Complex32;
use std::collections::HashMap;

/// First line of the data section.
pub const DATA_HEADER_PREFIX: &str = "ID Label VNA";

/// Out-of-band notification of the output file the producer writes.
pub const SAVE_PATH_PREFIX: &str = "Saving data to:";

/// Minimum fields in a data line.
const DATA_LINE_FIELDS: usize = 9;

/// Classified outcome of feeding one line to the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Header line seen; data lines are accepted from now on.
    DataHeader,
    /// A record completed with this line.
    Sample(DataPoint),
    /// One field stored; the record addressed by this line is still partial.
    Stored,
    /// The producer announced where it saves its own copy of the data.
    SavePath(String),
    /// The producer reported an error; surfaced as status, nothing emitted.
    ProducerError(String),
    /// Prompt, blank, pre-header or malformed line; skipped.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PointKey {
    frequency_hz: u32,
    device_id: u32,
    /// Bit pattern of the time-sent field. The producer prints a fixed
    /// precision, so equal timestamps compare equal through their bits.
    time_sent_bits: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartialPoint {
    time_received: f64,
    s11_re: f32,
    s11_im: f32,
    s21_re: f32,
    s21_im: f32,
}

/// Rebuilds complete measurement records from single-field update lines.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    pending: HashMap<PointKey, PartialPoint>,
    header_seen: bool,
    emitted: u64,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of keys with at least one field still waiting for completion.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the data header has been observed.
    pub fn in_data_mode(&self) -> bool {
        self.header_seen
    }

    /// Feed one line from the producer's stdout.
    pub fn push_line(&mut self, line: &str) -> LineEvent {
        let line = line.trim();

        // Interactive prompts, separators and blank lines carry no data.
        if line.is_empty() || line.starts_with(">>>") || line.starts_with("---") {
            return LineEvent::Skipped;
        }

        if line.starts_with(DATA_HEADER_PREFIX) {
            self.header_seen = true;
            return LineEvent::DataHeader;
        }

        if let Some(path) = line.strip_prefix(SAVE_PATH_PREFIX) {
            return LineEvent::SavePath(path.trim().to_string());
        }

        if line.to_uppercase().contains("ERROR") {
            return LineEvent::ProducerError(line.to_string());
        }

        if !self.header_seen {
            return LineEvent::Skipped;
        }

        match self.parse_data_line(line) {
            Some(event) => event,
            None => {
                log::debug!("skipping malformed line: {line}");
                LineEvent::Skipped
            }
        }
    }

    /// End of stream: whatever never completed is dropped, not emitted.
    pub fn finish(&mut self) -> usize {
        let leaked = self.pending.len();
        if leaked > 0 {
            log::debug!("discarding {leaked} incomplete records at stream end");
        }
        self.pending.clear();
        leaked
    }

    fn parse_data_line(&mut self, line: &str) -> Option<LineEvent> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < DATA_LINE_FIELDS {
            return None;
        }

        // Fields 0 and 1 are the run id and label; metadata only.
        let device_id: u32 = parts[2].parse().ok()?;
        let time_sent: f64 = parts[3].parse().ok()?;
        let time_received: f64 = parts[4].parse().ok()?;
        let frequency_hz: u32 = parts[5].parse().ok()?;
        let parameter = match parts[6] {
            "S11" => SParameter::S11,
            "S21" => SParameter::S21,
            _ => return None,
        };
        let component = match parts[7] {
            "REAL" => Component::Real,
            "IMG" => Component::Imag,
            _ => return None,
        };
        let value: f32 = parts[8].parse().ok()?;

        let key = PointKey {
            frequency_hz,
            device_id,
            time_sent_bits: time_sent.to_bits(),
        };
        // time_received sticks from the key's first line.
        let entry = self.pending.entry(key).or_insert_with(|| PartialPoint {
            time_received,
            ..PartialPoint::default()
        });

        match (parameter, component) {
            (SParameter::S11, Component::Real) => entry.s11_re = value,
            (SParameter::S11, Component::Imag) => entry.s11_im = value,
            (SParameter::S21, Component::Real) => entry.s21_re = value,
            (SParameter::S21, Component::Imag) => {
                entry.s21_im = value;
                // S21/IMG is the producer's terminal field for a key.
                let done = self.pending.remove(&key).unwrap_or_default();
                self.emitted += 1;
                return Some(LineEvent::Sample(DataPoint {
                    device_id,
                    frequency_hz,
                    s11: Complex32::new(done.s11_re, done.s11_im),
                    s21: Complex32::new(done.s21_re, done.s21_im),
                    sweep_number: 0,
                    time_sent,
                    time_received: done.time_received,
                }));
            }
        }

        Some(LineEvent::Stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ID Label VNA TimeSent TimeRecv Freq SParam Format Value";

    fn data_line(freq: u32, device: u32, sparam: &str, fmt: &str, value: f32) -> String {
        format!("20260127_143052 run0 {device} 0.001234 0.052345 {freq} {sparam} {fmt} {value}")
    }

    fn feed_full_point(r: &mut StreamReassembler, freq: u32, device: u32) -> Option<DataPoint> {
        let mut sample = None;
        for (sparam, fmt, value) in [
            ("S11", "REAL", 0.1),
            ("S11", "IMG", 0.2),
            ("S21", "REAL", 0.3),
            ("S21", "IMG", 0.4),
        ] {
            if let LineEvent::Sample(p) = r.push_line(&data_line(freq, device, sparam, fmt, value)) {
                sample = Some(p);
            }
        }
        sample
    }

    #[test]
    fn test_complete_record_emitted_on_s21_img() {
        let mut r = StreamReassembler::new();
        assert_eq!(r.push_line(HEADER), LineEvent::DataHeader);

        let p = feed_full_point(&mut r, 50_000_000, 0).expect("record should complete");
        assert_eq!(p.frequency_hz, 50_000_000);
        assert_eq!(p.s11, Complex32::new(0.1, 0.2));
        assert_eq!(p.s21, Complex32::new(0.3, 0.4));
        assert_eq!(r.pending_len(), 0);
        assert_eq!(r.emitted(), 1);
    }

    #[test]
    fn test_missing_terminal_field_never_emits() {
        let mut r = StreamReassembler::new();
        r.push_line(HEADER);
        for (sparam, fmt) in [("S11", "REAL"), ("S11", "IMG"), ("S21", "REAL")] {
            let event = r.push_line(&data_line(144_000_000, 0, sparam, fmt, 0.5));
            assert_eq!(event, LineEvent::Stored);
        }
        assert_eq!(r.emitted(), 0);
        assert_eq!(r.pending_len(), 1);
        assert_eq!(r.finish(), 1);
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn test_interleaved_devices_use_separate_keys() {
        let mut r = StreamReassembler::new();
        r.push_line(HEADER);

        // Device 1's fields interleave with device 0's; both must complete.
        r.push_line(&data_line(1_000_000, 0, "S11", "REAL", 0.1));
        r.push_line(&data_line(1_000_000, 1, "S11", "REAL", 0.9));
        r.push_line(&data_line(1_000_000, 0, "S11", "IMG", 0.2));
        r.push_line(&data_line(1_000_000, 1, "S11", "IMG", 0.8));
        r.push_line(&data_line(1_000_000, 0, "S21", "REAL", 0.3));
        r.push_line(&data_line(1_000_000, 1, "S21", "REAL", 0.7));
        let a = r.push_line(&data_line(1_000_000, 0, "S21", "IMG", 0.4));
        let b = r.push_line(&data_line(1_000_000, 1, "S21", "IMG", 0.6));

        match (a, b) {
            (LineEvent::Sample(p0), LineEvent::Sample(p1)) => {
                assert_eq!(p0.device_id, 0);
                assert_eq!(p0.s21, Complex32::new(0.3, 0.4));
                assert_eq!(p1.device_id, 1);
                assert_eq!(p1.s21, Complex32::new(0.7, 0.6));
            }
            other => panic!("both devices should emit, got {other:?}"),
        }
    }

    #[test]
    fn test_short_line_is_skipped_without_side_effects() {
        let mut r = StreamReassembler::new();
        r.push_line(HEADER);

        // Only 5 of the expected 9 fields.
        assert_eq!(r.push_line("20260127 run0 0 0.1 0.2"), LineEvent::Skipped);

        let p = feed_full_point(&mut r, 2_000_000, 0);
        assert!(p.is_some());
        assert_eq!(r.emitted(), 1);
    }

    #[test]
    fn test_data_lines_before_header_are_ignored() {
        let mut r = StreamReassembler::new();
        let event = r.push_line(&data_line(1_000_000, 0, "S21", "IMG", 0.4));
        assert_eq!(event, LineEvent::Skipped);
        assert_eq!(r.pending_len(), 0);
        assert!(!r.in_data_mode());
    }

    #[test]
    fn test_save_path_and_error_lines() {
        let mut r = StreamReassembler::new();
        assert_eq!(
            r.push_line("Saving data to: /tmp/run0.s2p"),
            LineEvent::SavePath("/tmp/run0.s2p".to_string())
        );
        assert_eq!(
            r.push_line("ERROR: VNA 0 not responding"),
            LineEvent::ProducerError("ERROR: VNA 0 not responding".to_string())
        );
    }

    #[test]
    fn test_prompt_and_separator_lines_skipped() {
        let mut r = StreamReassembler::new();
        assert_eq!(r.push_line(">>> "), LineEvent::Skipped);
        assert_eq!(r.push_line("---------------"), LineEvent::Skipped);
        assert_eq!(r.push_line("   "), LineEvent::Skipped);
    }

    #[test]
    fn test_unknown_sparam_or_format_skipped() {
        let mut r = StreamReassembler::new();
        r.push_line(HEADER);
        assert_eq!(
            r.push_line(&data_line(1_000_000, 0, "S12", "REAL", 0.1)),
            LineEvent::Skipped
        );
        assert_eq!(
            r.push_line(&data_line(1_000_000, 0, "S11", "MAG", 0.1)),
            LineEvent::Skipped
        );
        assert_eq!(r.pending_len(), 0);
    }
}
