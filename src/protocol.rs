//! NanoVNA wire protocol: command encoding and binary frame decoding.
//!
//! A scan request is an ASCII command line; the response is a 4-byte binary
//! header followed by `point_count` contiguous 20-byte records with no
//! delimiter between them. `info`/`version` answer in plain text terminated
//! by the `"ch> "` prompt marker, so those responses have to be scanned
//! incrementally rather than length-read.

use num_complex::Complex32;
use std::io::Read;

/// Prompt marker terminating textual responses.
pub const PROMPT: &[u8] = b"ch> ";

/// Default capture mask: frequency plus both S-parameters.
pub const DEFAULT_MASK: u16 = 135;

/// Firmware limit on points per scan command.
pub const MAX_POINTS: u16 = 101;

/// Length of the binary scan response header.
pub const HEADER_LEN: usize = 4;

/// Length of one binary data record.
pub const RECORD_LEN: usize = 20;

/// Bytes scanned for the header pattern before giving up. Command echo and
/// leftover prompt text may precede the binary payload.
const HEADER_SCAN_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("stream ended mid-{0}")]
    Truncated(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("header (mask={expected_mask}, points={expected_points}) not found within {limit} bytes")]
    HeaderNotFound {
        expected_mask: u16,
        expected_points: u16,
        limit: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scan response header: capture mask and number of records to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHeader {
    pub mask: u16,
    pub point_count: u16,
}

/// One decoded 20-byte data record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRecord {
    pub frequency_hz: u32,
    pub s11: Complex32,
    pub s21: Complex32,
}

/// Encode a scan command for the given range.
pub fn encode_scan(start_hz: u32, stop_hz: u32, points: u16, mask: u16) -> Vec<u8> {
    format!("scan {start_hz} {stop_hz} {points} {mask}\r").into_bytes()
}

pub fn encode_info() -> &'static [u8] {
    b"info\r"
}

pub fn encode_version() -> &'static [u8] {
    b"version\r"
}

/// Decode the 4-byte scan header, both fields little-endian.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> ScanHeader {
    ScanHeader {
        mask: u16::from_le_bytes([bytes[0], bytes[1]]),
        point_count: u16::from_le_bytes([bytes[2], bytes[3]]),
    }
}

/// Decode one 20-byte record: u32 LE frequency, then four f32 LE values.
pub fn decode_record(bytes: &[u8; RECORD_LEN]) -> RawRecord {
    let frequency_hz = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let f = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    RawRecord {
        frequency_hz,
        s11: Complex32::new(f(4), f(8)),
        s21: Complex32::new(f(12), f(16)),
    }
}

/// Read exactly `buf.len()` bytes, classifying short reads.
///
/// The transport's read timeout surfaces as `TimedOut`/`WouldBlock`; a closed
/// stream as `UnexpectedEof`. Both abort the scan for this device.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8], what: &'static str) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => FrameError::Timeout(what),
        std::io::ErrorKind::UnexpectedEof => FrameError::Truncated(what),
        _ => FrameError::Io(e),
    })
}

/// Read and decode the scan header.
pub fn read_header(reader: &mut impl Read) -> Result<ScanHeader, FrameError> {
    let mut buf = [0u8; HEADER_LEN];
    read_chunk(reader, &mut buf, "header")?;
    Ok(decode_header(&buf))
}

/// Read and decode one data record.
pub fn read_record(reader: &mut impl Read) -> Result<RawRecord, FrameError> {
    let mut buf = [0u8; RECORD_LEN];
    read_chunk(reader, &mut buf, "record")?;
    Ok(decode_record(&buf))
}

/// Scan the stream for the expected header pattern.
///
/// The instrument echoes the command line before the binary payload, so the
/// first bytes are rarely the header itself. Slides a 4-byte window until the
/// expected `(mask, point_count)` pair appears, bounded at 500 bytes.
pub fn seek_header(reader: &mut impl Read, expected: ScanHeader) -> Result<(), FrameError> {
    let mut window = [0u8; HEADER_LEN];
    read_chunk(reader, &mut window, "header")?;

    if decode_header(&window) == expected {
        return Ok(());
    }

    for _ in HEADER_LEN..HEADER_SCAN_LIMIT {
        let mut byte = [0u8; 1];
        read_chunk(reader, &mut byte, "header")?;

        window.copy_within(1.., 0);
        window[HEADER_LEN - 1] = byte[0];

        if decode_header(&window) == expected {
            return Ok(());
        }
    }

    Err(FrameError::HeaderNotFound {
        expected_mask: expected.mask,
        expected_points: expected.point_count,
        limit: HEADER_SCAN_LIMIT,
    })
}

/// Accumulate a textual response until the `"ch> "` prompt appears.
///
/// Returns the response with the prompt stripped and surrounding whitespace
/// trimmed. There is no length prefix; the prompt is matched with a sliding
/// window, byte by byte.
pub fn read_until_prompt(reader: &mut impl Read) -> Result<String, FrameError> {
    let mut response: Vec<u8> = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        read_chunk(reader, &mut byte, "prompt")?;
        response.push(byte[0]);

        if response.ends_with(PROMPT) {
            response.truncate(response.len() - PROMPT.len());
            return Ok(String::from_utf8_lossy(&response).trim().to_string());
        }
    }
}

/// Build the byte stream an instrument answers a scan command with,
/// mirroring the reference emulator's `struct.pack` layout.
#[cfg(test)]
pub(crate) fn emulated_scan_response(
    start_hz: u32,
    stop_hz: u32,
    points: u16,
    mask: u16,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&mask.to_le_bytes());
    out.extend_from_slice(&points.to_le_bytes());
    for i in 0..u32::from(points) {
        let span = u64::from(stop_hz - start_hz);
        let freq = start_hz + (span * u64::from(i) / u64::from(points.max(2) - 1)) as u32;
        out.extend_from_slice(&freq.to_le_bytes());
        for value in [0.25f32, -0.5, 0.125, -0.0625] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_scan_format() {
        let bytes = encode_scan(50_000_000, 900_000_000, 101, DEFAULT_MASK);
        assert_eq!(bytes, b"scan 50000000 900000000 101 135\r");
    }

    #[test]
    fn test_encode_simple_commands() {
        assert_eq!(encode_info(), b"info\r");
        assert_eq!(encode_version(), b"version\r");
    }

    #[test]
    fn test_header_round_trip() {
        let header = decode_header(&[0x87, 0x00, 0x65, 0x00]);
        assert_eq!(header.mask, 135);
        assert_eq!(header.point_count, 101);
    }

    #[test]
    fn test_record_layout() {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[..4].copy_from_slice(&123_456_789u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&1.0f32.to_le_bytes());
        bytes[8..12].copy_from_slice(&(-1.0f32).to_le_bytes());
        bytes[12..16].copy_from_slice(&0.5f32.to_le_bytes());
        bytes[16..20].copy_from_slice(&(-0.5f32).to_le_bytes());

        let record = decode_record(&bytes);
        assert_eq!(record.frequency_hz, 123_456_789);
        assert_eq!(record.s11, Complex32::new(1.0, -1.0));
        assert_eq!(record.s21, Complex32::new(0.5, -0.5));
    }

    #[test]
    fn test_scan_response_consumes_exact_byte_count() {
        let points = 101u16;
        let data = emulated_scan_response(50_000_000, 900_000_000, points, DEFAULT_MASK);
        let mut cursor = Cursor::new(&data);

        let header = read_header(&mut cursor).unwrap();
        assert_eq!(header.point_count, points);
        for _ in 0..header.point_count {
            read_record(&mut cursor).unwrap();
        }
        assert_eq!(
            cursor.position() as usize,
            HEADER_LEN + RECORD_LEN * usize::from(points)
        );
    }

    #[test]
    fn test_records_are_monotone_in_frequency() {
        let data = emulated_scan_response(50_000_000, 900_000_000, 101, DEFAULT_MASK);
        let mut cursor = Cursor::new(&data);
        let header = read_header(&mut cursor).unwrap();

        let mut previous = 0u32;
        for _ in 0..header.point_count {
            let record = read_record(&mut cursor).unwrap();
            assert!(record.frequency_hz >= previous);
            previous = record.frequency_hz;
        }
        assert_eq!(previous, 900_000_000);
    }

    #[test]
    fn test_truncated_record_is_a_framing_error() {
        let mut data = emulated_scan_response(1_000_000, 2_000_000, 3, DEFAULT_MASK);
        data.truncate(HEADER_LEN + RECORD_LEN + 7);
        let mut cursor = Cursor::new(&data);

        read_header(&mut cursor).unwrap();
        read_record(&mut cursor).unwrap();
        match read_record(&mut cursor) {
            Err(FrameError::Truncated("record")) => {}
            other => panic!("expected truncated record, got {other:?}"),
        }
    }

    #[test]
    fn test_seek_header_skips_command_echo() {
        let mut data = b"scan 1000000 2000000 3 135\r\nch> ".to_vec();
        data.extend_from_slice(&emulated_scan_response(1_000_000, 2_000_000, 3, DEFAULT_MASK));
        let mut cursor = Cursor::new(&data);

        let expected = ScanHeader { mask: DEFAULT_MASK, point_count: 3 };
        seek_header(&mut cursor, expected).unwrap();
        let record = read_record(&mut cursor).unwrap();
        assert_eq!(record.frequency_hz, 1_000_000);
    }

    #[test]
    fn test_seek_header_gives_up_on_garbage() {
        let data = vec![0xAAu8; 600];
        let mut cursor = Cursor::new(&data);
        let expected = ScanHeader { mask: DEFAULT_MASK, point_count: 101 };
        match seek_header(&mut cursor, expected) {
            Err(FrameError::HeaderNotFound { .. }) => {}
            other => panic!("expected HeaderNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_read_until_prompt_strips_marker() {
        let mut cursor = Cursor::new(b"NanoVNA-H v1.0\r\nch> ".to_vec());
        let text = read_until_prompt(&mut cursor).unwrap();
        assert_eq!(text, "NanoVNA-H v1.0");
    }

    #[test]
    fn test_read_until_prompt_requires_full_marker() {
        // "ch>" without the trailing space must not terminate the response.
        let mut cursor = Cursor::new(b"ch>x info text\r\nch> ".to_vec());
        let text = read_until_prompt(&mut cursor).unwrap();
        assert_eq!(text, "ch>x info text");
    }
}
