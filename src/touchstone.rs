//! Read-only ingestion of two-port touchstone (`.s2p`) files.
//!
//! Only the layout the scanner itself writes is understood: `!`/`#` lines
//! are comments or the option line, data rows are whitespace-separated
//! `frequency s11_re s11_im s21_re s21_im`. Frequencies are truncated to
//! integer Hz; rows that fail to parse are skipped.

use crate::measurement::DataPoint;
use num_complex::Complex32;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Read measurement points from a touchstone file.
pub fn read_touchstone(path: impl AsRef<Path>) -> std::io::Result<Vec<DataPoint>> {
    let file = File::open(path)?;
    read_touchstone_from(file)
}

/// Same as [`read_touchstone`], from any byte stream.
pub fn read_touchstone_from(source: impl Read) -> std::io::Result<Vec<DataPoint>> {
    let mut points = Vec::new();

    for line in BufReader::new(source).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
            continue;
        }

        if let Some(point) = parse_row(line) {
            points.push(point);
        } else {
            log::debug!("skipping malformed touchstone row: {line}");
        }
    }

    Ok(points)
}

fn parse_row(line: &str) -> Option<DataPoint> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let frequency_hz = parts[0].parse::<f64>().ok()? as u32;
    let values: Vec<f32> = parts[1..5]
        .iter()
        .map(|v| v.parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;

    Some(DataPoint {
        device_id: 0,
        frequency_hz,
        s11: Complex32::new(values[0], values[1]),
        s21: Complex32::new(values[2], values[3]),
        sweep_number: 0,
        time_sent: 0.0,
        time_received: 0.0,
    })
}
