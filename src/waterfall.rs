//! Time x frequency binned projection of the retained sample window.
//!
//! Derived data: every refresh recomputes the grid from scratch over the
//! retained samples. Callers needing higher refresh rates should cap the
//! aggregator's window rather than expect incremental updates here.

use crate::measurement::{DataPoint, SParameter};

/// Time bins allocated per second of sample span.
const TIME_BINS_PER_SECOND: f64 = 4.0;

/// Shape of the projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinGridSpec {
    pub freq_min_hz: u32,
    pub freq_max_hz: u32,
    /// Frequency resolution; usually the nominal points per sweep.
    pub freq_bins: usize,
    /// Upper bound on time bins regardless of elapsed span.
    pub max_time_bins: usize,
    /// Which parameter's magnitude to average.
    pub parameter: SParameter,
}

impl BinGridSpec {
    pub fn new(freq_min_hz: u32, freq_max_hz: u32, freq_bins: usize) -> Self {
        Self {
            freq_min_hz,
            freq_max_hz,
            freq_bins,
            max_time_bins: 200,
            parameter: SParameter::S21,
        }
    }
}

/// Averaged-magnitude grid. `None` cells received no samples, which is not
/// the same thing as an average of 0.0 dB.
#[derive(Debug, Clone, PartialEq)]
pub struct BinGrid {
    time_bins: usize,
    freq_bins: usize,
    t_min: f64,
    t_max: f64,
    cells: Vec<Option<f64>>,
}

impl BinGrid {
    /// Full pass over `points`, accumulating `(sum, count)` per cell.
    pub fn compute(points: &[DataPoint], spec: &BinGridSpec) -> Self {
        if points.is_empty() || spec.freq_bins == 0 || spec.freq_max_hz <= spec.freq_min_hz {
            return Self {
                time_bins: 0,
                freq_bins: spec.freq_bins,
                t_min: 0.0,
                t_max: 0.0,
                cells: Vec::new(),
            };
        }

        let t_min = points
            .iter()
            .map(|p| p.time_received)
            .fold(f64::INFINITY, f64::min);
        let t_max = points
            .iter()
            .map(|p| p.time_received)
            .fold(f64::NEG_INFINITY, f64::max);

        let span = (t_max - t_min).max(0.0);
        let time_bins = ((span * TIME_BINS_PER_SECOND).ceil() as usize)
            .clamp(1, spec.max_time_bins.max(1));

        let mut sums = vec![0.0f64; time_bins * spec.freq_bins];
        let mut counts = vec![0u32; time_bins * spec.freq_bins];

        for point in points {
            if point.frequency_hz < spec.freq_min_hz || point.frequency_hz > spec.freq_max_hz {
                continue;
            }
            let t = bin_index(point.time_received, t_min, t_max, time_bins);
            let f = bin_index(
                f64::from(point.frequency_hz),
                f64::from(spec.freq_min_hz),
                f64::from(spec.freq_max_hz),
                spec.freq_bins,
            );
            let cell = t * spec.freq_bins + f;
            sums[cell] += point.mag_db(spec.parameter);
            counts[cell] += 1;
        }

        let cells = sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| {
                if count == 0 {
                    None
                } else {
                    Some(sum / f64::from(count))
                }
            })
            .collect();

        Self {
            time_bins,
            freq_bins: spec.freq_bins,
            t_min,
            t_max,
            cells,
        }
    }

    pub fn time_bins(&self) -> usize {
        self.time_bins
    }

    pub fn freq_bins(&self) -> usize {
        self.freq_bins
    }

    /// Time span covered by the grid, in scan-epoch seconds.
    pub fn time_range(&self) -> (f64, f64) {
        (self.t_min, self.t_max)
    }

    /// Averaged magnitude in dB, or `None` for an empty cell.
    pub fn cell(&self, time_bin: usize, freq_bin: usize) -> Option<f64> {
        if time_bin >= self.time_bins || freq_bin >= self.freq_bins {
            return None;
        }
        self.cells[time_bin * self.freq_bins + freq_bin]
    }

    /// One time row, `freq_bins` wide.
    pub fn row(&self, time_bin: usize) -> &[Option<f64>] {
        let start = time_bin * self.freq_bins;
        &self.cells[start..start + self.freq_bins]
    }
}

/// Linear binning over `[min, max]`; the top of the range lands in the last
/// bin rather than one past it.
fn bin_index(value: f64, min: f64, max: f64, bins: usize) -> usize {
    if max <= min {
        return 0;
    }
    let normalized = (value - min) / (max - min);
    ((normalized * bins as f64) as usize).min(bins - 1)
}
