//! Sweep-indexed, memory-bounded aggregation of the flat sample stream.
//!
//! Samples arrive per device in frequency order, but with no global order
//! across devices. Re-observing a frequency on any device means that device
//! started a new pass, and by policy that closes the sweep for *all*
//! devices: the whole current map is archived and every device starts
//! fresh. Per-device independent boundaries would also be defensible; the
//! global policy is the documented default and is confined to
//! [`SweepAggregator::ingest`].

use crate::measurement::DataPoint;
use crate::scan_controller::{ScanError, ScanSink};
use num_complex::Complex32;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One frequency's measurements within a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub frequency_hz: u32,
    pub s11: Complex32,
    pub s21: Complex32,
}

/// One device's pass across the configured range, keys in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSweep {
    points: Vec<SweepPoint>,
}

impl DeviceSweep {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    pub fn contains(&self, frequency_hz: u32) -> bool {
        self.points.iter().any(|p| p.frequency_hz == frequency_hz)
    }

    fn push(&mut self, point: &DataPoint) {
        self.points.push(SweepPoint {
            frequency_hz: point.frequency_hz,
            s11: point.s11,
            s21: point.s21,
        });
    }
}

/// A closed sweep: every device's points at the moment the boundary hit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchivedSweep {
    /// Aggregator-assigned sweep index (0-based, monotonic).
    pub sweep_number: u64,
    /// Per-device sweeps, sorted by device id.
    pub devices: Vec<(u32, DeviceSweep)>,
}

impl ArchivedSweep {
    pub fn device(&self, device_id: u32) -> Option<&DeviceSweep> {
        self.devices
            .iter()
            .find(|(id, _)| *id == device_id)
            .map(|(_, sweep)| sweep)
    }
}

#[derive(Debug, Default)]
struct AggregatorInner {
    /// Open sweep per device, sorted by device id.
    current: Vec<(u32, DeviceSweep)>,
    /// Archived sweeps, oldest first, bounded at the history capacity.
    history: VecDeque<ArchivedSweep>,
    /// Sweeps archived so far; also the next archive's number.
    archived: u64,
    /// Flat recent-sample window retained for the binned projection.
    window: VecDeque<DataPoint>,
}

/// Groups the sample stream into sweeps with bounded history.
///
/// All state sits behind one lock: the controller's delivery path writes,
/// the foreground consumer reads, and both may run concurrently. Implements
/// [`ScanSink`] so it can be handed to the controller directly.
#[derive(Debug)]
pub struct SweepAggregator {
    inner: Mutex<AggregatorInner>,
    history_capacity: usize,
    window_capacity: usize,
}

impl Default for SweepAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepAggregator {
    /// Default bound on archived sweeps.
    pub const DEFAULT_HISTORY: usize = 5;

    /// Default bound on the retained flat sample window.
    pub const DEFAULT_WINDOW: usize = 20_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_HISTORY, Self::DEFAULT_WINDOW)
    }

    pub fn with_capacity(history_capacity: usize, window_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(AggregatorInner::default()),
            history_capacity,
            window_capacity,
        }
    }

    /// Fold one sample into the current sweep state.
    ///
    /// Returns `true` when the sample triggered a sweep boundary.
    pub fn ingest(&self, point: &DataPoint) -> bool {
        let mut inner = self.inner.lock().expect("aggregator lock poisoned");

        let wrapped = inner
            .current
            .iter()
            .find(|(id, _)| *id == point.device_id)
            .is_some_and(|(_, sweep)| sweep.contains(point.frequency_hz));

        if wrapped {
            self.archive(&mut inner);
        }

        match inner
            .current
            .binary_search_by_key(&point.device_id, |(id, _)| *id)
        {
            Ok(i) => inner.current[i].1.push(point),
            Err(i) => {
                // First sample from this device, mid-run or not.
                let mut sweep = DeviceSweep::default();
                sweep.push(point);
                inner.current.insert(i, (point.device_id, sweep));
            }
        }

        if self.window_capacity > 0 {
            if inner.window.len() == self.window_capacity {
                inner.window.pop_front();
            }
            inner.window.push_back(point.clone());
        }

        wrapped
    }

    /// Archive the entire current map and reset every device.
    fn archive(&self, inner: &mut AggregatorInner) {
        let devices = std::mem::take(&mut inner.current);
        let sweep_number = inner.archived;
        inner.archived += 1;

        log::debug!(
            "sweep {sweep_number} archived ({} device(s))",
            devices.len()
        );
        inner.history.push_back(ArchivedSweep {
            sweep_number,
            devices,
        });
        if inner.history.len() > self.history_capacity {
            inner.history.pop_front();
        }
    }

    /// Number of sweeps archived since construction (not bounded by K).
    pub fn archived_count(&self) -> u64 {
        self.inner.lock().expect("aggregator lock poisoned").archived
    }

    pub fn history_len(&self) -> usize {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .history
            .len()
    }

    /// Copy of the archived sweeps, oldest first.
    pub fn history(&self) -> Vec<ArchivedSweep> {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Copy of the open sweep map.
    pub fn current(&self) -> Vec<(u32, DeviceSweep)> {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .current
            .clone()
    }

    /// Copy of the retained flat sample window, oldest first.
    pub fn window(&self) -> Vec<DataPoint> {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .window
            .iter()
            .cloned()
            .collect()
    }

    /// Drop all state; the next sample starts sweep numbering from zero.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("aggregator lock poisoned");
        *inner = AggregatorInner::default();
    }
}

impl ScanSink for SweepAggregator {
    fn on_sample(&self, point: DataPoint) {
        self.ingest(&point);
    }

    fn on_status(&self, message: &str) {
        log::info!("{message}");
    }

    fn on_error(&self, error: &ScanError) {
        log::error!("scan error: {error}");
    }
}
