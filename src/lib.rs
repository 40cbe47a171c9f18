//! # VnaScan RS
//!
//! A Rust library for acquiring frequency-swept S-parameter measurements
//! (S11/S21) from NanoVNA-class network analyzers over serial links, and for
//! aggregating the resulting sample stream into bounded-memory, sweep-indexed
//! datasets while a scan is still running.
//!
//! This library provides the wire protocol codecs, the multi-device scan
//! controller, and the streaming aggregation layer. Presentation (plotting,
//! color assignment, UI) is an external concern.
//!
//! ## Features
//!
//! - **Binary instrument protocol**: `scan`/`info`/`version` command encoding
//!   and fixed-layout binary response decoding, with header synchronisation
//!   across command echo
//! - **Text stream reassembly**: rebuilds complete measurement records from
//!   the external measurement process's single-field line protocol
//! - **Multi-device scanning**: one producer thread per analyzer, single
//!   active scan, cooperative stop with a kill fallback for subprocess scans
//! - **Streaming aggregation**: sweep detection by frequency wraparound,
//!   bounded sweep history, and a time×frequency binned projection
//! - **Type safety**: strong typing and error handling throughout
//!
//! ## Examples
//!
//! ### Scanning directly attached analyzers
//!
//! ```rust,no_run
//! use vnascan_rs::{ChannelSink, ScanController, ScanEvent, ScanRequest, Termination};
//!
//! let controller = ScanController::new();
//! let (sink, events) = ChannelSink::new();
//!
//! let request = ScanRequest::new(
//!     50_000_000,
//!     900_000_000,
//!     101,
//!     Termination::FixedSweeps(5),
//!     vec!["/dev/ttyACM0".to_string()],
//! );
//!
//! if controller.start(request, sink) {
//!     for event in events {
//!         match event {
//!             ScanEvent::Sample(point) => {
//!                 println!("{} Hz: {:.1} dB", point.frequency_hz, point.s21_mag_db());
//!             }
//!             ScanEvent::Status(message) => println!("status: {message}"),
//!             ScanEvent::Error(error) => eprintln!("error: {error}"),
//!         }
//!     }
//! }
//! ```
//!
//! ### Aggregating into sweeps
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vnascan_rs::{ScanController, ScanRequest, SweepAggregator, Termination};
//!
//! let controller = ScanController::new();
//! let aggregator = Arc::new(SweepAggregator::new());
//!
//! let request = ScanRequest::new(
//!     50_000_000,
//!     900_000_000,
//!     101,
//!     Termination::FixedSweeps(10),
//!     vec!["/dev/ttyACM0".to_string(), "/dev/ttyACM1".to_string()],
//! );
//!
//! // The aggregator is itself a sink; hand it straight to the controller.
//! controller.start(request, aggregator.clone());
//! while controller.is_running() {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//!     println!("archived sweeps: {}", aggregator.history_len());
//! }
//! ```
//!
//! ### Scanning through the external measurement process
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vnascan_rs::{ChannelSink, ParserCommand, ScanController, ScanRequest, Termination};
//!
//! let controller = ScanController::new();
//! let (sink, events) = ChannelSink::new();
//!
//! let parser = ParserCommand::new("/usr/local/bin/VnaCommandParser");
//! let request = ScanRequest::new(
//!     50_000_000,
//!     900_000_000,
//!     101,
//!     Termination::TimeLimit(Duration::from_secs(60)),
//!     vec!["/dev/ttyACM0".to_string()],
//! );
//!
//! controller.start_process(parser, request, sink);
//! for event in events.iter() {
//!     println!("{event:?}");
//! }
//! ```

pub mod measurement;
pub mod parser_process;
pub mod protocol;
pub mod scan_controller;
pub mod sweep;
pub mod text_stream;
pub mod touchstone;
pub mod vna_session;
pub mod waterfall;

// Re-export the main types for convenience
pub use measurement::{Component, DataPoint, SParameter};

pub use protocol::{FrameError, RawRecord, ScanHeader, DEFAULT_MASK, MAX_POINTS, PROMPT};

pub use text_stream::{LineEvent, StreamReassembler};

pub use vna_session::{SessionError, SweepSetup, VnaSession};

pub use scan_controller::{
    ChannelSink, RequestError, ScanController, ScanError, ScanEvent, ScanRequest, ScanSink,
    ScanState, Termination,
};

pub use parser_process::ParserCommand;

pub use sweep::{ArchivedSweep, DeviceSweep, SweepAggregator, SweepPoint};

pub use waterfall::{BinGrid, BinGridSpec};

pub use touchstone::{read_touchstone, read_touchstone_from};
