//! Single point of control for "is a scan running".
//!
//! The controller owns an explicit lifecycle state machine
//! (`Idle → Starting → Running → Stopping → Idle`) guarded by one lock, and
//! fans a scan out to one producer thread per analyzer (or to one reader
//! thread over an external parser process). Exactly one scan can be in
//! flight; a second `start` is rejected synchronously, never queued.
//!
//! Samples, status messages and errors are delivered through a [`ScanSink`].
//! Sink methods are invoked from worker threads: implementations must not
//! assume the caller's thread, and must not call back into
//! [`ScanController::stop`] (which joins those workers).

use crate::measurement::DataPoint;
use crate::parser_process::{self, ParserCommand};
use crate::protocol::{DEFAULT_MASK, MAX_POINTS};
use crate::vna_session::{SessionError, SweepSetup, VnaSession};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Depth of the bounded delivery queue used by [`ChannelSink`].
pub const CHANNEL_CAPACITY: usize = 100;

/// When a scan ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop after this many complete sweeps per device.
    FixedSweeps(u32),
    /// Stop once this much time has elapsed since the scan epoch.
    TimeLimit(Duration),
}

/// Everything needed to run one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub start_hz: u32,
    pub stop_hz: u32,
    pub point_count: u16,
    pub termination: Termination,
    /// Transport identifiers, one per analyzer, in device-id order.
    pub ports: Vec<String>,
    pub mask: u16,
}

impl ScanRequest {
    pub fn new(
        start_hz: u32,
        stop_hz: u32,
        point_count: u16,
        termination: Termination,
        ports: Vec<String>,
    ) -> Self {
        Self {
            start_hz,
            stop_hz,
            point_count,
            termination,
            ports,
            mask: DEFAULT_MASK,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.start_hz >= self.stop_hz {
            return Err(RequestError::StartNotBelowStop);
        }
        if self.point_count == 0 {
            return Err(RequestError::ZeroPoints);
        }
        if self.point_count > MAX_POINTS {
            return Err(RequestError::TooManyPoints(self.point_count));
        }
        if self.ports.is_empty() {
            return Err(RequestError::NoPorts);
        }
        for (i, port) in self.ports.iter().enumerate() {
            if self.ports[..i].contains(port) {
                return Err(RequestError::DuplicatePort(port.clone()));
            }
        }
        if self.termination == Termination::FixedSweeps(0) {
            return Err(RequestError::ZeroSweeps);
        }
        Ok(())
    }

    pub(crate) fn sweep_setup(&self) -> SweepSetup {
        SweepSetup {
            start_hz: self.start_hz,
            stop_hz: self.stop_hz,
            point_count: self.point_count,
            mask: self.mask,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("start frequency must be below stop frequency")]
    StartNotBelowStop,

    #[error("point count must be positive")]
    ZeroPoints,

    #[error("point count {0} exceeds the firmware limit of {MAX_POINTS} per scan command")]
    TooManyPoints(u16),

    #[error("at least one port is required")]
    NoPorts,

    #[error("port {0} listed more than once")]
    DuplicatePort(String),

    #[error("number of sweeps must be positive")]
    ZeroSweeps,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyRunning,

    #[error("invalid scan request: {0}")]
    Request(#[from] RequestError),

    #[error("device {device_id} ({port}): {source}")]
    Device {
        device_id: u32,
        port: String,
        source: SessionError,
    },

    #[error("no device produced data")]
    AllDevicesFailed,

    #[error("measurement process: {0}")]
    Process(String),
}

/// Delivery endpoint for samples, status and errors.
///
/// Called from worker threads; implementations must be safe to invoke
/// concurrently with the controlling thread's own flow.
pub trait ScanSink: Send + Sync {
    fn on_sample(&self, point: DataPoint);

    fn on_status(&self, message: &str) {
        let _ = message;
    }

    fn on_error(&self, error: &ScanError) {
        log::error!("scan error: {error}");
    }
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Sample(DataPoint),
    Status(String),
    Error(String),
}

/// [`ScanSink`] adapter that forwards events into a bounded queue.
///
/// The queue applies backpressure: a full queue blocks the producer threads
/// until the consumer drains, bounding memory. A dropped receiver silently
/// discards further events.
pub struct ChannelSink {
    sender: Sender<ScanEvent>,
}

impl ChannelSink {
    /// Create a sink and its receiving end with the default queue depth.
    pub fn new() -> (Arc<Self>, Receiver<ScanEvent>) {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Arc<Self>, Receiver<ScanEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Arc::new(Self { sender }), receiver)
    }
}

impl ScanSink for ChannelSink {
    fn on_sample(&self, point: DataPoint) {
        let _ = self.sender.send(ScanEvent::Sample(point));
    }

    fn on_status(&self, message: &str) {
        let _ = self.sender.send(ScanEvent::Status(message.to_string()));
    }

    fn on_error(&self, error: &ScanError) {
        let _ = self.sender.send(ScanEvent::Error(error.to_string()));
    }
}

/// Lifecycle of the single allowed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Shared lifecycle: the authoritative state plus the cooperative
/// cancellation flag observed by workers at record/line boundaries.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<ScanState>,
    changed: Condvar,
    pub(crate) cancel: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ScanState::Idle),
            changed: Condvar::new(),
            cancel: AtomicBool::new(false),
        }
    }

    /// `Idle → Starting`, claiming the exclusive scan token.
    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if *state != ScanState::Idle {
            return false;
        }
        *state = ScanState::Starting;
        self.cancel.store(false, Ordering::Relaxed);
        self.changed.notify_all();
        true
    }

    /// `Starting → Running`; ignored if a stop already raced in.
    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if *state == ScanState::Starting {
            *state = ScanState::Running;
            self.changed.notify_all();
        }
    }

    /// Worker is fully drained: back to `Idle`.
    pub(crate) fn finish(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        *state = ScanState::Idle;
        self.changed.notify_all();
    }

    /// Raise the cancellation flag and enter `Stopping` if a scan is active.
    fn request_stop(&self) -> bool {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        match *state {
            ScanState::Starting | ScanState::Running => {
                *state = ScanState::Stopping;
                self.cancel.store(true, Ordering::Relaxed);
                self.changed.notify_all();
                true
            }
            ScanState::Stopping => {
                self.cancel.store(true, Ordering::Relaxed);
                true
            }
            ScanState::Idle => false,
        }
    }

    /// `Stopping → Idle`, for the case where the worker died without
    /// reaching its own `finish`.
    fn settle(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if *state == ScanState::Stopping {
            *state = ScanState::Idle;
            self.changed.notify_all();
        }
    }

    fn snapshot(&self) -> ScanState {
        *self.state.lock().expect("lifecycle lock poisoned")
    }

    fn wait_idle(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        while *state != ScanState::Idle {
            state = self.changed.wait(state).expect("lifecycle lock poisoned");
        }
    }
}

/// Orchestrates scans: one at a time, fan-out per device, callback delivery.
pub struct ScanController {
    lifecycle: Arc<Lifecycle>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanController {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new()),
            worker: Mutex::new(None),
        }
    }

    /// Start a scan against directly attached analyzers.
    ///
    /// Returns `false` without side effects (beyond an `on_error` call) if
    /// the request is invalid or another scan is active.
    pub fn start(&self, request: ScanRequest, sink: Arc<dyn ScanSink>) -> bool {
        if let Err(e) = request.validate() {
            sink.on_error(&ScanError::Request(e));
            return false;
        }
        self.launch(sink.clone(), move |lifecycle| {
            run_device_scan(&request, sink.as_ref(), &lifecycle);
        })
    }

    /// Start a scan backed by the external measurement process.
    ///
    /// The process receives its command script on stdin (derived from
    /// `request`) and streams the line protocol back on stdout.
    pub fn start_process(
        &self,
        parser: ParserCommand,
        request: ScanRequest,
        sink: Arc<dyn ScanSink>,
    ) -> bool {
        if let Err(e) = request.validate() {
            sink.on_error(&ScanError::Request(e));
            return false;
        }
        self.launch(sink.clone(), move |lifecycle| {
            parser_process::run_parser_scan(&parser, &request, sink.as_ref(), &lifecycle);
        })
    }

    fn launch<F>(&self, sink: Arc<dyn ScanSink>, work: F) -> bool
    where
        F: FnOnce(Arc<Lifecycle>) + Send + 'static,
    {
        if !self.lifecycle.try_begin() {
            sink.on_error(&ScanError::AlreadyRunning);
            return false;
        }

        let mut worker = self.worker.lock().expect("worker lock poisoned");
        // The previous worker has reached Idle; reap its thread.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        *worker = Some(thread::spawn(move || work(lifecycle)));
        true
    }

    /// Stop the active scan and block until the worker has drained.
    ///
    /// Cooperative: workers observe the flag at record/line boundaries.
    /// Subprocess-backed scans additionally close the child's stdin and kill
    /// it after a grace period. The controller is back in `Idle` when this
    /// returns. Returns whether a scan was active when called.
    ///
    /// Must not be called from a [`ScanSink`] callback.
    pub fn stop(&self) -> bool {
        let was_active = self.lifecycle.request_stop();

        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
        self.lifecycle.settle();
        was_active
    }

    /// Authoritative running flag. External mirrors of this state must be
    /// resynchronized from here, never assumed.
    pub fn is_running(&self) -> bool {
        matches!(
            self.lifecycle.snapshot(),
            ScanState::Starting | ScanState::Running
        )
    }

    pub fn state(&self) -> ScanState {
        self.lifecycle.snapshot()
    }

    /// Block until the controller returns to `Idle`.
    pub fn wait_idle(&self) {
        self.lifecycle.wait_idle();
    }

    #[cfg(test)]
    fn launch_for_test<F>(&self, work: F) -> bool
    where
        F: FnOnce(Arc<Lifecycle>) + Send + 'static,
    {
        struct NullSink;
        impl ScanSink for NullSink {
            fn on_sample(&self, _: DataPoint) {}
            fn on_error(&self, _: &ScanError) {}
        }
        self.launch(Arc::new(NullSink), work)
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Supervisor for a direct-device scan: opens sessions, spawns one producer
/// thread per device, waits for them to drain, reports the terminal status.
fn run_device_scan(request: &ScanRequest, sink: &dyn ScanSink, lifecycle: &Arc<Lifecycle>) {
    let epoch = Instant::now();

    let mut sessions = Vec::new();
    for (i, port) in request.ports.iter().enumerate() {
        let device_id = i as u32;
        match VnaSession::open_with_epoch(port, device_id, epoch) {
            Ok(session) => sessions.push(session),
            Err(source) => sink.on_error(&ScanError::Device {
                device_id,
                port: port.clone(),
                source,
            }),
        }
    }

    if sessions.is_empty() {
        sink.on_error(&ScanError::AllDevicesFailed);
        lifecycle.finish();
        return;
    }

    // First device acknowledged.
    lifecycle.mark_running();
    sink.on_status(&format!("scan started on {} device(s)", sessions.len()));

    let total = sessions.len();
    let failures = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for mut session in sessions {
            let failures = Arc::clone(&failures);
            let setup = request.sweep_setup();
            let termination = request.termination;
            scope.spawn(move || {
                let result = drive_session(
                    termination,
                    epoch,
                    &lifecycle.cancel,
                    &mut |sweep_number, cancel, emit| {
                        session.run_sweep(setup, sweep_number, cancel, emit)
                    },
                    &mut |point| sink.on_sample(point),
                );
                if let Err(source) = result {
                    failures.fetch_add(1, Ordering::SeqCst);
                    sink.on_error(&ScanError::Device {
                        device_id: session.device_id(),
                        port: session.port_name().to_string(),
                        source,
                    });
                }
                session.close();
            });
        }
    });

    if failures.load(Ordering::SeqCst) == total {
        sink.on_error(&ScanError::AllDevicesFailed);
    } else {
        sink.on_status("scan complete");
    }
    lifecycle.finish();
}

/// Sweep loop for one device: run sweeps until the termination condition,
/// the cancellation flag, or a device error ends it.
fn drive_session(
    termination: Termination,
    epoch: Instant,
    cancel: &AtomicBool,
    run_sweep: &mut dyn FnMut(
        u32,
        &AtomicBool,
        &mut dyn FnMut(DataPoint),
    ) -> Result<bool, SessionError>,
    emit: &mut dyn FnMut(DataPoint),
) -> Result<(), SessionError> {
    let mut sweep_number = 0u32;
    loop {
        match termination {
            Termination::FixedSweeps(n) if sweep_number >= n => break,
            Termination::TimeLimit(limit) if epoch.elapsed() >= limit => break,
            _ => {}
        }
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if !run_sweep(sweep_number, cancel, &mut *emit)? {
            break;
        }
        sweep_number += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex32;
    use std::sync::atomic::AtomicU32;

    fn test_point(frequency_hz: u32, sweep_number: u32) -> DataPoint {
        DataPoint {
            device_id: 0,
            frequency_hz,
            s11: Complex32::new(0.0, 0.0),
            s21: Complex32::new(1.0, 0.0),
            sweep_number,
            time_sent: 0.0,
            time_received: 0.0,
        }
    }

    fn valid_request() -> ScanRequest {
        ScanRequest::new(
            50_000_000,
            900_000_000,
            101,
            Termination::FixedSweeps(1),
            vec!["/dev/ttyACM0".to_string()],
        )
    }

    #[test]
    fn test_request_validation() {
        assert!(valid_request().validate().is_ok());

        let mut r = valid_request();
        r.stop_hz = r.start_hz;
        assert!(matches!(r.validate(), Err(RequestError::StartNotBelowStop)));

        let mut r = valid_request();
        r.point_count = 0;
        assert!(matches!(r.validate(), Err(RequestError::ZeroPoints)));

        let mut r = valid_request();
        r.point_count = 102;
        assert!(matches!(r.validate(), Err(RequestError::TooManyPoints(102))));

        let mut r = valid_request();
        r.ports.clear();
        assert!(matches!(r.validate(), Err(RequestError::NoPorts)));

        let mut r = valid_request();
        r.ports.push("/dev/ttyACM0".to_string());
        assert!(matches!(r.validate(), Err(RequestError::DuplicatePort(_))));

        let mut r = valid_request();
        r.termination = Termination::FixedSweeps(0);
        assert!(matches!(r.validate(), Err(RequestError::ZeroSweeps)));
    }

    #[test]
    fn test_second_start_is_rejected_while_active() {
        let controller = ScanController::new();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        assert!(controller.launch_for_test(move |lifecycle| {
            lifecycle.mark_running();
            let _ = release_rx.recv();
            lifecycle.finish();
        }));
        assert!(controller.is_running());

        // Second start must fail synchronously while the first is active.
        assert!(!controller.launch_for_test(|lifecycle| lifecycle.finish()));
        assert!(controller.is_running());

        release_tx.send(()).unwrap();
        controller.wait_idle();
        assert!(!controller.is_running());

        // Idle again: a new scan may begin.
        assert!(controller.launch_for_test(|lifecycle| lifecycle.finish()));
        controller.wait_idle();
    }

    #[test]
    fn test_stop_drains_to_idle() {
        let controller = ScanController::new();
        assert!(controller.launch_for_test(|lifecycle| {
            lifecycle.mark_running();
            while !lifecycle.cancel.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            lifecycle.finish();
        }));

        assert!(controller.is_running());
        assert!(controller.stop());
        assert!(!controller.is_running());
        assert_eq!(controller.state(), ScanState::Idle);

        // Nothing active: stop reports false but stays safe.
        assert!(!controller.stop());
    }

    #[test]
    fn test_start_rejects_invalid_request_without_claiming_token() {
        let controller = ScanController::new();
        let (sink, events) = ChannelSink::new();

        let mut request = valid_request();
        request.ports.clear();
        assert!(!controller.start(request, sink));
        assert!(!controller.is_running());

        match events.try_recv().unwrap() {
            ScanEvent::Error(message) => assert!(message.contains("port")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, events) = ChannelSink::with_capacity(8);
        sink.on_status("scan started on 1 device(s)");
        sink.on_sample(test_point(50_000_000, 0));
        sink.on_error(&ScanError::AlreadyRunning);

        assert_eq!(
            events.try_recv().unwrap(),
            ScanEvent::Status("scan started on 1 device(s)".to_string())
        );
        assert!(matches!(events.try_recv().unwrap(), ScanEvent::Sample(_)));
        assert!(matches!(events.try_recv().unwrap(), ScanEvent::Error(_)));
    }

    #[test]
    fn test_drive_session_runs_fixed_sweep_count() {
        let cancel = AtomicBool::new(false);
        let sweeps_run = AtomicU32::new(0);
        let mut emitted = Vec::new();

        drive_session(
            Termination::FixedSweeps(3),
            Instant::now(),
            &cancel,
            &mut |sweep_number, _cancel, emit| {
                sweeps_run.fetch_add(1, Ordering::SeqCst);
                for i in 0..4 {
                    emit(test_point(1_000_000 + i, sweep_number));
                }
                Ok(true)
            },
            &mut |point| emitted.push(point),
        )
        .unwrap();

        assert_eq!(sweeps_run.load(Ordering::SeqCst), 3);
        assert_eq!(emitted.len(), 12);
        assert_eq!(emitted.last().unwrap().sweep_number, 2);
    }

    #[test]
    fn test_drive_session_stops_on_cancel() {
        let cancel = AtomicBool::new(false);
        let mut count = 0u32;

        drive_session(
            Termination::FixedSweeps(100),
            Instant::now(),
            &cancel,
            &mut |_, c, _emit| {
                count += 1;
                if count == 2 {
                    c.store(true, Ordering::Relaxed);
                }
                Ok(true)
            },
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(count, 2);
    }

    #[test]
    fn test_drive_session_time_limit_expires() {
        let cancel = AtomicBool::new(false);
        let mut count = 0u32;

        drive_session(
            Termination::TimeLimit(Duration::from_millis(20)),
            Instant::now(),
            &cancel,
            &mut |_, _, _emit| {
                count += 1;
                thread::sleep(Duration::from_millis(5));
                Ok(true)
            },
            &mut |_| {},
        )
        .unwrap();

        assert!(count >= 1);
        assert!(count <= 20);
    }

    #[test]
    fn test_drive_session_propagates_device_error() {
        let cancel = AtomicBool::new(false);
        let result = drive_session(
            Termination::FixedSweeps(5),
            Instant::now(),
            &cancel,
            &mut |_, _, _emit| {
                Err(SessionError::Frame(crate::protocol::FrameError::Truncated(
                    "record",
                )))
            },
            &mut |_| {},
        );
        assert!(result.is_err());
    }
}
