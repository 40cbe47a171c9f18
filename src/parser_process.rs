//! Scan source backed by the external measurement process.
//!
//! The external parser executable takes a command script on stdin
//! (`set start/stop/points/sweeps`, `vna add <port>`, `scan sweeps|time`,
//! `exit`) and streams the single-field line protocol on stdout. This module
//! derives the script from a [`ScanRequest`], pipes the child's stdout
//! through the [`StreamReassembler`], and implements the stop ladder:
//! cooperative flag, then closing the child's stdin, then a kill once the
//! grace period expires.

use crate::scan_controller::{Lifecycle, ScanError, ScanRequest, ScanSink, Termination};
use crate::text_stream::{LineEvent, StreamReassembler};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long a stopping child may keep running after its stdin closes.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Status message cadence, in emitted samples.
const STATUS_EVERY: u64 = 10;

/// Poll interval for the stop watchdog.
const WATCH_INTERVAL: Duration = Duration::from_millis(20);

/// Location and arguments of the external parser executable.
#[derive(Debug, Clone)]
pub struct ParserCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stop_grace: Duration,
}

impl ParserCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stop_grace: STOP_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Build the stdin script driving one scan.
pub(crate) fn build_command_script(request: &ScanRequest) -> String {
    let mut lines = vec![
        format!("set start {}", request.start_hz),
        format!("set stop {}", request.stop_hz),
        "set scans 1".to_string(),
        format!("set points {}", request.point_count),
        "set verbose true".to_string(),
    ];
    match request.termination {
        Termination::FixedSweeps(n) => lines.push(format!("set sweeps {n}")),
        Termination::TimeLimit(limit) => {
            lines.push(format!("set sweeps {}", limit.as_secs().max(1)));
        }
    }
    for port in &request.ports {
        lines.push(format!("vna add {port}"));
    }
    lines.push(match request.termination {
        Termination::FixedSweeps(_) => "scan sweeps".to_string(),
        Termination::TimeLimit(_) => "scan time".to_string(),
    });
    lines.push("exit".to_string());
    lines.join("\n") + "\n"
}

/// Worker body for a subprocess-backed scan. Runs on the controller's worker
/// thread and always drives the lifecycle back to `Idle`.
pub(crate) fn run_parser_scan(
    parser: &ParserCommand,
    request: &ScanRequest,
    sink: &dyn ScanSink,
    lifecycle: &Arc<Lifecycle>,
) {
    let mut child = match parser
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            sink.on_error(&ScanError::Process(format!(
                "failed to spawn {}: {e}",
                parser.program.display()
            )));
            lifecycle.finish();
            return;
        }
    };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    if let Some(mut pipe) = stdin.as_ref() {
        // A child that exits before reading the script breaks the pipe;
        // whatever it printed first is still worth draining.
        if let Err(e) = pipe.write_all(build_command_script(request).as_bytes()) {
            log::debug!("could not write command script: {e}");
        }
        let _ = pipe.flush();
    }

    let child = Mutex::new(child);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| stop_watchdog(&child, stdin, &done, lifecycle, parser.stop_grace));

        match stdout {
            Some(stdout) => read_stream(BufReader::new(stdout), sink, lifecycle),
            None => sink.on_error(&ScanError::Process(
                "measurement process has no stdout".to_string(),
            )),
        }
        done.store(true, Ordering::Relaxed);
    });

    let cancelled = lifecycle.cancel.load(Ordering::Relaxed);
    match child.into_inner().expect("child lock poisoned").wait() {
        Ok(status) if status.success() => sink.on_status("scan complete"),
        Ok(status) if cancelled => {
            log::debug!("measurement process stopped with {status}");
            sink.on_status("scan stopped");
        }
        Ok(status) => sink.on_error(&ScanError::Process(format!(
            "measurement process exited with {status}"
        ))),
        Err(e) => sink.on_error(&ScanError::Process(format!(
            "failed to reap measurement process: {e}"
        ))),
    }
    lifecycle.finish();
}

/// Pump the child's stdout through the reassembler until EOF or cancel.
fn read_stream(
    reader: BufReader<impl std::io::Read>,
    sink: &dyn ScanSink,
    lifecycle: &Arc<Lifecycle>,
) {
    let mut reassembler = StreamReassembler::new();
    let mut emitted = 0u64;

    for line in reader.lines() {
        if lifecycle.cancel.load(Ordering::Relaxed) {
            break;
        }
        let Ok(line) = line else { break };

        match reassembler.push_line(&line) {
            LineEvent::DataHeader => {
                lifecycle.mark_running();
                sink.on_status("data header received, collecting");
            }
            LineEvent::Sample(point) => {
                emitted += 1;
                if emitted % STATUS_EVERY == 0 {
                    sink.on_status(&format!("received {emitted} data points"));
                }
                sink.on_sample(point);
            }
            LineEvent::SavePath(path) => {
                sink.on_status(&format!("saving data to {path}"));
            }
            // Non-fatal: the producer keeps streaming after reporting one.
            LineEvent::ProducerError(message) => {
                sink.on_status(&format!("scanner error: {message}"));
            }
            LineEvent::Stored | LineEvent::Skipped => {}
        }
    }

    let leaked = reassembler.finish();
    if leaked > 0 {
        sink.on_status(&format!("{leaked} incomplete records discarded"));
    }
}

/// Watch for the cancellation flag: close stdin first (the parser exits on
/// end of script input), then kill once the grace period runs out.
fn stop_watchdog(
    child: &Mutex<Child>,
    stdin: Option<ChildStdin>,
    done: &AtomicBool,
    lifecycle: &Arc<Lifecycle>,
    grace: Duration,
) {
    let mut stdin = stdin;
    loop {
        if done.load(Ordering::Relaxed) {
            return;
        }
        if lifecycle.cancel.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(WATCH_INTERVAL);
    }

    // Termination request: drop our end of the child's stdin.
    drop(stdin.take());

    let deadline = Instant::now() + grace;
    loop {
        let exited = child
            .lock()
            .expect("child lock poisoned")
            .try_wait()
            .ok()
            .flatten()
            .is_some();
        if exited {
            return;
        }
        if Instant::now() >= deadline {
            log::warn!("measurement process ignored stop request, killing it");
            let _ = child.lock().expect("child lock poisoned").kill();
            return;
        }
        thread::sleep(WATCH_INTERVAL);
    }
}
