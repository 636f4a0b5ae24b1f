//! External tool execution
//!
//! Every tool the pipeline needs goes through [`CommandRunner`], so a step
//! never touches `std::process` directly. [`SystemRunner`] spawns real
//! processes; [`RecordingRunner`] records invocations without executing
//! anything and is what the step tests drive.
//!
//! Both echo each invocation onto the progress bus before running it. Bytes
//! fed to stdin (passphrases) are never echoed.

use crate::error::{InstallError, Result};
use crate::process_guard::{ChildTracker, CommandProcessGroup};
use crate::progress::{ProgressEvent, ProgressSender};
use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, SyncSender};
use zeroize::Zeroizing;

/// Combined output shorter than this is not echoed.
const ECHO_THRESHOLD: usize = 4;

/// Trailing stderr lines kept for the error of a failed streamed command.
const STDERR_TAIL: usize = 8;

/// Capacity of the channel merging a child's stdout and stderr.
const MERGE_CAPACITY: usize = 16;

/// Bytes written to a child's stdin. Zeroized on drop, hidden from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct StdinPayload(Zeroizing<Vec<u8>>);

impl StdinPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for StdinPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes>", self.0.len())
    }
}

/// One external tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Short human description shown before the command line
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment, applied on top of the installer's own
    pub env: Vec<(String, String)>,
    pub stdin: Option<StdinPayload>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Force untranslated tool messages for output that gets inspected.
    pub fn c_locale(self) -> Self {
        self.env("LC_ALL", "C")
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(StdinPayload(Zeroizing::new(bytes.into())));
        self
    }

    /// `program arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// The line echoed onto the bus before the tool runs.
    pub fn echo(&self) -> String {
        format!("  {}: {}", self.label, self.command_line())
    }
}

/// How streamed output is mapped onto events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// stdout lines are info, stderr lines are warnings
    #[default]
    Lines,
    /// Both streams are transient info lines (`dd status=progress`)
    Progress,
}

/// Executes external tools for the pipeline.
pub trait CommandRunner: Send + Sync {
    /// Run to completion, discarding stdout.
    fn run(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<()> {
        self.output(bus, invocation).map(drop)
    }

    /// Run to completion, capturing output.
    ///
    /// The invocation and its combined output are echoed onto `bus`. Returns
    /// stdout on success.
    fn output(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<String>;

    /// Run while streaming output line by line onto `bus`.
    fn run_interactive(
        &self,
        bus: &ProgressSender,
        invocation: &Invocation,
        mode: StreamMode,
    ) -> Result<()>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn output(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<String> {
        (**self).output(bus, invocation)
    }

    fn run_interactive(
        &self,
        bus: &ProgressSender,
        invocation: &Invocation,
        mode: StreamMode,
    ) -> Result<()> {
        (**self).run_interactive(bus, invocation, mode)
    }
}

// ============================================================================
// SystemRunner
// ============================================================================

/// Runs tools as real child processes.
///
/// Children get their own process group and a parent-death signal, and are
/// tracked in the global child registry while they run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn spawn(invocation: &Invocation) -> Result<std::process::Child> {
        let stdin = if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|source| InstallError::Spawn {
                program: invocation.program.clone(),
                source,
            })
    }
}

fn feed_stdin(stdin: Option<std::process::ChildStdin>, payload: Option<&StdinPayload>) {
    if let (Some(mut pipe), Some(payload)) = (stdin, payload) {
        if let Err(e) = pipe.write_all(payload.as_bytes()) {
            log::warn!("writing to child stdin failed: {}", e);
        }
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<String> {
        bus.info(invocation.echo());
        log::debug!("running {}", invocation.command_line());

        let mut child = Self::spawn(invocation)?;
        let _tracker = ChildTracker::track(child.id());
        let stdin = child.stdin.take();

        let output = std::thread::scope(|s| {
            s.spawn(|| feed_stdin(stdin, invocation.stdin.as_ref()));
            child.wait_with_output()
        })
        .map_err(|source| InstallError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut combined = stdout.clone();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if combined.len() > ECHO_THRESHOLD {
            bus.info(format!("  Output: {:?}", combined));
        }

        if !output.status.success() {
            return Err(InstallError::Command {
                label: invocation.label.clone(),
                program: invocation.program.clone(),
                status: output.status,
                output: combined,
            });
        }
        Ok(stdout)
    }

    fn run_interactive(
        &self,
        bus: &ProgressSender,
        invocation: &Invocation,
        mode: StreamMode,
    ) -> Result<()> {
        bus.info(invocation.echo());
        log::debug!("streaming {}", invocation.command_line());

        let mut child = Self::spawn(invocation)?;
        let _tracker = ChildTracker::track(child.id());
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::sync_channel(MERGE_CAPACITY);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);

        std::thread::scope(|s| {
            s.spawn(|| feed_stdin(stdin, invocation.stdin.as_ref()));
            if let Some(out) = stdout {
                let tx = tx.clone();
                s.spawn(move || pump_lines(out, Stream::Stdout, &tx));
            }
            if let Some(err) = stderr {
                let tx = tx.clone();
                s.spawn(move || pump_lines(err, Stream::Stderr, &tx));
            }
            drop(tx);

            for (stream, line) in rx {
                if stream == Stream::Stderr {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                if let Some(event) = stream_event(stream, &line, mode) {
                    bus.send(event);
                }
            }
        });

        let status = child.wait().map_err(|source| InstallError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        check_status(invocation, status, tail.into_iter().collect::<Vec<_>>().join("\n"))
    }
}

fn check_status(invocation: &Invocation, status: ExitStatus, output: String) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(InstallError::Command {
            label: invocation.label.clone(),
            program: invocation.program.clone(),
            status,
            output,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Map one raw output segment to a bus event, dropping blank fragments.
fn stream_event(stream: Stream, raw: &str, mode: StreamMode) -> Option<ProgressEvent> {
    let line = raw.trim_matches(|c: char| c == ' ' || c == '\r' || c == '\n');
    if line.len() < 2 {
        return None;
    }
    let text = format!("    {}", line);
    Some(match (mode, stream) {
        (StreamMode::Progress, _) => ProgressEvent::info(text).transient(),
        (StreamMode::Lines, Stream::Stdout) => ProgressEvent::info(text),
        (StreamMode::Lines, Stream::Stderr) => ProgressEvent::warning(text),
    })
}

/// Read `reader` to EOF, sending each `\n`- or `\r`-terminated segment.
fn pump_lines<R: Read>(mut reader: R, stream: Stream, tx: &SyncSender<(Stream, String)>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("reading child {:?} failed: {}", stream, e);
                break;
            }
        };
        for &b in &chunk[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send((stream, line)).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(b);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&pending).into_owned()));
    }
}

// ============================================================================
// RecordingRunner
// ============================================================================

#[cfg(any(test, feature = "test-support"))]
pub use recording::RecordingRunner;

#[cfg(any(test, feature = "test-support"))]
mod recording {
    use super::{CommandRunner, Invocation, Stream, StreamMode, stream_event};
    use crate::error::{InstallError, Result};
    use crate::progress::ProgressSender;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    /// Runner that records invocations instead of executing them.
    ///
    /// Responses and failures are matched by substring against
    /// [`Invocation::command_line`]; the first match wins. Unmatched calls
    /// succeed with empty output.
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        calls: Mutex<Vec<Invocation>>,
        responses: Vec<(String, String)>,
        failures: Vec<(String, String)>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Return `stdout` for commands containing `needle`.
        pub fn respond(mut self, needle: impl Into<String>, stdout: impl Into<String>) -> Self {
            self.responses.push((needle.into(), stdout.into()));
            self
        }

        /// Fail commands containing `needle` with exit status 1 and `output`.
        pub fn fail_when(mut self, needle: impl Into<String>, output: impl Into<String>) -> Self {
            self.failures.push((needle.into(), output.into()));
            self
        }

        /// Every invocation seen so far, in order.
        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(Invocation::command_line).collect()
        }

        fn record(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<String> {
            bus.info(invocation.echo());
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation.clone());
            }

            let line = invocation.command_line();
            if let Some((_, output)) = self.failures.iter().find(|(n, _)| line.contains(n.as_str())) {
                return Err(InstallError::Command {
                    label: invocation.label.clone(),
                    program: invocation.program.clone(),
                    status: ExitStatus::from_raw(1 << 8),
                    output: output.clone(),
                });
            }
            Ok(self
                .responses
                .iter()
                .find(|(n, _)| line.contains(n.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default())
        }
    }

    impl CommandRunner for RecordingRunner {
        fn output(&self, bus: &ProgressSender, invocation: &Invocation) -> Result<String> {
            self.record(bus, invocation)
        }

        fn run_interactive(
            &self,
            bus: &ProgressSender,
            invocation: &Invocation,
            mode: StreamMode,
        ) -> Result<()> {
            let stdout = self.record(bus, invocation)?;
            for line in stdout.split(['\n', '\r']) {
                if let Some(event) = stream_event(Stream::Stdout, line, mode) {
                    bus.send(event);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{LineKind, bus};
    use std::io::Cursor;

    fn collect<F: FnOnce(&ProgressSender) + Send>(f: F) -> Vec<ProgressEvent> {
        let (tx, rx) = bus();
        std::thread::scope(|s| {
            s.spawn(move || f(&tx));
            rx.collect()
        })
    }

    #[test]
    fn test_pump_splits_on_newline_and_carriage_return() {
        let (tx, rx) = mpsc::sync_channel(64);
        pump_lines(
            Cursor::new(b"first\r\n1024 bytes\r2048 bytes\rlast".to_vec()),
            Stream::Stderr,
            &tx,
        );
        drop(tx);
        let lines: Vec<String> = rx.into_iter().map(|(_, l)| l).collect();
        assert_eq!(lines, vec!["first", "1024 bytes", "2048 bytes", "last"]);
    }

    #[test]
    fn test_stream_event_drops_short_fragments() {
        assert!(stream_event(Stream::Stdout, " x ", StreamMode::Lines).is_none());
        assert!(stream_event(Stream::Stdout, "\r\n", StreamMode::Lines).is_none());

        let ev = stream_event(Stream::Stderr, " warning: slow ", StreamMode::Lines)
            .expect("kept line"); // test: two or more chars
        assert_eq!(ev.line.as_ref().map(|l| l.kind), Some(LineKind::Warning));
        assert_eq!(ev.text(), Some("    warning: slow"));

        let ev = stream_event(Stream::Stderr, "512 MiB copied", StreamMode::Progress)
            .expect("kept line"); // test: two or more chars
        assert!(ev.is_progress);
        assert_eq!(ev.line.as_ref().map(|l| l.kind), Some(LineKind::Info));
    }

    #[test]
    fn test_echo_never_contains_stdin() {
        let inv = Invocation::new("Unlocking root", "cryptsetup")
            .args(["luksOpen", "--key-file", "-", "/dev/sda2", "cryptroot"])
            .stdin("hunter22");
        assert_eq!(
            inv.echo(),
            "  Unlocking root: cryptsetup luksOpen --key-file - /dev/sda2 cryptroot"
        );
        assert!(!format!("{:?}", inv).contains("hunter22"));
    }

    #[test]
    fn test_system_runner_captures_stdout() {
        let inv = Invocation::new("echo", "sh").args(["-c", "printf 'abc-uuid\\n'"]);
        let mut out = None;
        let events = collect(|bus| out = Some(SystemRunner.output(bus, &inv)));
        let stdout = out.expect("ran").expect("sh succeeds"); // test: sh is always present
        assert_eq!(stdout.trim(), "abc-uuid");
        assert_eq!(events[0].text(), Some("  echo: sh -c printf 'abc-uuid\\n'"));
        assert!(events.iter().any(|e| e.text().is_some_and(|t| t.starts_with("  Output:"))));
    }

    #[test]
    fn test_system_runner_feeds_stdin() {
        let inv = Invocation::new("cat", "cat").stdin("from-stdin");
        let mut out = None;
        collect(|bus| out = Some(SystemRunner.output(bus, &inv)));
        assert_eq!(out.expect("ran").expect("cat succeeds"), "from-stdin");
    }

    #[test]
    fn test_system_runner_reports_exit_status() {
        let inv = Invocation::new("fail", "sh").args(["-c", "echo oops >&2; exit 3"]);
        let mut out = None;
        collect(|bus| out = Some(SystemRunner.run(bus, &inv)));
        let err = out.expect("ran").unwrap_err();
        match err {
            InstallError::Command { label, status, output, .. } => {
                assert_eq!(label, "fail");
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_system_runner_spawn_failure() {
        let inv = Invocation::new("missing", "/nonexistent/twlinst-tool");
        let mut out = None;
        collect(|bus| out = Some(SystemRunner.run(bus, &inv)));
        assert!(matches!(out.expect("ran"), Err(InstallError::Spawn { .. })));
    }

    #[test]
    fn test_interactive_streams_both_outputs_and_keeps_stderr_tail() {
        let inv = Invocation::new("stream", "sh")
            .args(["-c", "echo out-line; echo err-line >&2; exit 1"]);
        let mut out = None;
        let events = collect(|bus| out = Some(SystemRunner.run_interactive(bus, &inv, StreamMode::Lines)));

        let err = out.expect("ran").unwrap_err();
        assert!(err.to_string().contains("err-line"));
        assert!(events.iter().any(|e| e.text() == Some("    out-line")
            && e.line.as_ref().map(|l| l.kind) == Some(LineKind::Info)));
        assert!(events.iter().any(|e| e.text() == Some("    err-line")
            && e.line.as_ref().map(|l| l.kind) == Some(LineKind::Warning)));
    }

    #[test]
    fn test_recording_runner_scripted_responses() {
        let runner = RecordingRunner::new()
            .respond("lsblk", "1234-ABCD\n")
            .fail_when("partprobe", "Error: device busy");
        let mut results = Vec::new();
        collect(|bus| {
            results.push(runner.output(bus, &Invocation::new("uuid", "lsblk").arg("/dev/sda1")).ok());
            results.push(runner.output(bus, &Invocation::new("probe", "partprobe").arg("/dev/sda")).ok());
        });
        assert_eq!(results, vec![Some("1234-ABCD\n".to_string()), None]);
        assert_eq!(
            runner.command_lines(),
            vec!["lsblk /dev/sda1".to_string(), "partprobe /dev/sda".to_string()]
        );
    }
}
