//! Progress bus
//!
//! A bounded, blocking, FIFO channel carrying [`ProgressEvent`]s from the
//! pipeline thread to whoever is watching. Senders block while the channel
//! is full; nothing is ever dropped. The channel closes when the last sender
//! goes away, which is how observers learn the pipeline thread has exited.

use std::sync::mpsc::{self, Receiver, SyncSender};

/// Number of events that may be queued before senders block.
pub const BUS_CAPACITY: usize = 2;

/// How a line should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LineKind {
    Command,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub kind: LineKind,
    pub text: String,
}

/// One unit of progress output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressEvent {
    /// 1-based index of the step that is starting
    pub step: Option<usize>,
    pub line: Option<EventLine>,
    /// The line overwrites the previous one (e.g. `dd status=progress`)
    pub is_progress: bool,
}

impl ProgressEvent {
    fn with_line(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            line: Some(EventLine {
                kind,
                text: text.into(),
            }),
            ..Self::default()
        }
    }

    pub fn command(text: impl Into<String>) -> Self {
        Self::with_line(LineKind::Command, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::with_line(LineKind::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::with_line(LineKind::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::with_line(LineKind::Error, text)
    }

    /// Marks the start of step `step` (1-based).
    pub fn transition(step: usize, text: impl Into<String>) -> Self {
        Self {
            step: Some(step),
            ..Self::command(text)
        }
    }

    /// Mark this event as overwriting the previous line.
    pub fn transient(mut self) -> Self {
        self.is_progress = true;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(&self.line, Some(l) if l.kind == LineKind::Error)
    }

    pub fn text(&self) -> Option<&str> {
        self.line.as_ref().map(|l| l.text.as_str())
    }
}

/// Create a connected sender/receiver pair.
pub fn bus() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::sync_channel(BUS_CAPACITY);
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Producer half of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: SyncSender<ProgressEvent>,
}

impl ProgressSender {
    /// Queue an event, blocking while the bus is full.
    ///
    /// If the observer has gone away the event is logged and discarded; the
    /// pipeline keeps running to completion either way.
    pub fn send(&self, event: ProgressEvent) {
        if let Err(mpsc::SendError(event)) = self.tx.send(event) {
            log::debug!("progress observer gone, discarding {:?}", event);
        }
    }

    pub fn cmd(&self, text: impl Into<String>) {
        self.send(ProgressEvent::command(text));
    }

    pub fn info(&self, text: impl Into<String>) {
        self.send(ProgressEvent::info(text));
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.send(ProgressEvent::warning(text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.send(ProgressEvent::error(text));
    }

    pub fn transition(&self, step: usize, text: impl Into<String>) {
        self.send(ProgressEvent::transition(step, text));
    }
}

/// Consumer half of the bus. Iterating ends when every sender is dropped.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Block for the next event; `None` once the bus is closed.
    pub fn recv(&self) -> Option<ProgressEvent> {
        self.rx.recv().ok()
    }
}

impl Iterator for ProgressReceiver {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        self.recv()
    }
}

/// Something that renders progress events on the thread that owns it.
pub trait ProgressObserver {
    fn apply(&mut self, event: &ProgressEvent);
}

/// Apply every event from `receiver` to `observer` until the bus closes.
///
/// Returns the number of events applied.
pub fn drain_into<O: ProgressObserver + ?Sized>(receiver: ProgressReceiver, observer: &mut O) -> usize {
    let mut applied = 0;
    for event in receiver {
        observer.apply(&event);
        applied += 1;
    }
    applied
}

/// Plain-text log of an installation, as a scrolling view would show it.
///
/// Each line is appended with a trailing newline. A transient event first
/// removes the last line, so a run of progress lines keeps replacing itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    text: String,
    active_step: Option<usize>,
    saw_error: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The step most recently announced by a transition event.
    pub fn active_step(&self) -> Option<usize> {
        self.active_step
    }

    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    fn cut_last_line(&mut self) {
        let Some(last) = self.text.rfind('\n').filter(|&i| i > 0) else {
            return;
        };
        if let Some(prev) = self.text[..last].rfind('\n').filter(|&i| i > 0) {
            self.text.truncate(prev + 1);
        }
    }
}

impl ProgressObserver for Transcript {
    fn apply(&mut self, event: &ProgressEvent) {
        if let Some(step) = event.step {
            self.active_step = Some(step);
        }
        if event.is_progress {
            self.cut_last_line();
        }
        if let Some(line) = &event.line {
            if line.kind == LineKind::Error {
                self.saw_error = true;
            }
            self.text.push_str(&line.text);
            self.text.push('\n');
        }
    }
}
