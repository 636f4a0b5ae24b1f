//! Installation pipeline driver
//!
//! Runs the steps in order on one background thread. Before a step starts a
//! transition event carries its 1-based index; after it succeeds a
//! `Finished` line follows. The first failure is reported as exactly one
//! error event and nothing after it runs. Nothing is rolled back.

use crate::error::{InstallError, Result};
use crate::install_state::{InstallStage, InstallerContext};
use crate::paths::InstallPaths;
use crate::progress::{ProgressObserver, ProgressReceiver, ProgressSender, bus, drain_into};
use crate::request::InstallationRequest;
use crate::runner::CommandRunner;
use crate::steps::{InstallStep, StepContext};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Last line on the bus after a successful run.
pub const COMPLETION_MESSAGE: &str =
    "Installation has finished. You may now power-cycle the computer and remove the installation media.";

/// How a run ended.
#[derive(Debug)]
pub enum InstallOutcome {
    Completed,
    Failed {
        stage: InstallStage,
        error: InstallError,
    },
    /// The pipeline thread panicked.
    Crashed(String),
}

impl InstallOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

fn fail(
    context: &mut InstallerContext,
    bus: &ProgressSender,
    error: InstallError,
) -> InstallOutcome {
    let stage = context.current_stage();
    if let Err(e) = context.fail() {
        log::warn!("could not record failure: {}", e);
    }
    log::error!("installation failed during {}: {}", stage, error);
    let reached: Vec<String> = context
        .stage_history()
        .iter()
        .map(|(entered, at)| format!("{}@{}", entered, at))
        .collect();
    log::debug!("stages entered: {}", reached.join(", "));
    bus.error(format!("Error!: {}", error));
    InstallOutcome::Failed { stage, error }
}

/// Run `steps` in order through `exec`, stopping at the first failure.
///
/// `context` must be at [`InstallStage::NotStarted`] with destructive
/// operations confirmed; an illegal stage transition is reported like any
/// other failure.
pub fn drive<F>(
    steps: &[InstallStep],
    context: &mut InstallerContext,
    bus: &ProgressSender,
    mut exec: F,
) -> InstallOutcome
where
    F: FnMut(InstallStep) -> Result<()>,
{
    for (index, &step) in steps.iter().enumerate() {
        let number = index + 1;
        let _span = tracing::info_span!("install_step", number, name = step.name()).entered();

        if let Err(e) = context.transition_to(step.stage()) {
            return fail(context, bus, e.into());
        }
        bus.transition(number, format!("Starting {}", step));
        log::info!("Starting step {}: {}", number, step);

        if let Err(e) = exec(step) {
            return fail(context, bus, e);
        }
        bus.cmd(format!("Finished {}", step));
    }

    if let Err(e) = context.transition_to(InstallStage::Completed) {
        return fail(context, bus, e.into());
    }
    log::info!("installation complete");
    bus.cmd(COMPLETION_MESSAGE);
    InstallOutcome::Completed
}

/// A running installation.
pub struct InstallHandle {
    receiver: ProgressReceiver,
    thread: JoinHandle<InstallOutcome>,
}

impl InstallHandle {
    /// Feed every event to `observer` on the calling thread, then wait for
    /// the pipeline to finish.
    pub fn wait_with<O: ProgressObserver + ?Sized>(self, observer: &mut O) -> InstallOutcome {
        let events = drain_into(self.receiver, observer);
        log::debug!("observer applied {} progress events", events);
        join(self.thread)
    }
}

/// Wait for the pipeline thread, turning a panic into [`InstallOutcome::Crashed`].
pub fn join(thread: JoinHandle<InstallOutcome>) -> InstallOutcome {
    thread.join().unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("install pipeline panicked: {}", message);
        InstallOutcome::Crashed(message)
    })
}

/// Start installing `request` on a dedicated thread.
///
/// Calling this is the confirmation that the target disk may be
/// overwritten. Progress arrives on the returned handle's receiver; the
/// channel closes once the pipeline thread has finished.
pub fn start_install(
    request: InstallationRequest,
    runner: Arc<dyn CommandRunner>,
    paths: InstallPaths,
) -> Result<InstallHandle> {
    let (sender, receiver) = bus();
    log::info!("starting installation onto {}", request.disk().path);

    let thread = thread::Builder::new()
        .name("install-pipeline".into())
        .spawn(move || {
            let mut context = InstallerContext::new();
            context.confirm_destructive_operations();
            let step_context = StepContext {
                request: &request,
                runner: runner.as_ref(),
                bus: &sender,
                paths: &paths,
            };
            drive(&InstallStep::all(), &mut context, &sender, |step| {
                step.run(&step_context)
            })
        })
        .map_err(|source| InstallError::Spawn {
            program: "install-pipeline".into(),
            source,
        })?;

    Ok(InstallHandle { receiver, thread })
}
