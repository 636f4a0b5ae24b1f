//! Install state machine
//!
//! Tracks which pipeline stage is running and refuses anything other than
//! a single forward step, so the driver cannot skip or repeat a stage.
//!
//! ```text
//! NotStarted
//!     ↓
//! Partitioning   (destructive, needs confirmation)
//!     ↓
//! Copying
//!     ↓
//! Configuring
//!     ↓
//! CleaningUp
//!     ↓
//! Completed
//!
//! (any non-terminal stage can transition to Failed)
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Installation stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InstallStage {
    #[default]
    NotStarted = 0,
    /// Partition table, filesystems and LUKS volume are created
    Partitioning = 1,
    /// Live tree is copied onto the new partitions
    Copying = 2,
    /// Bootloader, initramfs and accounts are set up in the new root
    Configuring = 3,
    /// Target filesystems are unmounted
    CleaningUp = 4,
    Completed = 5,
    Failed = 255,
}

impl InstallStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Entering this stage overwrites the target disk.
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Partitioning)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Partitioning),
            Self::Partitioning => Some(Self::Copying),
            Self::Copying => Some(Self::Configuring),
            Self::Configuring => Some(Self::CleaningUp),
            Self::CleaningUp => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Partitioning => "Partitioning disk",
            Self::Copying => "Copying files",
            Self::Configuring => "Configuring system",
            Self::CleaningUp => "Cleaning up",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A rejected stage transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: InstallStage, to: InstallStage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: InstallStage, to: InstallStage },

    #[error("Cannot leave terminal stage {from}")]
    FromTerminalState { from: InstallStage },

    #[error("{stage} overwrites the target disk and has not been confirmed")]
    MissingConfirmation { stage: InstallStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: InstallStage },
}

/// Owner of the current stage for one installation run.
///
/// ```
/// use twlinst::install_state::{InstallStage, InstallerContext};
///
/// let mut ctx = InstallerContext::new();
/// assert!(ctx.transition_to(InstallStage::Partitioning).is_err());
///
/// ctx.confirm_destructive_operations();
/// ctx.transition_to(InstallStage::Partitioning).unwrap();
/// assert!(ctx.transition_to(InstallStage::Configuring).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InstallerContext {
    current: InstallStage,
    failed_at: Option<InstallStage>,
    /// (stage entered, seconds since the epoch)
    stage_history: Vec<(InstallStage, u64)>,
    destructive_confirmed: bool,
}

impl InstallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    /// The stage that was running when [`fail`](Self::fail) was called.
    #[inline]
    pub fn failed_at(&self) -> Option<InstallStage> {
        self.failed_at
    }

    /// Every stage entered so far, with the time it was entered.
    pub fn stage_history(&self) -> &[(InstallStage, u64)] {
        &self.stage_history
    }

    /// Authorize entering destructive stages. Cannot be revoked.
    pub fn confirm_destructive_operations(&mut self) {
        self.destructive_confirmed = true;
    }

    /// Move to `target`, which must be the immediate successor of the
    /// current stage.
    pub fn transition_to(
        &mut self,
        target: InstallStage,
    ) -> Result<InstallStage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if target == InstallStage::Failed {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if target.is_destructive() && !self.destructive_confirmed {
            return Err(InstallTransitionError::MissingConfirmation { stage: target });
        }

        self.record(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the run as failed at the current stage.
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(InstallStage::Failed);
        self.current = InstallStage::Failed;
        Ok(())
    }

    fn record(&mut self, stage: InstallStage) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::debug!("entering stage: {}", stage);
        self.stage_history.push((stage, timestamp));
    }
}
