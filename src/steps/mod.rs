//! Installation steps
//!
//! The four steps run in a fixed order; each drives external tools through
//! the [`CommandRunner`] in its [`StepContext`] and reports progress on the
//! bus. A step returns at its first failure without undoing anything.

pub mod cleanup;
pub mod configure;
pub mod copy;
pub mod partition;

use crate::error::{InstallError, Result};
use crate::install_state::InstallStage;
use crate::paths::InstallPaths;
use crate::progress::ProgressSender;
use crate::request::InstallationRequest;
use crate::runner::CommandRunner;
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

/// Mode of every configuration file the installer writes.
pub const CONFIG_FILE_MODE: u32 = 0o644;

/// Everything a step needs for one run.
pub struct StepContext<'a> {
    pub request: &'a InstallationRequest,
    pub runner: &'a dyn CommandRunner,
    pub bus: &'a ProgressSender,
    pub paths: &'a InstallPaths,
}

/// One step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum InstallStep {
    #[strum(serialize = "Format disk")]
    Partition,
    #[strum(serialize = "Copy files")]
    Copy,
    #[strum(serialize = "Configure system")]
    Configure,
    #[strum(serialize = "Cleanup")]
    Cleanup,
}

impl InstallStep {
    /// All steps in execution order.
    pub fn all() -> Vec<Self> {
        Self::iter().collect()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Stage the installer is in while this step runs.
    pub fn stage(self) -> InstallStage {
        match self {
            Self::Partition => InstallStage::Partitioning,
            Self::Copy => InstallStage::Copying,
            Self::Configure => InstallStage::Configuring,
            Self::Cleanup => InstallStage::CleaningUp,
        }
    }

    pub fn run(self, ctx: &StepContext<'_>) -> Result<()> {
        match self {
            Self::Partition => partition::run(ctx),
            Self::Copy => copy::run(ctx),
            Self::Configure => configure::run(ctx),
            Self::Cleanup => cleanup::run(ctx),
        }
    }
}

/// Write `contents` to `path` with [`CONFIG_FILE_MODE`], replacing any
/// existing file and its permissions.
pub(crate) fn write_config_file(bus: &ProgressSender, path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CONFIG_FILE_MODE)
        .open(path)
        .map_err(|e| InstallError::io(path, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| InstallError::io(path, e))?;
    fs::set_permissions(path, Permissions::from_mode(CONFIG_FILE_MODE))
        .map_err(|e| InstallError::io(path, e))?;

    bus.info(format!("  {} written", path.display()));
    Ok(())
}

/// Replace every `(placeholder, value)` pair in `template`, in order.
pub(crate) fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    substitutions
        .iter()
        .fold(template.to_string(), |acc, (placeholder, value)| {
            acc.replace(placeholder, value)
        })
}
