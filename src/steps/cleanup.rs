//! Cleanup: release the boot and root mounts

use super::StepContext;
use crate::error::Result;
use crate::runner::Invocation;

pub(super) fn run(ctx: &StepContext<'_>) -> Result<()> {
    for target in [ctx.paths.boot_mount(), ctx.paths.root_mount()] {
        ctx.runner.run(
            ctx.bus,
            &Invocation::new("Unmount", "umount").arg(target.display().to_string()),
        )?;
    }
    Ok(())
}
