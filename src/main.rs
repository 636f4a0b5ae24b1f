//! twlinst - main entry point
//!
//! A thin front end over the library: scans disks, validates a request file
//! and runs the pipeline while rendering its progress on the terminal.

use anyhow::{Context, bail};
use crossterm::style::{PrintStyledContent, Stylize};
use crossterm::terminal::{Clear, ClearType};
use crossterm::{cursor, queue};
use log::{debug, info};
use std::io::{Stdout, Write, stdout};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use twlinst::cli::{Cli, Commands};
use twlinst::pipeline::{self, InstallOutcome};
use twlinst::progress::{LineKind, ProgressEvent, ProgressObserver};
use twlinst::{
    DiskInventory, InstallPaths, InstallStep, InstallationRequest, InterruptPolicy,
    PackageCatalog, ProcessGuard, RequestConfig, SystemRunner, byte_count_decimal, disks,
};

/// Initialize logging: `info` by default, `RUST_LOG` overrides.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    info!("twlinst starting up");

    // Tools still running when main returns are terminated with their groups.
    let _guard = ProcessGuard::new();
    let policy = InterruptPolicy::new();
    if let Err(e) = twlinst::process_guard::init_signal_handlers(policy.clone()) {
        log::warn!("Failed to initialize signal handlers: {}", e);
    }

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    let mut paths = InstallPaths::default();
    if let Some(base) = cli.mount_base {
        paths.mount_base = base;
    }

    match cli.command {
        Commands::Disks { json } => list_disks(json),
        Commands::Packages { cache } => {
            list_packages(cache.as_deref().unwrap_or(paths.package_cache.as_path()))
        }
        Commands::Validate { request } => {
            let (request, catalog) = load_request(&request, &paths)?;
            print_summary(&request, &catalog);
            println!("✓ Request is valid");
            Ok(())
        }
        Commands::Install { request, yes } => {
            let (request, catalog) = load_request(&request, &paths)?;
            print_summary(&request, &catalog);
            if !yes {
                bail!("refusing to erase {} without --yes", request.disk().path);
            }
            install(request, paths, &policy)
        }
    }
}

fn list_disks(json: bool) -> anyhow::Result<()> {
    let inventory = disks::scan().context("Failed to scan block devices")?;
    if json {
        let out = serde_json::to_string_pretty(inventory.disks())
            .context("Failed to serialize disk inventory")?;
        println!("{}", out);
        return Ok(());
    }

    if inventory.is_empty() {
        println!("No disks found.");
    }
    for disk in inventory.disks() {
        println!("{}", disk.summary());
        println!("    {}", byte_count_decimal(disk.capacity_bytes()));
        for part in &disk.partitions {
            println!("    {:2}: {} {}", part.number, part.path, part.fs_type);
        }
    }
    Ok(())
}

fn list_packages(cache: &Path) -> anyhow::Result<()> {
    let catalog = PackageCatalog::load(cache)
        .with_context(|| format!("Failed to read package cache {}", cache.display()))?;
    if catalog.is_empty() {
        println!("No optional packages in {}", cache.display());
    }
    for pkg in catalog.packages() {
        println!("{:20} {}", pkg.name, pkg.label());
    }
    Ok(())
}

fn load_request(
    file: &Path,
    paths: &InstallPaths,
) -> anyhow::Result<(InstallationRequest, PackageCatalog)> {
    let config = RequestConfig::load_from_file(file)?;
    let inventory: DiskInventory = disks::scan().context("Failed to scan block devices")?;
    let catalog = PackageCatalog::load(&paths.package_cache)
        .with_context(|| format!("Failed to read package cache {}", paths.package_cache.display()))?;
    let request = config
        .resolve(&inventory, Some(&catalog))
        .with_context(|| format!("Invalid request in {}", file.display()))?;
    Ok((request, catalog))
}

fn print_summary(request: &InstallationRequest, catalog: &PackageCatalog) {
    print!("{}", request.summary(Some(catalog)));
    for warning in request.warnings() {
        println!("⚠ {}", warning);
    }
    println!();
}

fn install(
    request: InstallationRequest,
    paths: InstallPaths,
    policy: &InterruptPolicy,
) -> anyhow::Result<()> {
    policy.set_installing(true);
    let handle = pipeline::start_install(request, Arc::new(SystemRunner), paths)
        .context("Failed to start installation")?;
    let mut observer = TerminalObserver::new(InstallStep::all().len());
    let outcome = handle.wait_with(&mut observer);
    observer.finish();
    policy.set_installing(false);

    match outcome {
        InstallOutcome::Completed => Ok(()),
        InstallOutcome::Failed { stage, error } => {
            Err(error).with_context(|| format!("Installation failed during {}", stage))
        }
        InstallOutcome::Crashed(msg) => bail!("Installation crashed: {}", msg),
    }
}

/// Renders progress events on stdout. Transient lines rewrite the current
/// terminal line instead of scrolling.
struct TerminalObserver {
    out: Stdout,
    steps: usize,
    on_transient: bool,
}

impl TerminalObserver {
    fn new(steps: usize) -> Self {
        Self {
            out: stdout(),
            steps,
            on_transient: false,
        }
    }

    fn render(&mut self, event: &ProgressEvent) -> std::io::Result<()> {
        if event.is_progress && self.on_transient {
            queue!(self.out, cursor::MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        } else if self.on_transient {
            writeln!(self.out)?;
        }

        if let Some(step) = event.step {
            let marker = format!("[{}/{}] ", step, self.steps);
            queue!(self.out, PrintStyledContent(marker.cyan().bold()))?;
        }
        if let Some(line) = &event.line {
            let text = line.text.as_str();
            match line.kind {
                LineKind::Command => queue!(self.out, PrintStyledContent(text.bold()))?,
                LineKind::Info => write!(self.out, "{}", text)?,
                LineKind::Warning => queue!(self.out, PrintStyledContent(text.yellow()))?,
                LineKind::Error => queue!(self.out, PrintStyledContent(text.red().bold()))?,
            }
        }

        self.on_transient = event.is_progress;
        if !event.is_progress {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    fn finish(&mut self) {
        if self.on_transient {
            let _ = writeln!(self.out);
            self.on_transient = false;
        }
    }
}

impl ProgressObserver for TerminalObserver {
    fn apply(&mut self, event: &ProgressEvent) {
        if let Err(e) = self.render(event) {
            debug!("failed to render progress: {}", e);
        }
    }
}
