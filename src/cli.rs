use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// twlinst - install the running live system onto an encrypted disk
#[derive(Parser, Debug)]
#[command(name = "twlinst")]
#[command(about = "Installs the live system onto a LUKS-encrypted target disk")]
#[command(version)]
pub struct Cli {
    /// Parent directory of the root and boot mount points used while installing
    #[arg(long, global = true, value_name = "DIR")]
    pub mount_base: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the disks that can be installed to
    Disks {
        /// Print the inventory as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the optional packages shipped on the live image
    Packages {
        /// Package cache to read instead of /deb-pkgs
        #[arg(long, value_name = "DIR")]
        cache: Option<PathBuf>,
    },
    /// Check an installation request against this machine
    Validate {
        /// Path to the request file (JSON)
        request: PathBuf,
    },
    /// Install according to a request file
    Install {
        /// Path to the request file (JSON)
        request: PathBuf,

        /// Confirm that the target disk will be erased
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_a_command() {
        assert!(Cli::try_parse_from(["twlinst"]).is_err());
    }

    #[test]
    fn test_cli_disks_json() {
        let cli = Cli::try_parse_from(["twlinst", "disks", "--json"]).expect("parses");
        assert!(matches!(cli.command, Commands::Disks { json: true }));
        assert!(cli.mount_base.is_none());
    }

    #[test]
    fn test_cli_install_defaults_to_unconfirmed() {
        let cli = Cli::try_parse_from(["twlinst", "install", "/root/request.json"]).expect("parses");
        match cli.command {
            Commands::Install { request, yes } => {
                assert_eq!(request, PathBuf::from("/root/request.json"));
                assert!(!yes);
            }
            other => panic!("Expected Install command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_mount_base_after_subcommand() {
        let cli = Cli::try_parse_from([
            "twlinst",
            "install",
            "req.json",
            "--yes",
            "--mount-base",
            "/mnt/target",
        ])
        .expect("parses");
        assert_eq!(cli.mount_base, Some(PathBuf::from("/mnt/target")));
        assert!(matches!(cli.command, Commands::Install { yes: true, .. }));
    }

    #[test]
    fn test_cli_validate_needs_a_file() {
        assert!(Cli::try_parse_from(["twlinst", "validate"]).is_err());
        let cli = Cli::try_parse_from(["twlinst", "packages", "--cache", "/tmp/pkgs"]).expect("parses");
        assert!(matches!(cli.command, Commands::Packages { cache: Some(_) }));
    }
}
