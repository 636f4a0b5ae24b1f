//! Installation request
//!
//! A [`RequestConfig`] is what the user wrote down (a JSON file). Resolving it
//! against the scanned [`DiskInventory`] and validating every field produces
//! an [`InstallationRequest`], which the pipeline takes by value and never
//! changes.

use crate::catalog::PackageCatalog;
use crate::disks::{Disk, DiskInventory, byte_count_decimal};
use crate::error::{InstallError, Result};
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Passphrases this short get a warning on the confirmation summary.
pub const SHORT_PASSPHRASE: usize = 8;

const MAX_HOSTNAME: usize = 63;
const MAX_USERNAME: usize = 32;

/// Disk encryption and account passphrase.
///
/// Never shown by `Debug`; the buffer is zeroized when dropped.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl Serialize for Passphrase {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// User choices as written in a request file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    /// Target disk path (`/dev/sda`)
    pub disk: String,
    pub passphrase: Passphrase,
    /// When present, must equal `passphrase`
    #[serde(default)]
    pub passphrase_confirm: Option<Passphrase>,
    pub username: String,
    pub hostname: String,
    /// Zoneinfo name, e.g. `Europe/Berlin`
    pub timezone: String,
    /// Zero-fill the encrypted volume before formatting
    #[serde(default)]
    pub scrub: bool,
    #[serde(default)]
    pub autologin: bool,
    /// Optional package names, installed in this order
    #[serde(default)]
    pub packages: Vec<String>,
}

impl RequestConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = Zeroizing::new(
            fs::read_to_string(&path)
                .with_context(|| format!("Failed to read request from {:?}", path.as_ref()))?,
        );
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse request JSON")?;
        Ok(config)
    }

    /// Check every field that does not need the disk inventory.
    ///
    /// Package names are always checked for shape; whether they exist is only
    /// checked when a catalog is given.
    pub fn validate(&self, catalog: Option<&PackageCatalog>) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(InstallError::validation("Passphrase must be specified"));
        }
        if let Some(confirm) = &self.passphrase_confirm {
            if confirm != &self.passphrase {
                return Err(InstallError::validation("Passphrases do not match"));
            }
        }
        validate_hostname(&self.hostname)?;
        validate_username(&self.username)?;
        validate_timezone(&self.timezone)?;

        for name in &self.packages {
            validate_package_name(name)?;
        }

        if let Some(catalog) = catalog {
            if let Some(missing) = self.packages.iter().find(|p| !catalog.contains(p)) {
                return Err(InstallError::validation(format!(
                    "Unknown optional package {:?}",
                    missing
                )));
            }
        }
        Ok(())
    }

    /// Validate and look the disk up, producing the request the pipeline runs.
    pub fn resolve(
        self,
        inventory: &DiskInventory,
        catalog: Option<&PackageCatalog>,
    ) -> Result<InstallationRequest> {
        self.validate(catalog)?;

        let disk = inventory.get(&self.disk);
        if disk.is_empty() {
            return Err(InstallError::validation(format!(
                "No such disk: {:?}",
                self.disk
            )));
        }

        Ok(InstallationRequest {
            disk,
            passphrase: self.passphrase,
            username: self.username,
            hostname: self.hostname,
            timezone: self.timezone,
            scrub: self.scrub,
            autologin: self.autologin,
            packages: self.packages,
        })
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(InstallError::validation("Hostname must be specified"));
    }
    if hostname.len() > MAX_HOSTNAME {
        return Err(InstallError::validation(format!(
            "Hostname must be at most {} characters long",
            MAX_HOSTNAME
        )));
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(InstallError::validation(
            "Hostname can only contain letters, numbers, and hyphens",
        ));
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(InstallError::validation(
            "Hostname cannot start or end with a hyphen",
        ));
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(InstallError::validation("Username must be specified"));
    }
    if username.len() > MAX_USERNAME {
        return Err(InstallError::validation(format!(
            "Username must be at most {} characters long",
            MAX_USERNAME
        )));
    }
    let mut chars = username.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !first_ok {
        return Err(InstallError::validation(
            "Username must start with a lowercase letter or underscore",
        ));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(InstallError::validation(
            "Username can only contain lowercase letters, digits, underscores, and hyphens",
        ));
    }
    Ok(())
}

/// Debian package names: lowercase alphanumerics plus `+ - .`, starting
/// with an alphanumeric. The name ends up in a shell glob.
fn validate_package_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '-' || c == '.'
    });
    if !first_ok || !rest_ok {
        return Err(InstallError::validation(format!(
            "Invalid package name {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_timezone(timezone: &str) -> Result<()> {
    if timezone.is_empty() {
        return Err(InstallError::validation("Timezone must be specified"));
    }
    if timezone.starts_with('/') {
        return Err(InstallError::validation(
            "Timezone must be relative to the zoneinfo directory",
        ));
    }
    if timezone.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(InstallError::validation(format!(
            "Invalid timezone {:?}",
            timezone
        )));
    }
    Ok(())
}

/// Everything one pipeline run needs. Built by [`RequestConfig::resolve`].
#[derive(Debug, Clone)]
pub struct InstallationRequest {
    disk: Disk,
    passphrase: Passphrase,
    username: String,
    hostname: String,
    timezone: String,
    scrub: bool,
    autologin: bool,
    packages: Vec<String>,
}

impl InstallationRequest {
    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn scrub(&self) -> bool {
        self.scrub
    }

    pub fn autologin(&self) -> bool {
        self.autologin
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Things worth a second look before confirming, none of them fatal.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = vec!["Any existing data on this disk will be lost.".to_string()];
        if !self.scrub {
            warnings.push(
                "Encrypted partition will not be scrubbed. This may reveal information \
                 about the usage patterns of your system if your disk is examined."
                    .to_string(),
            );
        }
        if self.passphrase.len() <= SHORT_PASSPHRASE {
            warnings.push(
                "Your passphrase is very short, consider revising. This directly affects \
                 the confidentiality and integrity of your data."
                    .to_string(),
            );
        }
        warnings
    }

    /// Human-readable description of what is about to happen.
    pub fn summary(&self, catalog: Option<&PackageCatalog>) -> String {
        let d = &self.disk;
        let mut out = String::new();
        out.push_str(&format!("Hostname: {}\n", self.hostname));
        out.push_str(&format!("Username: {}\n", self.username));
        out.push_str(&format!("Timezone: {}\n", self.timezone));
        out.push_str(&format!("Autologin: {}\n\n", if self.autologin { "yes" } else { "no" }));

        out.push_str("Install to:\n");
        out.push_str(&format!("  Path: {}\n", d.path));
        out.push_str(&format!("  Name: {} ({})\n", d.model, d.serial));
        out.push_str(&format!("  Capacity: {}\n", byte_count_decimal(d.capacity_bytes())));
        out.push_str(&format!("  UUID: {}\n", d.part_table_uuid));
        out.push_str(&format!(
            "  Partitions: {} read from {} table\n",
            d.partitions.len(),
            d.part_table_type
        ));
        for (i, part) in d.partitions.iter().enumerate() {
            out.push_str(&format!("   {:2}: {} filesystem on {}\n", i, part.fs_type, part.name));
            out.push_str(&format!("      Filesystem UUID: {}\n", part.fs_uuid));
        }
        if self.scrub {
            out.push_str("  Zeros will be written to the encrypted partition before formatting.\n");
        }

        if !self.packages.is_empty() {
            out.push_str("\nExtra packages:\n");
            for name in &self.packages {
                let label = catalog
                    .and_then(|c| c.get(name))
                    .map(|p| p.label())
                    .unwrap_or_else(|| name.clone());
                out.push_str(&format!("  {}\n", label));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OptionalPackage;
    use crate::disks::Partition;

    fn inventory() -> DiskInventory {
        DiskInventory::from_disks(vec![Disk {
            name: "sda".into(),
            path: "/dev/sda".into(),
            model: "QEMU_HARDDISK".into(),
            serial: "QM00001".into(),
            part_table_type: "dos".into(),
            num_blocks: 20_000_000,
            partitions: vec![Partition {
                number: 1,
                name: "sda1".into(),
                path: "/dev/sda1".into(),
                fs_type: "ext4".into(),
                ..Partition::default()
            }],
            ..Disk::default()
        }])
    }

    fn config() -> RequestConfig {
        RequestConfig {
            disk: "/dev/sda".into(),
            passphrase: Passphrase::new("correct horse battery"),
            passphrase_confirm: None,
            username: "alice".into(),
            hostname: "twitchy-box".into(),
            timezone: "Europe/Berlin".into(),
            scrub: true,
            autologin: false,
            packages: vec![],
        }
    }

    fn rejects(mutate: impl FnOnce(&mut RequestConfig)) -> bool {
        let mut cfg = config();
        mutate(&mut cfg);
        matches!(cfg.validate(None), Err(InstallError::Validation(_)))
    }

    #[test]
    fn test_valid_config_resolves() {
        let req = config().resolve(&inventory(), None).expect("valid request");
        assert_eq!(req.disk().path, "/dev/sda");
        assert_eq!(req.username(), "alice");
        assert!(req.scrub());
    }

    #[test]
    fn test_unknown_disk_rejected() {
        let mut cfg = config();
        cfg.disk = "/dev/sdz".into();
        let err = cfg.resolve(&inventory(), None).unwrap_err();
        assert!(err.to_string().contains("/dev/sdz"));
    }

    #[test]
    fn test_choice_label_resolves() {
        let mut cfg = config();
        cfg.disk = "/dev/sda (QEMU_HARDDISK) - ata bus, dos partition table".into();
        assert!(cfg.resolve(&inventory(), None).is_ok());
    }

    #[test]
    fn test_passphrase_rules() {
        assert!(rejects(|c| c.passphrase = Passphrase::new("")));
        assert!(rejects(|c| c.passphrase_confirm = Some(Passphrase::new("different"))));

        let mut cfg = config();
        cfg.passphrase_confirm = Some(cfg.passphrase.clone());
        assert!(cfg.validate(None).is_ok());
    }

    #[test]
    fn test_hostname_rules() {
        assert!(rejects(|c| c.hostname.clear()));
        assert!(rejects(|c| c.hostname = "-box".into()));
        assert!(rejects(|c| c.hostname = "box-".into()));
        assert!(rejects(|c| c.hostname = "my_box".into()));
        assert!(rejects(|c| c.hostname = "a".repeat(64)));
        assert!(!rejects(|c| c.hostname = "a".repeat(63)));
        assert!(!rejects(|c| c.hostname = "X1".into()));
    }

    #[test]
    fn test_username_rules() {
        assert!(rejects(|c| c.username.clear()));
        assert!(rejects(|c| c.username = "Alice".into()));
        assert!(rejects(|c| c.username = "1alice".into()));
        assert!(rejects(|c| c.username = "al ice".into()));
        assert!(rejects(|c| c.username = "a".repeat(33)));
        assert!(!rejects(|c| c.username = "_svc-01".into()));
        assert!(!rejects(|c| c.username = "twl".into()));
    }

    #[test]
    fn test_timezone_rules() {
        assert!(rejects(|c| c.timezone.clear()));
        assert!(rejects(|c| c.timezone = "/etc/passwd".into()));
        assert!(rejects(|c| c.timezone = "Europe/../../etc/shadow".into()));
        assert!(!rejects(|c| c.timezone = "UTC".into()));
        assert!(!rejects(|c| c.timezone = "America/Argentina/Buenos_Aires".into()));
    }

    #[test]
    fn test_packages_checked_against_catalog() {
        let catalog = PackageCatalog::from_packages(vec![OptionalPackage {
            name: "firefox".into(),
            version: "118.0".into(),
            display_name: "Firefox".into(),
        }]);
        let mut cfg = config();
        cfg.packages = vec!["firefox".into()];
        assert!(cfg.validate(Some(&catalog)).is_ok());

        cfg.packages.push("chromium".into());
        assert!(cfg.validate(Some(&catalog)).is_err());
        assert!(cfg.validate(None).is_ok());
    }

    #[test]
    fn test_package_names_checked_without_catalog() {
        let mut cfg = config();
        cfg.packages = vec!["g++".into(), "libc6-dev".into(), "python3.11".into()];
        assert!(cfg.validate(None).is_ok());

        for bad in ["x/*.deb; touch /PWNED; echo ", "", "-rf", "Firefox", "a b", "../etc", "$(id)"] {
            let mut cfg = config();
            cfg.packages = vec![bad.to_string()];
            assert!(
                matches!(cfg.validate(None), Err(InstallError::Validation(_))),
                "{:?} accepted",
                bad
            );
            assert!(cfg.resolve(&inventory(), None).is_err(), "{:?} resolved", bad);
        }
    }

    #[test]
    fn test_debug_never_shows_passphrase() {
        let cfg = config();
        assert!(!format!("{:?}", cfg).contains("horse"));
        let req = cfg.resolve(&inventory(), None).expect("valid request");
        assert!(!format!("{:?}", req).contains("horse"));
        assert_eq!(req.passphrase().expose(), "correct horse battery");
    }

    #[test]
    fn test_passphrase_is_a_plain_json_string() {
        let pass: Passphrase = serde_json::from_str("\"s3cret pass\"").expect("string passphrase");
        assert_eq!(pass.expose(), "s3cret pass");
        assert_eq!(pass.len(), 11);
        assert_eq!(serde_json::to_string(&pass).expect("serializes"), "\"s3cret pass\"");
        assert!(serde_json::from_str::<Passphrase>("42").is_err());
    }

    #[test]
    fn test_load_from_file_reads_passphrase() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let json = serde_json::to_string(&config()).expect("serializes");
        std::fs::write(tmp.path(), json).expect("write request");
        let loaded = RequestConfig::load_from_file(tmp.path()).expect("loads");
        assert_eq!(loaded.passphrase, config().passphrase);
    }

    #[test]
    fn test_short_passphrase_warns() {
        let mut cfg = config();
        cfg.passphrase = Passphrase::new("12345678");
        cfg.scrub = false;
        let req = cfg.resolve(&inventory(), None).expect("short passphrase is allowed");
        let warnings = req.warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("very short")));
    }

    #[test]
    fn test_summary_lists_disk_and_packages() {
        let mut cfg = config();
        cfg.packages = vec!["firefox".into()];
        let req = cfg.resolve(&inventory(), None).expect("valid request");
        let summary = req.summary(None);
        assert!(summary.contains("Path: /dev/sda"));
        assert!(summary.contains("Capacity: 10.2 GB"));
        assert!(summary.contains("ext4 filesystem on sda1"));
        assert!(summary.contains("Extra packages:\n  firefox"));
    }

    #[test]
    fn test_request_json() {
        let json = r#"{
            "disk": "/dev/sda",
            "passphrase": "correct horse battery",
            "username": "alice",
            "hostname": "twitchy-box",
            "timezone": "UTC"
        }"#;
        let cfg: RequestConfig = serde_json::from_str(json).expect("request parses");
        assert!(!cfg.scrub);
        assert!(cfg.packages.is_empty());
        assert!(serde_json::from_str::<RequestConfig>(r#"{"disk": "/dev/sda", "bogus": 1}"#).is_err());
    }
}
