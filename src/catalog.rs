//! Optional package catalog
//!
//! The live image ships extra `.deb` packages under the package cache, one
//! directory per package:
//!
//! ```text
//! /deb-pkgs/
//!   firefox/
//!     meta.json        {"name": "firefox", "version": "118.0", "display_name": "Firefox"}
//!     firefox_118.0_amd64.deb
//! ```
//!
//! The configure step installs `<cache>/<name>/*.deb`, so a package's
//! directory is expected to carry its `name`.

use crate::error::{InstallError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Contents of one `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalPackage {
    pub name: String,
    pub version: String,
    pub display_name: String,
}

impl OptionalPackage {
    /// `Display Name (version)`
    pub fn label(&self) -> String {
        format!("{} ({})", self.display_name, self.version)
    }
}

/// Every optional package found in the cache, in directory name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageCatalog {
    packages: Vec<OptionalPackage>,
}

impl PackageCatalog {
    pub fn from_packages(packages: Vec<OptionalPackage>) -> Self {
        Self { packages }
    }

    /// Read the catalog rooted at `cache`.
    ///
    /// A missing or unreadable cache directory yields an empty catalog. A
    /// package directory without a readable, well-formed `meta.json` is an
    /// error.
    pub fn load(cache: &Path) -> Result<Self> {
        let entries = match fs::read_dir(cache) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("No optional packages: cannot read {}: {}", cache.display(), e);
                return Ok(Self::default());
            }
        };

        let mut dirs: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();

        let mut packages = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let meta_path = cache.join(&dir).join("meta.json");
            let raw = fs::read_to_string(&meta_path).map_err(|e| InstallError::io(&meta_path, e))?;
            let pkg: OptionalPackage = serde_json::from_str(&raw)
                .map_err(|e| InstallError::inventory(format!("{}/meta.json: {}", dir, e)))?;
            if pkg.name != dir {
                log::warn!(
                    "Package {:?} lives in directory {:?}; installing it will look in {:?}",
                    pkg.name,
                    dir,
                    pkg.name
                );
            }
            packages.push(pkg);
        }

        log::info!("Found {} optional package(s) in {}", packages.len(), cache.display());
        Ok(Self { packages })
    }

    pub fn packages(&self) -> &[OptionalPackage] {
        &self.packages
    }

    pub fn get(&self, name: &str) -> Option<&OptionalPackage> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_pkg(root: &Path, dir: &str, meta: &str) {
        let pkg_dir = root.join(dir);
        fs::create_dir_all(&pkg_dir).expect("create package dir");
        fs::write(pkg_dir.join("meta.json"), meta).expect("write meta.json");
    }

    #[test]
    fn test_load_sorted_by_directory() {
        let tmp = TempDir::new().expect("tempdir");
        write_pkg(
            tmp.path(),
            "vscode",
            r#"{"name":"vscode","version":"1.83","display_name":"VS Code"}"#,
        );
        write_pkg(
            tmp.path(),
            "firefox",
            r#"{"name":"firefox","version":"118.0","display_name":"Firefox"}"#,
        );
        fs::write(tmp.path().join("README"), "not a package").expect("write stray file");

        let catalog = PackageCatalog::load(tmp.path()).expect("catalog loads");
        let names: Vec<&str> = catalog.packages().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["firefox", "vscode"]);
        assert_eq!(catalog.get("firefox").map(|p| p.label()), Some("Firefox (118.0)".into()));
        assert!(!catalog.contains("chromium"));
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let tmp = TempDir::new().expect("tempdir");
        let catalog = PackageCatalog::load(&tmp.path().join("nope")).expect("empty catalog");
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_malformed_meta_names_directory() {
        let tmp = TempDir::new().expect("tempdir");
        write_pkg(tmp.path(), "broken", r#"{"name": "broken""#);
        let err = PackageCatalog::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("broken/meta.json"));
    }

    #[test]
    fn test_missing_meta_is_io_error() {
        let tmp = TempDir::new().expect("tempdir");
        fs::create_dir(tmp.path().join("empty")).expect("create dir");
        assert!(matches!(
            PackageCatalog::load(tmp.path()),
            Err(InstallError::Io { .. })
        ));
    }
}
