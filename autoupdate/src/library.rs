//! The on-disk update library: a per-binary, version-keyed directory tree of
//! installed artifacts.
//!
//! ```text
//! <updates>/<binary>/<version>/<executable>                        POSIX
//! <updates>/<binary>/<version>/Kolide.app/Contents/MacOS/<exec>    macOS agent
//! <updates>/<binary>/<version>/<executable>.exe                    Windows
//! ```
//!
//! Reads here are lock-free; all mutation goes through the library manager,
//! which serializes per binary.

use crate::{
    binary::{version_for_ordering, Binary},
    probe,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use semver::Version;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// An installed version: the raw directory name plus its parsed form. The
/// parsed form has prerelease dashes normalized to dots and is only used for
/// ordering; `raw` is what exists on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryVersion {
    pub raw: String,
    pub version: Version,
}

impl Ord for LibraryVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for LibraryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
pub struct UpdateLibrary {
    updates_dir: PathBuf,
}

impl UpdateLibrary {
    #[must_use]
    pub fn new(updates_dir: PathBuf) -> Self {
        UpdateLibrary { updates_dir }
    }

    #[must_use]
    pub fn updates_dir(&self) -> &Path {
        &self.updates_dir
    }

    #[must_use]
    pub fn binary_dir(&self, binary: Binary) -> PathBuf {
        self.updates_dir.join(binary.name())
    }

    #[must_use]
    pub fn version_dir(&self, binary: Binary, version: &str) -> PathBuf {
        self.binary_dir(binary).join(version)
    }

    /// The executable path for an installed version on this platform.
    #[must_use]
    pub fn executable_path(&self, binary: Binary, version: &str) -> PathBuf {
        executable_location(&self.version_dir(binary, version), binary)
    }

    /// Whether `version` is installed: its directory exists and its
    /// executable runs well enough to answer `--version`.
    pub async fn is_installed(&self, binary: Binary, version: &str) -> bool {
        let executable = self.executable_path(binary, version);
        match probe::check_executable_runs(&executable, &["--version"]).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{binary} {version} is not installed in the library: {e}");
                false
            }
        }
    }

    /// Enumerates the library for one binary. Returns installed versions in
    /// ascending semver order, plus the directory names that are either not
    /// parseable as semver or whose executable fails the probe; those are
    /// removal candidates for tidying.
    pub fn sorted_versions(&self, binary: Binary) -> Result<(Vec<LibraryVersion>, Vec<String>)> {
        let dir = self.binary_dir(binary);
        if !dir.exists() {
            return Ok((vec![], vec![]));
        }

        let mut valid = vec![];
        let mut invalid = vec![];
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("could not read library dir {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("could not read entry in {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(version) = version_for_ordering(&name) else {
                debug!("library entry `{name}` for {binary} does not parse as semver");
                invalid.push(name);
                continue;
            };

            let executable = executable_location(&entry.path(), binary);
            if let Err(e) = probe::check_executable(&executable) {
                debug!("library entry `{name}` for {binary} failed the executable probe: {e}");
                invalid.push(name);
                continue;
            }

            valid.push(LibraryVersion { raw: name, version });
        }

        valid.sort();
        Ok((valid, invalid))
    }

    /// Best-effort removal of one installed version.
    pub fn remove(&self, binary: Binary, version: &str) {
        let dir = self.version_dir(binary, version);
        debug!("removing {} from the library", dir.display());
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("could not remove library entry {}: {e}", dir.display());
        }
    }
}

/// Where the executable lives inside one version directory.
///
/// On macOS the agent ships as an app bundle; osqueryd has shipped both ways,
/// so we prefer the bundle layout when it is present and fall back to a flat
/// file.
#[must_use]
pub fn executable_location(version_dir: &Path, binary: Binary) -> PathBuf {
    if cfg!(target_os = "macos") {
        let bundled = version_dir
            .join("Kolide.app")
            .join("Contents")
            .join("MacOS")
            .join(binary.executable_name());
        match binary {
            Binary::Launcher => bundled,
            Binary::Osqueryd => {
                if bundled.exists() {
                    bundled
                } else {
                    version_dir.join(binary.executable_name())
                }
            }
        }
    } else {
        version_dir.join(binary.executable_name())
    }
}
