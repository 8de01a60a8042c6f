//! Startup-time selection of which installed version to execute.
//!
//! This runs in the very first moments of the process, before (and without)
//! the update controller: parse just enough configuration out of argv, ask
//! the local TUF view what should be running, and verify it actually runs.
//! When local metadata is unusable, fall back to the newest runnable version
//! in the library.

use crate::{
    binary::{version_for_ordering, Binary, Channel},
    library::UpdateLibrary,
    metadata, probe, resolver,
};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use semver::Version;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Launcher versions below this predate self-management under the update
/// library and must never be selected at startup.
const MINIMUM_SELECTABLE_LAUNCHER_VERSION: Version = Version::new(1, 4, 1);

/// The file whose presence (and non-emptiness) marks a root directory as an
/// existing install.
const PRIMARY_STATE_FILE: &str = "launcher.db";

/// Roots that packages have historically installed into. When the configured
/// root has no state, an install found in one of these wins.
#[cfg(target_os = "macos")]
const WELL_KNOWN_ROOTS: &[&str] = &["/usr/local/kolide-k2/data", "/var/kolide-k2/data"];
#[cfg(target_os = "windows")]
const WELL_KNOWN_ROOTS: &[&str] = &[
    r"C:\Program Files\Kolide\Launcher-kolide-k2\data",
    r"C:\ProgramData\Kolide\Launcher-kolide-k2\data",
];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const WELL_KNOWN_ROOTS: &[&str] = &["/var/kolide-k2/data"];

/// The executable chosen for this boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelectedBinary {
    pub path: PathBuf,
    pub version: String,
}

/// The handful of settings startup selection cares about, scraped out of
/// the full process argv.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct LookupOptions {
    root_directory: Option<PathBuf>,
    update_directory: Option<PathBuf>,
    update_channel: Option<String>,
    pinned_launcher_version: Option<String>,
    pinned_osqueryd_version: Option<String>,
    config_path: Option<PathBuf>,
}

impl LookupOptions {
    fn set(&mut self, key: &str, value: &str) {
        match key {
            "root_directory" => self.root_directory = Some(PathBuf::from(value)),
            "update_directory" => self.update_directory = Some(PathBuf::from(value)),
            "update_channel" => self.update_channel = Some(value.to_string()),
            "pinned_launcher_version" => self.pinned_launcher_version = Some(value.to_string()),
            "pinned_osqueryd_version" => self.pinned_osqueryd_version = Some(value.to_string()),
            "config" => self.config_path = Some(PathBuf::from(value)),
            _ => {}
        }
    }

    fn is_known(key: &str) -> bool {
        matches!(
            key,
            "root_directory"
                | "update_directory"
                | "update_channel"
                | "pinned_launcher_version"
                | "pinned_osqueryd_version"
                | "config"
        )
    }

    fn pinned_version(&self, binary: Binary) -> String {
        match binary {
            Binary::Launcher => self.pinned_launcher_version.clone().unwrap_or_default(),
            Binary::Osqueryd => self.pinned_osqueryd_version.clone().unwrap_or_default(),
        }
    }
}

/// Picks the version of `binary` this process should execute. `argv` is the
/// full process argument list, flags and all; anything we do not recognize
/// is ignored.
pub async fn check_out_latest(binary: Binary, argv: &[String]) -> Result<SelectedBinary> {
    let options = resolve_options(argv);

    let configured_root = options
        .root_directory
        .clone()
        .ok_or_else(|| anyhow!("no root directory configured, cannot locate the update library"))?;
    let root = root_with_existing_install(
        &configured_root,
        &WELL_KNOWN_ROOTS.iter().copied().map(PathBuf::from).collect::<Vec<_>>(),
    );

    let updates_dir = options
        .update_directory
        .clone()
        .unwrap_or_else(|| root.join("updates"));
    let library = UpdateLibrary::new(updates_dir);

    let channel = Channel::from_flag(options.update_channel.as_deref().unwrap_or_default());
    let pin = options.pinned_version(binary);

    match latest_from_local_tuf(&library, &root, binary, channel, &pin).await {
        Ok(selected) => return Ok(selected),
        Err(e) => debug!("could not select {binary} from local TUF data: {e:#}"),
    }

    newest_runnable_in_library(&library, binary).await
}

fn resolve_options(argv: &[String]) -> LookupOptions {
    let mut from_argv = LookupOptions::default();
    parse_argv(&mut from_argv, argv);

    // The config file fills in whatever the command line did not set.
    let mut options = LookupOptions::default();
    if let Some(config_path) = &from_argv.config_path {
        match fs::read_to_string(config_path) {
            Ok(contents) => parse_config_file(&mut options, &contents),
            Err(e) => warn!("could not read config file {}: {e}", config_path.display()),
        }
    }
    merge_options(&mut options, from_argv);
    options
}

/// A tolerant flag scan: both `-flag` and `--flag` forms, `key=value` and
/// `key value` forms, and unknown flags skipped without complaint. This sees
/// the process's full argv, most of which belongs to other subsystems.
fn parse_argv(options: &mut LookupOptions, argv: &[String]) {
    let mut iter = argv.iter().peekable();
    while let Some(token) = iter.next() {
        let Some(flag) = token.strip_prefix('-') else {
            continue;
        };
        let flag = flag.strip_prefix('-').unwrap_or(flag);

        if let Some((key, value)) = flag.split_once('=') {
            options.set(key, value);
            continue;
        }

        if LookupOptions::is_known(flag) {
            // Only a known flag may consume the next token as its value;
            // otherwise `-unknownflag value` would eat `value`.
            if let Some(next) = iter.peek() {
                if !next.starts_with('-') {
                    options.set(flag, next);
                    iter.next();
                }
            }
        }
    }
}

/// Flag-file format: one `key value` (or `key=value`) per line, `#` for
/// comments.
fn parse_config_file(options: &mut LookupOptions, contents: &str) {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(['=', ' ', '\t']) {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        options.set(key, value);
    }
}

fn merge_options(base: &mut LookupOptions, overrides: LookupOptions) {
    if overrides.root_directory.is_some() {
        base.root_directory = overrides.root_directory;
    }
    if overrides.update_directory.is_some() {
        base.update_directory = overrides.update_directory;
    }
    if overrides.update_channel.is_some() {
        base.update_channel = overrides.update_channel;
    }
    if overrides.pinned_launcher_version.is_some() {
        base.pinned_launcher_version = overrides.pinned_launcher_version;
    }
    if overrides.pinned_osqueryd_version.is_some() {
        base.pinned_osqueryd_version = overrides.pinned_osqueryd_version;
    }
    if overrides.config_path.is_some() {
        base.config_path = overrides.config_path;
    }
}

/// Prefers a root that actually contains an install. Packaged installs have
/// moved over the years; the configured root may be a fresh empty directory
/// while the real state lives at an older well-known location.
fn root_with_existing_install(configured: &Path, candidates: &[PathBuf]) -> PathBuf {
    if has_nonempty_state_file(configured) {
        return configured.to_path_buf();
    }

    for candidate in candidates {
        if candidate.as_path() != configured && has_nonempty_state_file(candidate) {
            info!(
                "configured root {} has no state, using existing install at {}",
                configured.display(),
                candidate.display(),
            );
            return candidate.clone();
        }
    }

    configured.to_path_buf()
}

fn has_nonempty_state_file(root: &Path) -> bool {
    fs::metadata(root.join(PRIMARY_STATE_FILE)).is_ok_and(|m| m.len() > 0)
}

async fn latest_from_local_tuf(
    library: &UpdateLibrary,
    root: &Path,
    binary: Binary,
    channel: Channel,
    pin: &str,
) -> Result<SelectedBinary> {
    let snapshot = metadata::read_only_targets(root)?;
    let resolved = resolver::resolve_target(&snapshot, binary, channel, pin)?;

    let path = library.executable_path(binary, &resolved.version);
    probe::check_executable_runs(&path, &["--version"])
        .await
        .with_context(|| format!("resolved {binary} {} is not runnable", resolved.version))?;

    debug!("selected {binary} {} from local TUF data", resolved.version);
    Ok(SelectedBinary {
        path,
        version: resolved.version,
    })
}

/// The fallback path: take the newest installed version whose executable
/// passes a probe. For the launcher, versions below the self-management floor
/// are never considered.
async fn newest_runnable_in_library(
    library: &UpdateLibrary,
    binary: Binary,
) -> Result<SelectedBinary> {
    let (valid, _invalid) = library.sorted_versions(binary)?;

    for entry in valid.iter().rev() {
        if binary == Binary::Launcher && below_selectable_floor(&entry.raw) {
            debug!(
                "not selecting launcher {}: below minimum selectable version {MINIMUM_SELECTABLE_LAUNCHER_VERSION}",
                entry.raw
            );
            continue;
        }

        let path = library.executable_path(binary, &entry.raw);
        match probe::check_executable_runs(&path, &["--version"]).await {
            Ok(()) => {
                debug!("selected {binary} {} from the library", entry.raw);
                return Ok(SelectedBinary {
                    path,
                    version: entry.raw.clone(),
                });
            }
            Err(e) => debug!("library {binary} {} is not runnable: {e}", entry.raw),
        }
    }

    Err(anyhow!(
        "no usable version of {binary} in the update library at {}",
        library.updates_dir().display(),
    ))
}

fn below_selectable_floor(raw: &str) -> bool {
    version_for_ordering(raw).is_some_and(|v| v < MINIMUM_SELECTABLE_LAUNCHER_VERSION)
}
