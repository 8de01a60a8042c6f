//! Promotes verified downloads into the update library, and tidies obsolete
//! entries. All library mutation funnels through here, serialized per
//! binary; a corrupt or hostile archive must never leave a visible version
//! directory behind.

use crate::{
    binary::Binary,
    fetcher::{ArtifactFetcher, Download},
    library::{executable_location, UpdateLibrary},
    metadata::TargetMeta,
    probe, resolver,
};
use anyhow::{anyhow, Context, Result};
use binstall_tar::Archive as TarArchive;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    fs::{self, create_dir_all, File},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use strum::IntoEnumIterator;
use tokio::sync::Mutex;

#[cfg(target_family = "unix")]
use std::fs::{set_permissions, Permissions};
#[cfg(target_family = "unix")]
use std::os::unix::fs::PermissionsExt;

/// How many versions of each binary survive a tidy pass: the running one
/// plus the two newest valid entries.
const KEPT_VERSIONS: usize = 2;

/// Manages the contents of the update library. One mutation at a time per
/// binary; different binaries proceed in parallel.
#[derive(Clone, Debug)]
pub struct LibraryManager {
    library: UpdateLibrary,
    fetcher: ArtifactFetcher,
    locks: HashMap<Binary, Arc<Mutex<()>>>,
}

impl LibraryManager {
    #[must_use]
    pub fn new(library: UpdateLibrary, mirror_url: &str, client: reqwest::Client) -> Self {
        LibraryManager {
            library,
            fetcher: ArtifactFetcher::new(mirror_url, client),
            locks: Binary::iter().map(|b| (b, Arc::new(Mutex::new(())))).collect(),
        }
    }

    #[must_use]
    pub fn library(&self) -> &UpdateLibrary {
        &self.library
    }

    fn lock_for(&self, binary: Binary) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks[&binary])
    }

    /// Downloads, verifies, and installs `target` into the library. A target
    /// that resolves to the currently running version, or to a version that
    /// is already installed, is nothing to do. Any failure before the final
    /// rename leaves no trace under the binary's library directory.
    pub async fn add(
        &self,
        binary: Binary,
        current_version: &str,
        target: &str,
        meta: &TargetMeta,
    ) -> Result<()> {
        let version = resolver::version_from_target(binary, target)?;
        if !current_version.is_empty() && version == current_version {
            debug!("{binary} {version} is already running, nothing to add");
            return Ok(());
        }

        let lock = self.lock_for(binary);
        let _guard = lock.lock().await;

        if self.library.is_installed(binary, &version).await {
            debug!("{binary} {version} is already in the library, nothing to add");
            return Ok(());
        }

        let binary_dir = self.library.binary_dir(binary);
        create_dir_all(&binary_dir)
            .with_context(|| format!("could not create {}", binary_dir.display()))?;

        // Staged under the binary dir so the final promotion is a rename on
        // one filesystem. The suffix keeps competing stagings from colliding.
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let staging_dir = binary_dir.join(format!("{version}-staged-{micros}"));

        let result = self
            .stage_version(binary, target, meta, &version, &staging_dir)
            .await;
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&staging_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not clean up staging dir {}: {e}", staging_dir.display());
                }
            }
        }
        result
    }

    async fn stage_version(
        &self,
        binary: Binary,
        target: &str,
        meta: &TargetMeta,
        version: &str,
        staging_dir: &Path,
    ) -> Result<()> {
        let download = self.fetcher.fetch(target, meta).await?;

        create_dir_all(staging_dir)
            .with_context(|| format!("could not create staging dir {}", staging_dir.display()))?;
        extract_tarball(&download, staging_dir)?;

        let staged_executable = executable_location(staging_dir, binary);
        chmod(&staged_executable, 0o755)?;

        #[cfg(target_os = "linux")]
        patch_interpreter_if_needed(&staged_executable).await?;

        probe::check_executable_runs(&staged_executable, &["--version"])
            .await
            .with_context(|| format!("downloaded {binary} {version} failed validation"))?;

        let version_dir = self.library.version_dir(binary, version);
        if version_dir.exists() {
            // A leftover entry that failed is_installed above; replace it.
            fs::remove_dir_all(&version_dir)
                .with_context(|| format!("could not clear {}", version_dir.display()))?;
        }
        fs::rename(staging_dir, &version_dir).with_context(|| {
            format!(
                "could not move validated download from {} to {}",
                staging_dir.display(),
                version_dir.display(),
            )
        })?;
        // User-context children need to traverse into the new directory.
        chmod(&version_dir, 0o755)?;

        info!("installed {binary} {version} into the library");
        Ok(())
    }

    /// Removes invalid entries and everything but the current version and
    /// the two newest valid versions.
    pub async fn tidy(&self, binary: Binary, current_version: &str) {
        if current_version.is_empty() {
            warn!("not tidying the {binary} library without knowing the running version");
            return;
        }

        let lock = self.lock_for(binary);
        let _guard = lock.lock().await;

        let (valid, invalid) = match self.library.sorted_versions(binary) {
            Ok(versions) => versions,
            Err(e) => {
                warn!("could not enumerate {binary} library entries for tidying: {e}");
                return;
            }
        };

        for name in invalid {
            self.library.remove(binary, &name);
        }

        let mut kept = 0;
        for entry in valid.iter().rev() {
            if entry.raw == current_version {
                continue;
            }
            kept += 1;
            if kept > KEPT_VERSIONS {
                self.library.remove(binary, &entry.raw);
            }
        }
    }
}

/// Unpacks a gzipped tarball with every entry sanitized: paths must stay
/// inside `into`, symlinks and other special entries are skipped, and modes
/// lose their group- and world-write bits.
fn extract_tarball(download: &Download, into: &Path) -> Result<()> {
    debug!(
        "extracting tarball at {} to {}",
        download.archive_path.display(),
        into.display(),
    );

    let file = File::open(&download.archive_path).with_context(|| {
        format!("could not open downloaded archive {}", download.archive_path.display())
    })?;
    let mut archive = TarArchive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let destination = sanitized_destination(into, &entry_path)?;

        let header_mode = entry.header().mode().unwrap_or(0o644);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            create_dir_all(&destination)
                .with_context(|| format!("could not create {}", destination.display()))?;
            // Directories keep owner rwx so extraction into them works
            // regardless of what the archive claims.
            chmod(&destination, mask_mode(header_mode) | 0o700)?;
        } else if entry_type.is_file() {
            if let Some(parent) = destination.parent() {
                create_dir_all(parent)
                    .with_context(|| format!("could not create {}", parent.display()))?;
            }
            entry.unpack(&destination).with_context(|| {
                format!("could not unpack archive entry to {}", destination.display())
            })?;
            chmod(&destination, mask_mode(header_mode))?;
        } else {
            // Symlinks and other special entries have no business in a
            // release archive.
            debug!(
                "skipping archive entry {} with type {entry_type:?}",
                entry_path.display(),
            );
        }
    }

    Ok(())
}

/// Joins an archive entry path onto the extraction dir and rejects anything
/// that would land outside it. The check is lexical: `..` components are
/// resolved without touching the filesystem, and absolute entry paths are
/// rejected outright.
fn sanitized_destination(base: &Path, entry_path: &Path) -> Result<PathBuf> {
    if entry_path.is_absolute() {
        return Err(anyhow!(
            "archive entry {} has an absolute path",
            entry_path.display()
        ));
    }

    let mut cleaned = base.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!(
                    "archive entry {} has an absolute path component",
                    entry_path.display()
                ));
            }
        }
    }

    if !cleaned.starts_with(base) {
        return Err(anyhow!(
            "archive entry {} escapes the extraction directory",
            entry_path.display()
        ));
    }

    Ok(cleaned)
}

/// Drops group- and world-write (and setuid/setgid/sticky) while keeping
/// owner bits and read/exec for everyone else.
fn mask_mode(mode: u32) -> u32 {
    mode & 0o755
}

#[cfg(target_family = "unix")]
fn chmod(path: &Path, mode: u32) -> Result<()> {
    set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("could not set mode {mode:o} on {}", path.display()))
}

#[cfg(target_family = "windows")]
fn chmod(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// NixOS has no standard ELF interpreter path, so binaries built for stock
/// Linux will not start there. When the marker file is present, re-point the
/// freshly installed executable at the interpreter the running binary uses.
#[cfg(target_os = "linux")]
async fn patch_interpreter_if_needed(executable: &Path) -> Result<()> {
    if !Path::new("/etc/NIXOS").exists() {
        return Ok(());
    }

    let patchelf = match which::which("patchelf") {
        Ok(p) => p,
        Err(e) => {
            warn!("host looks like NixOS but patchelf is not available: {e}");
            return Ok(());
        }
    };

    let current = std::env::current_exe().context("could not find the running executable")?;
    let output = tokio::process::Command::new(&patchelf)
        .arg("--print-interpreter")
        .arg(&current)
        .output()
        .await
        .context("could not run patchelf --print-interpreter")?;
    if !output.status.success() {
        return Err(anyhow!(
            "patchelf --print-interpreter failed: {}",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    let interpreter = String::from_utf8(output.stdout)
        .context("patchelf returned a non-UTF-8 interpreter path")?
        .trim()
        .to_string();

    debug!(
        "setting interpreter {interpreter} on {}",
        executable.display()
    );
    let status = tokio::process::Command::new(&patchelf)
        .arg("--set-interpreter")
        .arg(&interpreter)
        .arg(executable)
        .status()
        .await
        .context("could not run patchelf --set-interpreter")?;
    if !status.success() {
        return Err(anyhow!("patchelf --set-interpreter exited with {status}"));
    }

    Ok(())
}
