//! Checks that tell us whether a path is a binary we can actually run. The
//! static check looks at file metadata only; the exec check runs the
//! candidate to catch truncated or mis-linked downloads before they are
//! installed.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::{env, io::ErrorKind, path::Path, time::Duration};
use tokio::process::Command;

/// How long a probed binary gets to respond before we consider it broken.
const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Freshly written binaries can still be open for writing elsewhere; give the
/// kernel a few chances to release them.
const TEXT_BUSY_RETRIES: u32 = 3;
const TEXT_BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Returns `Ok` when `path` exists, is a regular file, and looks runnable on
/// this OS: any execute bit on POSIX, a `.exe` suffix on Windows.
pub fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("could not stat {}", path.display()))?;
    if metadata.is_dir() {
        return Err(anyhow!("{} is a directory, not an executable", path.display()));
    }

    #[cfg(target_family = "unix")]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(anyhow!("{} has no execute bit set", path.display()));
        }
    }

    #[cfg(target_family = "windows")]
    if path.extension().is_none_or(|ext| !ext.eq_ignore_ascii_case("exe")) {
        return Err(anyhow!("{} does not end in .exe", path.display()));
    }

    Ok(())
}

/// Like [`check_executable`], but additionally execs the file with the given
/// arguments under a timeout. Exit codes 1 and 2 are not failures; a running
/// binary handed a flag it does not know exits that way, and that still
/// proves the file runs. Probing the currently running executable skips the
/// exec step entirely.
pub async fn check_executable_runs(path: &Path, args: &[&str]) -> Result<()> {
    check_executable(path)?;

    if is_current_executable(path) {
        debug!("{} is the running executable, skipping exec check", path.display());
        return Ok(());
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        match run_with_timeout(path, args).await {
            Ok(()) => return Ok(()),
            Err(e) if is_text_file_busy(&e) && attempts <= TEXT_BUSY_RETRIES => {
                debug!(
                    "{} was busy on exec attempt {attempts}, retrying: {e}",
                    path.display()
                );
                tokio::time::sleep(TEXT_BUSY_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_with_timeout(path: &Path, args: &[&str]) -> Result<()> {
    let mut command = Command::new(path);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let status = tokio::time::timeout(EXEC_TIMEOUT, command.status())
        .await
        .map_err(|_| anyhow!("{} did not exit within {EXEC_TIMEOUT:?}", path.display()))?
        .with_context(|| format!("could not exec {}", path.display()))?;

    match status.code() {
        // Exit codes 1 and 2 mean "unknown flag" in a binary that runs fine.
        Some(0 | 1 | 2) => Ok(()),
        Some(code) => Err(anyhow!("{} exited with code {code}", path.display())),
        None => Err(anyhow!("{} was terminated by a signal", path.display())),
    }
}

fn is_current_executable(path: &Path) -> bool {
    let Ok(current) = env::current_exe() else {
        return false;
    };
    // Compare canonicalized forms so a symlinked updates dir still matches.
    let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let canonical_current = current.canonicalize().unwrap_or(current);
    canonical_path == canonical_current
}

fn is_text_file_busy(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io_err| io_err.kind() == ErrorKind::ExecutableFileBusy)
}
