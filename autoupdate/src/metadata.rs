//! Maintains the local, tamper-evident view of the TUF repository.
//!
//! All trust decisions live in `tough`: it validates the signed metadata
//! chain against the embedded root and refuses rollbacks. This module wraps
//! it twice — a live client that refreshes over HTTP and persists metadata
//! under `<root>/tuf/`, and a read-only view for the startup lookup path
//! that never touches the network.

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde_json::Value;
use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
};
use tempfile::tempdir;
use tough::{ExpirationEnforcement, FilesystemTransport, HttpTransport, Limits, Repository, Settings};
use url::Url;

/// Name of the subdirectory holding TUF metadata under the root directory.
const TUF_DIR_NAME: &str = "tuf";

/// The trusted root metadata file inside the TUF directory.
const ROOT_JSON: &str = "root.json";

/// The metadata directory may hold signing-relevant state; nothing wider
/// than 0750 is acceptable.
#[cfg(target_family = "unix")]
const TUF_DIR_MODE: u32 = 0o750;

/// Authenticated facts about one target, lifted out of `tough`'s types so
/// the resolver and fetcher never depend on the TUF client directly.
#[derive(Clone, Debug)]
pub struct TargetMeta {
    pub length: u64,
    /// Algorithm name to lower-hex digest.
    pub hashes: HashMap<String, String>,
    /// The opaque `custom` JSON blob; carries the release indirection for
    /// `release.json` targets.
    pub custom: Option<Value>,
}

/// The validated set of target names to their metadata, as of one refresh.
pub type TargetsSnapshot = HashMap<String, TargetMeta>;

#[derive(Clone, Debug)]
pub struct MetadataClient {
    tuf_dir: PathBuf,
    metadata_base_url: String,
    targets_base_url: String,
}

impl MetadataClient {
    /// Prepares `<root>/tuf/` and verifies we can pull a full signed chain
    /// from the repository. A refresh failure here is fatal: without valid
    /// metadata the whole subsystem has nothing to act on.
    pub async fn init(root_dir: &Path, tuf_url: &str, root_json: &[u8]) -> Result<Self> {
        let tuf_dir = prepare_tuf_dir(root_dir)?;

        let root_path = tuf_dir.join(ROOT_JSON);
        if !root_path.exists() {
            debug!("writing trusted root metadata to {}", root_path.display());
            fs::write(&root_path, root_json)
                .with_context(|| format!("could not write {}", root_path.display()))?;
        }

        let repository_url = format!("{}/repository", tuf_url.trim_end_matches('/'));
        let client = MetadataClient {
            tuf_dir,
            metadata_base_url: repository_url.clone(),
            targets_base_url: repository_url,
        };

        client
            .update()
            .await
            .context("initial TUF metadata refresh failed")?;
        Ok(client)
    }

    /// Pulls the latest signed metadata chain and returns the validated
    /// targets. One attempt; the controller owns retry policy.
    pub async fn update(&self) -> Result<TargetsSnapshot> {
        let tuf_dir = self.tuf_dir.clone();
        let metadata_base_url = self.metadata_base_url.clone();
        let targets_base_url = self.targets_base_url.clone();

        // tough drives blocking I/O; keep it off the async worker threads.
        tokio::task::spawn_blocking(move || {
            let root = File::open(tuf_dir.join(ROOT_JSON))
                .with_context(|| format!("could not open trusted root in {}", tuf_dir.display()))?;
            let transport = HttpTransport::new();
            let repository = Repository::load(
                &transport,
                Settings {
                    root,
                    datastore: tuf_dir.as_path(),
                    metadata_base_url: &metadata_base_url,
                    targets_base_url: &targets_base_url,
                    limits: Limits::default(),
                    expiration_enforcement: ExpirationEnforcement::Safe,
                },
            )
            .context("could not load TUF repository")?;
            Ok(snapshot_from(&repository))
        })
        .await
        .context("TUF refresh task failed")?
    }
}

/// Opens the local metadata store without any network access or cache
/// writes. Expired metadata is tolerated here: this feeds the startup-time
/// library lookup, where running a slightly stale version beats running
/// nothing. Any error means "no usable local TUF data" and the caller falls
/// back to scanning the library.
pub fn read_only_targets(root_dir: &Path) -> Result<TargetsSnapshot> {
    let tuf_dir = root_dir.join(TUF_DIR_NAME);
    let root = File::open(tuf_dir.join(ROOT_JSON))
        .with_context(|| format!("no trusted root in {}", tuf_dir.display()))?;

    let base = Url::from_directory_path(&tuf_dir)
        .map_err(|()| anyhow!("could not express {} as a file URL", tuf_dir.display()))?;

    // A throwaway datastore keeps the real store byte-for-byte untouched.
    let scratch = tempdir()?;
    let repository = Repository::load(
        &FilesystemTransport,
        Settings {
            root,
            datastore: scratch.path(),
            metadata_base_url: base.as_str(),
            targets_base_url: base.as_str(),
            limits: Limits::default(),
            expiration_enforcement: ExpirationEnforcement::Unsafe,
        },
    )
    .context("could not load local TUF metadata")?;

    Ok(snapshot_from(&repository))
}

fn snapshot_from<T: tough::Transport>(repository: &Repository<'_, T>) -> TargetsSnapshot {
    repository
        .targets()
        .signed
        .targets
        .iter()
        .map(|(name, target)| {
            let mut hashes = HashMap::new();
            hashes.insert(
                "sha256".to_string(),
                base16ct::lower::encode_string(target.hashes.sha256.as_ref()),
            );
            // Only sha256 is a first-class field in tough's schema; a sha512
            // published alongside it lands in the flattened extras.
            if let Some(Value::String(sha512)) = target.hashes._extra.get("sha512") {
                hashes.insert("sha512".to_string(), sha512.to_lowercase());
            }

            let custom = if target.custom.is_empty() {
                None
            } else {
                Some(Value::Object(
                    target.custom.clone().into_iter().collect(),
                ))
            };

            (
                name.clone(),
                TargetMeta {
                    length: target.length,
                    hashes,
                    custom,
                },
            )
        })
        .collect()
}

fn prepare_tuf_dir(root_dir: &Path) -> Result<PathBuf> {
    let tuf_dir = root_dir.join(TUF_DIR_NAME);
    fs::create_dir_all(&tuf_dir)
        .with_context(|| format!("could not create {}", tuf_dir.display()))?;

    #[cfg(target_family = "unix")]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(&tuf_dir)?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & !TUF_DIR_MODE != 0 {
            debug!(
                "repairing mode on {} from {mode:o} to {TUF_DIR_MODE:o}",
                tuf_dir.display()
            );
            fs::set_permissions(&tuf_dir, fs::Permissions::from_mode(TUF_DIR_MODE))
                .with_context(|| format!("could not repair mode on {}", tuf_dir.display()))?;
        }
    }

    Ok(tuf_dir)
}
