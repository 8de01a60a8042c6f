//! Downloads one artifact from the release mirror and verifies it against
//! the authenticated length and hashes from TUF metadata before anyone
//! touches the bytes.

use crate::metadata::TargetMeta;
use anyhow::{anyhow, Context, Result};
use digest::DynDigest;
use log::debug;
use reqwest::{Client, StatusCode};
use std::{fs::File, io::Write, path::PathBuf};
use tempfile::{tempdir, TempDir};

/// Mirror paths are namespaced under this prefix.
const MIRROR_PREFIX: &str = "kolide";

/// A verified download. The temp dir must outlive the path, so we keep it
/// around until the caller is done extracting.
#[derive(Debug)]
pub(crate) struct Download {
    pub(crate) _temp_dir: TempDir,
    pub(crate) archive_path: PathBuf,
}

#[derive(Clone, Debug)]
pub(crate) struct ArtifactFetcher {
    mirror_base: String,
    client: Client,
}

impl ArtifactFetcher {
    pub(crate) fn new(mirror_url: &str, client: Client) -> Self {
        ArtifactFetcher {
            mirror_base: mirror_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Fetches `target` and verifies it in one pass. The response body is
    /// never allowed to exceed `meta.length` bytes, and every hash named in
    /// `meta.hashes` must match. No retries happen at this level.
    pub(crate) async fn fetch(&self, target: &str, meta: &TargetMeta) -> Result<Download> {
        let url = format!("{}/{MIRROR_PREFIX}/{target}", self.mirror_base);
        debug!("downloading artifact from {url}");

        let mut hashers = hashers_for(meta)?;

        let mut resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("error requesting {url}"))?;
        if resp.status() != StatusCode::OK {
            let mut msg = format!("error requesting {url}: {}", resp.status());
            if let Ok(t) = resp.text().await {
                msg.push('\n');
                msg.push_str(&t);
            }
            return Err(anyhow!(msg));
        }

        let td = tempdir()?;
        let file_name = target
            .rsplit('/')
            .next()
            .expect("rsplit always yields at least one piece");
        let archive_path = td.path().join(file_name);
        debug!("archive path is {}", archive_path.to_string_lossy());

        let mut received: u64 = 0;
        {
            let mut downloaded_file = File::create(&archive_path)?;
            while let Some(chunk) = resp.chunk().await? {
                received += chunk.len() as u64;
                if received > meta.length {
                    return Err(anyhow!(
                        "mirror response for {target} exceeds the expected {} bytes",
                        meta.length,
                    ));
                }
                for (_, hasher, _) in &mut hashers {
                    hasher.update(&chunk);
                }
                downloaded_file.write_all(&chunk)?;
            }
        }

        if received != meta.length {
            return Err(anyhow!(
                "mirror response for {target} was {received} bytes, expected {}",
                meta.length,
            ));
        }

        for (algorithm, hasher, expected) in hashers {
            let actual = base16ct::lower::encode_string(&hasher.finalize());
            if actual != expected {
                return Err(anyhow!(
                    "{algorithm} mismatch for {target}: expected {expected}, got {actual}",
                ));
            }
            debug!("{algorithm} for {target} is correct: {actual}");
        }

        Ok(Download {
            _temp_dir: td,
            archive_path,
        })
    }
}

type NamedHasher = (String, Box<dyn DynDigest + Send>, String);

fn hashers_for(meta: &TargetMeta) -> Result<Vec<NamedHasher>> {
    use sha2::Digest;

    if meta.hashes.is_empty() {
        return Err(anyhow!("target metadata carries no hashes to verify against"));
    }

    let mut hashers: Vec<NamedHasher> = vec![];
    for (algorithm, expected) in &meta.hashes {
        let hasher: Box<dyn DynDigest + Send> = match algorithm.as_str() {
            "sha256" => Box::new(sha2::Sha256::new()),
            "sha512" => Box::new(sha2::Sha512::new()),
            other => return Err(anyhow!("unsupported hash algorithm `{other}` in target metadata")),
        };
        hashers.push((algorithm.clone(), hasher, expected.to_lowercase()));
    }
    // Deterministic verification order makes failures reproducible in logs.
    hashers.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(hashers)
}
