//! Maps (binary, OS, arch, channel-or-pin) to a concrete archive target in a
//! targets snapshot. This module owns the target naming scheme:
//!
//! ```text
//! <binary>/<os>/<arch>/<binary>-<version>.tar.gz          the archive itself
//! <binary>/<os>/<arch>/<channel>/release.json             channel indirection
//! ```
//!
//! On macOS the published artifacts are universal binaries, so `<arch>` is
//! the literal `universal` there.

use crate::{
    binary::{sanitize_pinned_version, Binary, Channel},
    metadata::{TargetMeta, TargetsSnapshot},
};
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

/// A resolution failure that names the lookup that came up empty.
#[derive(Debug, Error)]
#[error("no TUF target `{target}` while resolving the {lookup}")]
pub struct TargetNotFound {
    pub lookup: &'static str,
    pub target: String,
}

/// The resolved archive target plus everything the caller needs to act on
/// it.
#[derive(Clone, Debug)]
pub struct ResolvedTarget {
    /// Full target name, e.g. `launcher/linux/amd64/launcher-1.2.3.tar.gz`.
    pub name: String,
    /// The version encoded in the target name.
    pub version: String,
    pub meta: TargetMeta,
    /// When the release was promoted to its channel, unix seconds. Zero for
    /// pinned resolutions and releases without a promote time; zero means no
    /// splay protection applies.
    pub promote_time: i64,
}

/// The custom metadata attached to a channel's `release.json` target.
#[derive(Debug, Deserialize)]
struct ReleaseCustom {
    target: String,
    #[serde(default)]
    promote_time: i64,
}

/// Resolves for the platform this binary was built for.
pub fn resolve_target(
    snapshot: &TargetsSnapshot,
    binary: Binary,
    channel: Channel,
    pinned_version: &str,
) -> Result<ResolvedTarget> {
    resolve_target_for(snapshot, binary, platform_os(), platform_arch(), channel, pinned_version)
}

/// Resolution with an explicit platform; split out so tests can cover
/// platforms other than the one running the tests.
pub(crate) fn resolve_target_for(
    snapshot: &TargetsSnapshot,
    binary: Binary,
    os: &str,
    arch: &str,
    channel: Channel,
    pinned_version: &str,
) -> Result<ResolvedTarget> {
    // Universal artifacts replace per-arch ones on macOS.
    let arch = if os == "darwin" { "universal" } else { arch };

    if let Some(pin) = sanitize_pinned_version(binary, pinned_version) {
        let name = archive_target(binary, os, arch, &pin.to_string());
        if let Some(meta) = snapshot.get(&name) {
            debug!("resolved {binary} to pinned version {pin}");
            return Ok(ResolvedTarget {
                name,
                version: pin.to_string(),
                meta: meta.clone(),
                promote_time: 0,
            });
        }
        warn!(
            "pinned {binary} version {pin} has no published target `{name}`, falling back to the {channel} channel",
        );
    }

    let release_name = release_json_target(binary, os, arch, channel);
    let release_meta = snapshot.get(&release_name).ok_or_else(|| {
        anyhow!(TargetNotFound {
            lookup: "channel release.json",
            target: release_name.clone(),
        })
    })?;

    let custom = release_meta
        .custom
        .as_ref()
        .ok_or_else(|| anyhow!("release target `{release_name}` carries no custom metadata"))?;
    let release: ReleaseCustom = serde_json::from_value(custom.clone())
        .with_context(|| format!("could not parse custom metadata on `{release_name}`"))?;

    let meta = snapshot.get(&release.target).ok_or_else(|| {
        anyhow!(TargetNotFound {
            lookup: "channel release target",
            target: release.target.clone(),
        })
    })?;

    let version = version_from_target(binary, &release.target)?;
    debug!("resolved {binary} to {version} via the {channel} channel");
    Ok(ResolvedTarget {
        name: release.target.clone(),
        version,
        meta: meta.clone(),
        promote_time: release.promote_time,
    })
}

pub(crate) fn archive_target(binary: Binary, os: &str, arch: &str, version: &str) -> String {
    format!("{binary}/{os}/{arch}/{binary}-{version}.tar.gz", binary = binary.name())
}

pub(crate) fn release_json_target(binary: Binary, os: &str, arch: &str, channel: Channel) -> String {
    format!("{binary}/{os}/{arch}/{channel}/release.json", binary = binary.name())
}

/// Extracts `<version>` from `<binary>/<os>/<arch>/<binary>-<version>.tar.gz`.
pub(crate) fn version_from_target(binary: Binary, target: &str) -> Result<String> {
    let base = target
        .rsplit('/')
        .next()
        .expect("rsplit always yields at least one piece");

    let prefix = format!("{}-", binary.name());
    base.strip_prefix(&prefix)
        .and_then(|rest| rest.strip_suffix(".tar.gz"))
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("target `{target}` is not a {} archive name", binary.name()))
}

pub(crate) fn platform_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub(crate) fn platform_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use test_log::test;

    fn meta(length: u64) -> TargetMeta {
        TargetMeta {
            length,
            hashes: HashMap::from([("sha256".to_string(), "aa".repeat(32))]),
            custom: None,
        }
    }

    fn snapshot_with_release(
        binary: Binary,
        os: &str,
        arch: &str,
        channel: Channel,
        version: &str,
        promote_time: Option<i64>,
    ) -> TargetsSnapshot {
        let archive = archive_target(binary, os, arch, version);
        let mut custom = json!({ "target": archive });
        if let Some(t) = promote_time {
            custom["promote_time"] = json!(t);
        }

        let mut snapshot = TargetsSnapshot::new();
        snapshot.insert(archive, meta(1024));
        snapshot.insert(
            release_json_target(binary, os, arch, channel),
            TargetMeta {
                custom: Some(custom),
                ..meta(64)
            },
        );
        snapshot
    }

    #[test]
    fn channel_resolution_follows_release_json() {
        let snapshot = snapshot_with_release(
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Nightly,
            "1.2.3",
            Some(1_700_000_000),
        );

        let resolved =
            resolve_target_for(&snapshot, Binary::Launcher, "linux", "amd64", Channel::Nightly, "")
                .unwrap();
        assert_eq!(resolved.name, "launcher/linux/amd64/launcher-1.2.3.tar.gz");
        assert_eq!(resolved.version, "1.2.3");
        assert_eq!(resolved.promote_time, 1_700_000_000);
    }

    #[test]
    fn missing_promote_time_means_zero() {
        let snapshot = snapshot_with_release(
            Binary::Osqueryd,
            "linux",
            "amd64",
            Channel::Stable,
            "5.11.0",
            None,
        );

        let resolved =
            resolve_target_for(&snapshot, Binary::Osqueryd, "linux", "amd64", Channel::Stable, "")
                .unwrap();
        assert_eq!(resolved.promote_time, 0);
    }

    #[test]
    fn valid_pin_short_circuits_the_channel() {
        let mut snapshot = snapshot_with_release(
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Stable,
            "1.2.3",
            None,
        );
        snapshot.insert(
            archive_target(Binary::Launcher, "linux", "amd64", "1.7.0"),
            meta(2048),
        );

        let resolved =
            resolve_target_for(&snapshot, Binary::Launcher, "linux", "amd64", Channel::Stable, "1.7.0")
                .unwrap();
        assert_eq!(resolved.version, "1.7.0");
        assert_eq!(resolved.promote_time, 0);
    }

    #[test]
    fn rejected_pin_falls_back_to_channel() {
        // 1.6.0 is below the launcher pinning floor, so it never resolves
        // even though a target for it exists.
        let mut snapshot = snapshot_with_release(
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Stable,
            "1.2.4",
            None,
        );
        snapshot.insert(
            archive_target(Binary::Launcher, "linux", "amd64", "1.6.0"),
            meta(2048),
        );

        let resolved =
            resolve_target_for(&snapshot, Binary::Launcher, "linux", "amd64", Channel::Stable, "1.6.0")
                .unwrap();
        assert_eq!(resolved.version, "1.2.4");
    }

    #[test]
    fn unpublished_pin_falls_back_to_channel() {
        let snapshot = snapshot_with_release(
            Binary::Osqueryd,
            "linux",
            "amd64",
            Channel::Beta,
            "5.11.0",
            None,
        );

        let resolved =
            resolve_target_for(&snapshot, Binary::Osqueryd, "linux", "amd64", Channel::Beta, "5.99.0")
                .unwrap();
        assert_eq!(resolved.version, "5.11.0");
    }

    #[test]
    fn pin_equal_to_channel_release_resolves_identically() {
        let snapshot = snapshot_with_release(
            Binary::Osqueryd,
            "linux",
            "amd64",
            Channel::Stable,
            "5.11.0",
            None,
        );

        let via_channel =
            resolve_target_for(&snapshot, Binary::Osqueryd, "linux", "amd64", Channel::Stable, "")
                .unwrap();
        let via_pin =
            resolve_target_for(&snapshot, Binary::Osqueryd, "linux", "amd64", Channel::Stable, "5.11.0")
                .unwrap();
        assert_eq!(via_channel.name, via_pin.name);
        assert_eq!(via_channel.version, via_pin.version);
    }

    #[test]
    fn missing_release_json_names_the_failed_lookup() {
        let snapshot = TargetsSnapshot::new();
        let err = resolve_target_for(
            &snapshot,
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Nightly,
            "",
        )
        .unwrap_err();

        let not_found = err.downcast_ref::<TargetNotFound>().unwrap();
        assert_eq!(not_found.lookup, "channel release.json");
        assert_eq!(not_found.target, "launcher/linux/amd64/nightly/release.json");
    }

    #[test]
    fn dangling_release_pointer_names_the_failed_lookup() {
        let mut snapshot = snapshot_with_release(
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Stable,
            "1.2.3",
            None,
        );
        snapshot.remove("launcher/linux/amd64/launcher-1.2.3.tar.gz");

        let err = resolve_target_for(
            &snapshot,
            Binary::Launcher,
            "linux",
            "amd64",
            Channel::Stable,
            "",
        )
        .unwrap_err();
        let not_found = err.downcast_ref::<TargetNotFound>().unwrap();
        assert_eq!(not_found.lookup, "channel release target");
    }

    #[test]
    fn darwin_always_uses_universal_artifacts() {
        let snapshot = snapshot_with_release(
            Binary::Launcher,
            "darwin",
            "universal",
            Channel::Stable,
            "1.2.3",
            None,
        );

        // The caller's arch is ignored on darwin.
        let resolved =
            resolve_target_for(&snapshot, Binary::Launcher, "darwin", "arm64", Channel::Stable, "")
                .unwrap();
        assert_eq!(resolved.name, "launcher/darwin/universal/launcher-1.2.3.tar.gz");
    }

    #[test]
    fn version_round_trips_through_target_names() {
        let name = archive_target(Binary::Launcher, "linux", "amd64", "1.2.3-beta-2");
        assert_eq!(version_from_target(Binary::Launcher, &name).unwrap(), "1.2.3-beta-2");

        assert!(version_from_target(Binary::Osqueryd, &name).is_err());
        assert!(version_from_target(Binary::Launcher, "launcher/linux/amd64/launcher-1.2.3.zip").is_err());
    }
}
