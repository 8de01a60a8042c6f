use log::warn;
use semver::Version;
use serde::Deserialize;
use strum::{AsRefStr, EnumIter, EnumString, VariantNames};

/// The set of binaries this library manages. Every operation that names a
/// binary takes one of these tags; unknown names from operator requests are
/// rejected at the edge (see [`crate::controller`]).
#[derive(AsRefStr, Clone, Copy, Debug, EnumIter, EnumString, Eq, Hash, PartialEq, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Binary {
    Launcher,
    Osqueryd,
}

impl Binary {
    /// The name used in TUF target paths and library directory names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Binary::Launcher => "launcher",
            Binary::Osqueryd => "osqueryd",
        }
    }

    /// The file name of this binary's executable on the current platform.
    #[must_use]
    pub fn executable_name(self) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.exe", self.name())
        } else {
            self.name().to_string()
        }
    }
}

impl std::fmt::Display for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named rolling release pointer maintained server-side. The channel
/// indirects to a concrete release via the channel's `release.json` target.
#[derive(AsRefStr, Clone, Copy, Debug, Default, EnumString, Eq, PartialEq, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Nightly,
    Alpha,
}

impl Channel {
    /// Parses a channel name from configuration. An empty or unknown value
    /// falls back to [`Channel::Stable`]; pinned versions, when valid, take
    /// precedence over the channel anyway.
    #[must_use]
    pub fn from_flag(value: &str) -> Channel {
        if value.is_empty() {
            return Channel::default();
        }
        value.parse().unwrap_or_else(|_| {
            warn!("unknown update channel `{value}`, using {}", Channel::default().as_ref());
            Channel::default()
        })
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// One entry in an operator update request. The name is matched against
/// [`Binary`]; requests naming anything else are logged and ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct RequestedBinary {
    pub name: String,
}

/// Launcher versions below this cannot be pinned to. Older launchers predate
/// the pinning flag and would not honor it after a downgrade.
pub(crate) const MINIMUM_PINNED_LAUNCHER_VERSION: Version = Version::new(1, 6, 1);

/// Validates a pinned version from configuration. Returns `None` when the pin
/// is unusable, in which case resolution falls back to the channel.
pub(crate) fn sanitize_pinned_version(binary: Binary, raw: &str) -> Option<Version> {
    if raw.is_empty() {
        return None;
    }

    let version = match Version::parse(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("ignoring pinned {binary} version `{raw}`, cannot parse as semver: {e}");
            return None;
        }
    };

    if binary == Binary::Launcher && version < MINIMUM_PINNED_LAUNCHER_VERSION {
        warn!(
            "ignoring pinned launcher version `{raw}`, versions below {MINIMUM_PINNED_LAUNCHER_VERSION} cannot be pinned",
        );
        return None;
    }

    Some(version)
}

/// Parses a library directory name as semver for ordering. Dashes in the
/// prerelease are treated as dots so that `1.0.0-beta-10` orders above
/// `1.0.0-beta-2`; the caller keeps the raw name for display and on-disk use.
pub(crate) fn version_for_ordering(raw: &str) -> Option<Version> {
    let parsed = Version::parse(raw).ok()?;
    if parsed.pre.is_empty() {
        return Some(parsed);
    }

    let normalized = parsed.pre.as_str().replace('-', ".");
    let pre = semver::Prerelease::new(&normalized).ok()?;
    Some(Version {
        pre,
        ..parsed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn binary_names_are_closed() {
        assert_eq!(Binary::from_str("launcher").unwrap(), Binary::Launcher);
        assert_eq!(Binary::from_str("osqueryd").unwrap(), Binary::Osqueryd);
        assert!(Binary::from_str("osquery").is_err());
        assert!(Binary::from_str("").is_err());
    }

    #[test]
    fn channel_from_flag() {
        assert_eq!(Channel::from_flag("nightly"), Channel::Nightly);
        assert_eq!(Channel::from_flag(""), Channel::Stable);
        assert_eq!(Channel::from_flag("bogus"), Channel::Stable);
    }

    #[rstest]
    #[case(Binary::Launcher, "1.6.1", Some("1.6.1"))]
    #[case(Binary::Launcher, "2.0.0", Some("2.0.0"))]
    #[case(Binary::Launcher, "1.6.0", None)]
    #[case(Binary::Launcher, "1.5.3", None)]
    #[case(Binary::Launcher, "not-semver", None)]
    #[case(Binary::Launcher, "", None)]
    #[case(Binary::Osqueryd, "0.1.0", Some("0.1.0"))]
    #[case(Binary::Osqueryd, "5.11.0", Some("5.11.0"))]
    #[case(Binary::Osqueryd, "five", None)]
    fn pinned_version_policy(
        #[case] binary: Binary,
        #[case] raw: &str,
        #[case] expect: Option<&str>,
    ) {
        let got = sanitize_pinned_version(binary, raw);
        assert_eq!(got, expect.map(|v| Version::parse(v).unwrap()));
    }

    #[test]
    fn prerelease_dashes_order_as_dots() {
        let two = version_for_ordering("1.0.0-beta-2").unwrap();
        let ten = version_for_ordering("1.0.0-beta-10").unwrap();
        assert!(two < ten);

        let plain = version_for_ordering("1.2.3").unwrap();
        assert_eq!(plain, Version::new(1, 2, 3));

        assert!(version_for_ordering("not-a-version").is_none());
    }
}
