//! The read-only configuration collaborator. The host agent owns flag
//! storage and parsing; this subsystem only reads values and listens for
//! changes.

use crate::binary::{Binary, Channel};
use std::{
    path::PathBuf,
    sync::RwLock,
    time::Duration,
};
use strum::{AsRefStr, EnumString};
use tokio::sync::broadcast;

pub const DEFAULT_TUF_URL: &str = "https://tuf.kolide.com";
pub const DEFAULT_MIRROR_URL: &str = "https://dl.kolide.co";

pub const DEFAULT_AUTOUPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_AUTOUPDATE_INITIAL_DELAY: Duration = Duration::from_secs(5 * 60);

/// The configuration keys whose changes the update controller reacts to.
#[derive(AsRefStr, Clone, Copy, Debug, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FlagKey {
    UpdateChannel,
    PinnedLauncherVersion,
    PinnedOsquerydVersion,
    AutoupdateDownloadSplay,
}

/// What the controller needs to know about its host. Implementations must be
/// cheap to call; the controller re-reads values rather than caching them,
/// except where change detection requires remembering the previous value.
pub trait UpdateConfig: Send + Sync {
    fn root_directory(&self) -> PathBuf;

    fn updates_directory(&self) -> PathBuf {
        self.root_directory().join("updates")
    }

    fn tuf_server_url(&self) -> String;
    fn mirror_server_url(&self) -> String;
    fn update_channel(&self) -> Channel;

    /// The pinned version for `binary`, or an empty string when unpinned.
    /// Validation happens at resolution time, not here.
    fn pinned_version(&self, binary: Binary) -> String;

    fn autoupdate_interval(&self) -> Duration;
    fn autoupdate_initial_delay(&self) -> Duration;

    /// Zero disables splay entirely.
    fn autoupdate_download_splay(&self) -> Duration;

    /// Whether the host is in OS sleep/suspend. Update checks are skipped
    /// while asleep; a wedged download on a sleeping machine helps nobody.
    fn in_modern_standby(&self) -> bool;

    /// A local launcher build under development. When set, the controller
    /// stages launcher updates but never restarts into them.
    fn local_development_path(&self) -> Option<PathBuf>;

    /// Stable per-installation identifier; the seed for the splay delay.
    fn installation_id(&self) -> String;

    /// Change notifications. Each message lists the keys that changed.
    /// Dropping the receiver is deregistration.
    fn subscribe(&self) -> broadcast::Receiver<Vec<FlagKey>>;
}

/// The mutable knobs behind [`StaticConfig`].
#[derive(Clone, Debug)]
pub struct ConfigValues {
    pub root_directory: PathBuf,
    pub tuf_server_url: String,
    pub mirror_server_url: String,
    pub update_channel: Channel,
    pub pinned_launcher_version: String,
    pub pinned_osqueryd_version: String,
    pub autoupdate_interval: Duration,
    pub autoupdate_initial_delay: Duration,
    pub autoupdate_download_splay: Duration,
    pub in_modern_standby: bool,
    pub local_development_path: Option<PathBuf>,
    pub installation_id: String,
}

impl ConfigValues {
    #[must_use]
    pub fn new(root_directory: PathBuf) -> Self {
        ConfigValues {
            root_directory,
            tuf_server_url: DEFAULT_TUF_URL.to_string(),
            mirror_server_url: DEFAULT_MIRROR_URL.to_string(),
            update_channel: Channel::Stable,
            pinned_launcher_version: String::new(),
            pinned_osqueryd_version: String::new(),
            autoupdate_interval: DEFAULT_AUTOUPDATE_INTERVAL,
            autoupdate_initial_delay: DEFAULT_AUTOUPDATE_INITIAL_DELAY,
            autoupdate_download_splay: Duration::ZERO,
            in_modern_standby: false,
            local_development_path: None,
            installation_id: String::new(),
        }
    }
}

/// An in-process [`UpdateConfig`] over a plain set of values. The CLI builds
/// one from flags; tests mutate it and publish change notifications through
/// it.
#[derive(Debug)]
pub struct StaticConfig {
    values: RwLock<ConfigValues>,
    changes: broadcast::Sender<Vec<FlagKey>>,
}

impl StaticConfig {
    #[must_use]
    pub fn new(values: ConfigValues) -> Self {
        let (changes, _) = broadcast::channel(8);
        StaticConfig {
            values: RwLock::new(values),
            changes,
        }
    }

    /// Applies a mutation and notifies subscribers which keys changed. The
    /// caller names the keys; this type does not diff.
    pub fn apply(&self, changed: Vec<FlagKey>, mutate: impl FnOnce(&mut ConfigValues)) {
        mutate(&mut self.values.write().expect("config lock poisoned"));
        // Errors just mean nobody is listening yet.
        let _ = self.changes.send(changed);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigValues> {
        self.values.read().expect("config lock poisoned")
    }
}

impl UpdateConfig for StaticConfig {
    fn root_directory(&self) -> PathBuf {
        self.read().root_directory.clone()
    }

    fn tuf_server_url(&self) -> String {
        self.read().tuf_server_url.clone()
    }

    fn mirror_server_url(&self) -> String {
        self.read().mirror_server_url.clone()
    }

    fn update_channel(&self) -> Channel {
        self.read().update_channel
    }

    fn pinned_version(&self, binary: Binary) -> String {
        let values = self.read();
        match binary {
            Binary::Launcher => values.pinned_launcher_version.clone(),
            Binary::Osqueryd => values.pinned_osqueryd_version.clone(),
        }
    }

    fn autoupdate_interval(&self) -> Duration {
        self.read().autoupdate_interval
    }

    fn autoupdate_initial_delay(&self) -> Duration {
        self.read().autoupdate_initial_delay
    }

    fn autoupdate_download_splay(&self) -> Duration {
        self.read().autoupdate_download_splay
    }

    fn in_modern_standby(&self) -> bool {
        self.read().in_modern_standby
    }

    fn local_development_path(&self) -> Option<PathBuf> {
        self.read().local_development_path.clone()
    }

    fn installation_id(&self) -> String {
        self.read().installation_id.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<FlagKey>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_directory_defaults_under_root() {
        let config = StaticConfig::new(ConfigValues::new(PathBuf::from("/var/acme")));
        assert_eq!(config.updates_directory(), PathBuf::from("/var/acme/updates"));
    }

    #[tokio::test]
    async fn apply_notifies_subscribers() {
        let config = StaticConfig::new(ConfigValues::new(PathBuf::from("/tmp/x")));
        let mut rx = config.subscribe();

        config.apply(vec![FlagKey::UpdateChannel], |values| {
            values.update_channel = Channel::Nightly;
        });

        assert_eq!(rx.recv().await.unwrap(), vec![FlagKey::UpdateChannel]);
        assert_eq!(config.update_channel(), Channel::Nightly);
    }
}
