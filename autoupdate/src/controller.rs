//! The long-running reconciliation loop. Refreshes TUF metadata, resolves
//! the desired version of each managed binary, asks the library manager to
//! make it real, and coordinates restarts once an update is staged.
//!
//! One controller per process. Operator requests and configuration changes
//! run their checks on other tasks, serialized against the scheduled checks
//! by a single controller-wide lock. Library mutation has its own per-binary
//! locks; the two only ever nest as update lock, then library lock.

use crate::{
    binary::{Binary, Channel, RequestedBinary},
    config::{FlagKey, UpdateConfig},
    installer::LibraryManager,
    metadata::{MetadataClient, TargetMeta, TargetsSnapshot},
    resolver::{self, ResolvedTarget},
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use strum::IntoEnumIterator;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

/// Metadata refresh attempts per check cycle.
const METADATA_REFRESH_TRIES: usize = 3;

/// How often stored check errors are pruned.
const ERROR_PRUNE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Stored check errors older than this are dropped.
const ERROR_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Attempts to learn the running osqueryd version, and the pause between
/// them. Early in boot osqueryd may not be answering queries yet.
const OSQUERYD_VERSION_TRIES: usize = 5;
const OSQUERYD_VERSION_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const OSQUERYD_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Returned from [`UpdateController::run`] when a new launcher version is
/// staged and the process should exit so its supervisor re-execs into it.
#[derive(Debug, Error)]
#[error("restart required to run launcher {new_version}")]
pub struct RestartRequired {
    pub new_version: String,
}

/// Best-effort restart of an external binary once its update is staged.
pub type RestartCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Library mutation as the controller sees it.
#[async_trait]
pub trait Librarian: Send + Sync {
    async fn is_installed(&self, binary: Binary, version: &str) -> bool;
    async fn add(
        &self,
        binary: Binary,
        current_version: &str,
        target: &str,
        meta: &TargetMeta,
    ) -> Result<()>;
    async fn tidy(&self, binary: Binary, current_version: &str);
}

#[async_trait]
impl Librarian for LibraryManager {
    async fn is_installed(&self, binary: Binary, version: &str) -> bool {
        self.library().is_installed(binary, version).await
    }

    async fn add(
        &self,
        binary: Binary,
        current_version: &str,
        target: &str,
        meta: &TargetMeta,
    ) -> Result<()> {
        LibraryManager::add(self, binary, current_version, target, meta).await
    }

    async fn tidy(&self, binary: Binary, current_version: &str) {
        LibraryManager::tidy(self, binary, current_version).await;
    }
}

/// A validated TUF view the controller can refresh.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn refresh(&self) -> Result<TargetsSnapshot>;
}

#[async_trait]
impl MetadataSource for MetadataClient {
    async fn refresh(&self) -> Result<TargetsSnapshot> {
        self.update().await
    }
}

/// The sibling binary's query API; used only to learn its running version.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<HashMap<String, String>>>;
}

/// Persistent store for check errors, keyed by unix-second timestamps.
pub trait KvStore: Send + Sync {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()>;
    fn delete(&self, keys: &[Vec<u8>]) -> Result<()>;
}

/// An operator request addressed to the autoupdate subsystem.
#[derive(Debug, Deserialize)]
struct UpdateRequest {
    binaries_to_update: Vec<RequestedBinary>,
    #[serde(default)]
    bypass_initial_delay: bool,
}

/// In-memory desired state, updated by flag-change notifications.
#[derive(Debug)]
struct ControllerState {
    channel: Channel,
    pinned: HashMap<Binary, String>,
    splay: Duration,
    cached_splay_delay: Option<u64>,
    initial_delay_done: bool,
}

pub struct ControllerBuilder {
    launcher_version: Option<String>,
    config: Option<Arc<dyn UpdateConfig>>,
    librarian: Option<Arc<dyn Librarian>>,
    metadata: Option<Arc<dyn MetadataSource>>,
    querier: Option<Arc<dyn Querier>>,
    error_store: Option<Arc<dyn KvStore>>,
    osqueryd_path: Option<PathBuf>,
}

impl ControllerBuilder {
    #[must_use]
    pub fn new() -> Self {
        ControllerBuilder {
            launcher_version: None,
            config: None,
            librarian: None,
            metadata: None,
            querier: None,
            error_store: None,
            osqueryd_path: None,
        }
    }

    /// The compile-time launcher version, passed in so tests can set it.
    #[must_use]
    pub fn launcher_version(mut self, version: &str) -> Self {
        self.launcher_version = Some(version.to_string());
        self
    }

    #[must_use]
    pub fn config(mut self, config: Arc<dyn UpdateConfig>) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn librarian(mut self, librarian: Arc<dyn Librarian>) -> Self {
        self.librarian = Some(librarian);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn querier(mut self, querier: Arc<dyn Querier>) -> Self {
        self.querier = Some(querier);
        self
    }

    #[must_use]
    pub fn error_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.error_store = Some(store);
        self
    }

    /// Where osqueryd is expected on disk; when set, its absence means "do
    /// not try to query a version out of it".
    #[must_use]
    pub fn osqueryd_path(mut self, path: PathBuf) -> Self {
        self.osqueryd_path = Some(path);
        self
    }

    pub fn build(self) -> Result<UpdateController> {
        let launcher_version = self
            .launcher_version
            .ok_or_else(|| anyhow!("a launcher version is required"))?;
        if launcher_version.is_empty() || launcher_version == "unknown" {
            return Err(anyhow!(
                "refusing to run with launcher version `{launcher_version}`; updates could not be compared against it",
            ));
        }

        let config = self.config.ok_or_else(|| anyhow!("a config collaborator is required"))?;
        let librarian = self.librarian.ok_or_else(|| anyhow!("a librarian is required"))?;
        let metadata = self.metadata.ok_or_else(|| anyhow!("a metadata source is required"))?;
        let querier = self.querier.ok_or_else(|| anyhow!("a querier is required"))?;

        let state = ControllerState {
            channel: config.update_channel(),
            pinned: Binary::iter()
                .map(|b| (b, config.pinned_version(b)))
                .collect(),
            splay: config.autoupdate_download_splay(),
            cached_splay_delay: None,
            initial_delay_done: false,
        };

        let (interrupt_tx, _) = watch::channel(false);
        let (restart_tx, restart_rx) = mpsc::channel(1);

        Ok(UpdateController {
            launcher_version,
            config,
            librarian,
            metadata,
            querier,
            error_store: self.error_store,
            osqueryd_path: self.osqueryd_path,
            restart_callbacks: StdMutex::new(HashMap::new()),
            update_lock: Mutex::new(()),
            state: StdMutex::new(state),
            interrupt_tx,
            restart_tx,
            restart_rx: Mutex::new(restart_rx),
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UpdateController {
    launcher_version: String,
    config: Arc<dyn UpdateConfig>,
    librarian: Arc<dyn Librarian>,
    metadata: Arc<dyn MetadataSource>,
    querier: Arc<dyn Querier>,
    error_store: Option<Arc<dyn KvStore>>,
    osqueryd_path: Option<PathBuf>,
    restart_callbacks: StdMutex<HashMap<Binary, RestartCallback>>,
    update_lock: Mutex<()>,
    state: StdMutex<ControllerState>,
    interrupt_tx: watch::Sender<bool>,
    restart_tx: mpsc::Sender<String>,
    restart_rx: Mutex<mpsc::Receiver<String>>,
}

impl std::fmt::Debug for UpdateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateController").finish_non_exhaustive()
    }
}

impl UpdateController {
    /// Registers a best-effort restart for `binary`, invoked after an update
    /// for it is staged. Absence is allowed and means no restart is needed.
    pub fn register_restart_callback(&self, binary: Binary, callback: RestartCallback) {
        self.restart_callbacks
            .lock()
            .expect("restart callback lock poisoned")
            .insert(binary, callback);
    }

    /// Stops the run loop. Idempotent; the first call wins and later calls
    /// return immediately.
    pub fn interrupt(&self) {
        self.interrupt_tx.send_replace(true);
    }

    /// The run loop. Waits out the initial delay, then checks for updates on
    /// every tick and prunes stored errors every [`ERROR_PRUNE_INTERVAL`].
    ///
    /// Returns `Ok(())` on interrupt. Returns [`RestartRequired`] when a new
    /// launcher version is staged; the supervisor is expected to exit and
    /// re-exec.
    pub async fn run(&self) -> Result<()> {
        let mut interrupt_rx = self.interrupt_tx.subscribe();
        if *interrupt_rx.borrow() {
            return Ok(());
        }
        let mut restart_rx = self
            .restart_rx
            .try_lock()
            .context("the update controller is already running")?;

        let initial_delay = self.config.autoupdate_initial_delay();
        if !initial_delay.is_zero() {
            debug!("waiting out autoupdate initial delay of {initial_delay:?}");
            tokio::select! {
                () = tokio::time::sleep(initial_delay) => {}
                _ = interrupt_rx.changed() => return Ok(()),
                Some(version) = restart_rx.recv() => {
                    return Err(anyhow::Error::new(RestartRequired { new_version: version }));
                }
            }
        }
        self.state.lock().expect("controller state lock poisoned").initial_delay_done = true;

        let mut check_ticker = tokio::time::interval(self.config.autoupdate_interval());
        check_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prune_ticker = tokio::time::interval(ERROR_PRUNE_INTERVAL);
        let mut flag_changes = self.config.subscribe();
        let mut flags_open = true;

        loop {
            tokio::select! {
                _ = check_ticker.tick() => {
                    let binaries: Vec<Binary> = Binary::iter().collect();
                    if let Err(e) = self.check_for_update(&binaries).await {
                        error!("update check failed: {e:#}");
                    }
                }
                _ = prune_ticker.tick() => self.prune_errors(),
                changed = flag_changes.recv(), if flags_open => match changed {
                    Ok(keys) => self.flags_changed(&keys).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("missed {missed} flag change notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => flags_open = false,
                },
                _ = interrupt_rx.changed() => return Ok(()),
                Some(version) = restart_rx.recv() => {
                    return Err(anyhow::Error::new(RestartRequired { new_version: version }));
                }
            }
        }
    }

    /// Handles an operator request. Requests arriving during the initial
    /// delay are dropped silently unless they ask to bypass it; unknown
    /// binary names are logged and skipped.
    pub async fn do_request(&self, raw: &[u8]) -> Result<()> {
        let request: UpdateRequest =
            serde_json::from_slice(raw).context("could not parse update request")?;

        let delay_done = self
            .state
            .lock()
            .expect("controller state lock poisoned")
            .initial_delay_done;
        if !delay_done && !request.bypass_initial_delay {
            warn!("dropping update request received during the initial delay");
            return Ok(());
        }

        let mut binaries: Vec<Binary> = vec![];
        for requested in request.binaries_to_update {
            match requested.name.parse::<Binary>() {
                Ok(binary) => {
                    if !binaries.contains(&binary) {
                        binaries.push(binary);
                    }
                }
                Err(_) => warn!("update request named unknown binary `{}`", requested.name),
            }
        }

        if binaries.is_empty() {
            debug!("update request matched no binaries, nothing to do");
            return Ok(());
        }

        self.check_for_update(&binaries).await
    }

    /// Reacts to configuration changes: refreshes in-memory desired state
    /// and, when something that affects resolution actually changed, checks
    /// the affected binaries right away.
    pub async fn flags_changed(&self, keys: &[FlagKey]) {
        let mut affected: Vec<Binary> = vec![];
        let delay_done;
        {
            let mut state = self.state.lock().expect("controller state lock poisoned");
            delay_done = state.initial_delay_done;

            for key in keys {
                match key {
                    FlagKey::UpdateChannel => {
                        let channel = self.config.update_channel();
                        if channel != state.channel {
                            info!("update channel changed from {} to {channel}", state.channel);
                            state.channel = channel;
                            affected.extend(Binary::iter());
                        }
                    }
                    FlagKey::PinnedLauncherVersion => {
                        if Self::note_pin_change(&mut state, &*self.config, Binary::Launcher) {
                            affected.push(Binary::Launcher);
                        }
                    }
                    FlagKey::PinnedOsquerydVersion => {
                        if Self::note_pin_change(&mut state, &*self.config, Binary::Osqueryd) {
                            affected.push(Binary::Osqueryd);
                        }
                    }
                    FlagKey::AutoupdateDownloadSplay => {
                        let splay = self.config.autoupdate_download_splay();
                        if splay != state.splay {
                            debug!("download splay changed to {splay:?}, resetting splay delay");
                            state.splay = splay;
                            state.cached_splay_delay = None;
                        }
                    }
                }
            }
        }

        let mut seen: Vec<Binary> = vec![];
        affected.retain(|binary| {
            if seen.contains(binary) {
                false
            } else {
                seen.push(*binary);
                true
            }
        });
        if affected.is_empty() || !delay_done {
            return;
        }

        if let Err(e) = self.check_for_update(&affected).await {
            error!("update check after flag change failed: {e:#}");
        }
    }

    fn note_pin_change(
        state: &mut ControllerState,
        config: &dyn UpdateConfig,
        binary: Binary,
    ) -> bool {
        let pin = config.pinned_version(binary);
        let previous = state.pinned.insert(binary, pin.clone());
        if previous.as_deref() != Some(pin.as_str()) {
            info!("pinned {binary} version changed to `{pin}`");
            true
        } else {
            false
        }
    }

    /// One reconciliation pass over `binaries`, in the order given.
    /// Serialized against every other check; a concurrent caller waits and
    /// then observes the first caller's result through the library.
    pub async fn check_for_update(&self, binaries: &[Binary]) -> Result<()> {
        let result = self.check_for_update_locked(binaries).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    async fn check_for_update_locked(&self, binaries: &[Binary]) -> Result<()> {
        let _guard = self.update_lock.lock().await;

        if self.config.in_modern_standby() {
            info!("host is in modern standby, skipping update check");
            return Ok(());
        }

        let snapshot = self.refresh_metadata().await?;

        let (channel, pins) = {
            let state = self.state.lock().expect("controller state lock poisoned");
            (state.channel, state.pinned.clone())
        };

        let mut launcher_update: Option<String> = None;
        let mut updated: Vec<Binary> = vec![];
        let mut failures: Vec<(Binary, anyhow::Error)> = vec![];

        for &binary in binaries {
            let pin = pins.get(&binary).cloned().unwrap_or_default();
            match self.check_one(binary, &snapshot, channel, &pin).await {
                Ok(Some(version)) => {
                    if binary == Binary::Launcher {
                        launcher_update = Some(version);
                    } else {
                        updated.push(binary);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("could not check {binary} for updates: {e:#}");
                    failures.push((binary, e));
                }
            }
        }

        if let Some(version) = launcher_update {
            if self.config.local_development_path().is_none() {
                info!("launcher {version} is staged, requesting restart");
                // Single-slot; a pending restart for an older check is fine.
                let _ = self.restart_tx.try_send(version);
                // The restart supersedes any remaining callbacks this cycle.
                return Self::gather_failures(failures);
            }
            debug!("not restarting into launcher {version}: a local development build is configured");
        }

        for binary in updated {
            let callback = self
                .restart_callbacks
                .lock()
                .expect("restart callback lock poisoned")
                .get(&binary)
                .cloned();
            if let Some(callback) = callback {
                info!("restarting {binary} to run its staged update");
                if let Err(e) = callback().await {
                    error!("restart of {binary} failed: {e:#}");
                }
            }
        }

        Self::gather_failures(failures)
    }

    async fn refresh_metadata(&self) -> Result<TargetsSnapshot> {
        let mut last_error = None;
        for attempt in 1..=METADATA_REFRESH_TRIES {
            match self.metadata.refresh().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!("TUF metadata refresh attempt {attempt} failed: {e:#}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .expect("at least one refresh attempt ran")
            .context(format!("TUF metadata refresh failed {METADATA_REFRESH_TRIES} times")))
    }

    /// Checks one binary. `Ok(Some(version))` means an update to `version`
    /// is staged in the library and a restart should follow.
    async fn check_one(
        &self,
        binary: Binary,
        snapshot: &TargetsSnapshot,
        channel: Channel,
        pin: &str,
    ) -> Result<Option<String>> {
        let resolved = resolver::resolve_target(snapshot, binary, channel, pin)?;

        if self.should_defer_for_splay(&resolved) {
            info!(
                "deferring {binary} {} inside its download splay window",
                resolved.version
            );
            return Ok(None);
        }

        let current = self.current_running_version(binary).await;
        if let Some(current) = &current {
            if *current == resolved.version {
                debug!("{binary} is already running {current}");
                return Ok(None);
            }
        }

        if self.librarian.is_installed(binary, &resolved.version).await {
            if current.is_none() {
                warn!(
                    "{binary} {} is staged but the running version is unknown; not signaling a restart",
                    resolved.version
                );
                return Ok(None);
            }
            if binary == Binary::Launcher && self.config.local_development_path().is_some() {
                debug!("launcher update is staged but a local development build is configured");
                return Ok(None);
            }
            return Ok(Some(resolved.version));
        }

        self.librarian
            .add(binary, current.as_deref().unwrap_or(""), &resolved.name, &resolved.meta)
            .await
            .with_context(|| format!("could not stage {binary} {}", resolved.version))?;

        if let Some(current) = &current {
            self.librarian.tidy(binary, current).await;
        }

        Ok(Some(resolved.version))
    }

    /// Whether a freshly promoted release is still inside this install's
    /// deterministic share of the splay window.
    fn should_defer_for_splay(&self, resolved: &ResolvedTarget) -> bool {
        let splay = self
            .state
            .lock()
            .expect("controller state lock poisoned")
            .splay;
        if splay.is_zero() || resolved.promote_time <= 0 {
            return false;
        }

        let age = unix_now_secs().saturating_sub(u64::try_from(resolved.promote_time).unwrap_or(0));
        age < self.splay_delay(splay)
    }

    /// A per-installation delay in `[1, splay_seconds]`, derived from the
    /// stable installation id so every check in a cycle agrees on it. The
    /// cache is cleared whenever the splay knob changes.
    fn splay_delay(&self, splay: Duration) -> u64 {
        let mut state = self.state.lock().expect("controller state lock poisoned");
        if let Some(delay) = state.cached_splay_delay {
            return delay;
        }

        let digest = Sha256::digest(self.config.installation_id().as_bytes());
        let seed = u64::from_be_bytes(
            digest[..8].try_into().expect("a sha256 digest has at least 8 bytes"),
        );
        let delay = (seed % splay.as_secs()) + 1;
        debug!("computed download splay delay of {delay}s");
        state.cached_splay_delay = Some(delay);
        delay
    }

    async fn current_running_version(&self, binary: Binary) -> Option<String> {
        match binary {
            // Validated at construction; the launcher always knows itself.
            Binary::Launcher => Some(self.launcher_version.clone()),
            Binary::Osqueryd => self.osqueryd_version().await,
        }
    }

    async fn osqueryd_version(&self) -> Option<String> {
        if let Some(path) = &self.osqueryd_path {
            if !path.exists() {
                warn!("osqueryd is not present at {}, cannot learn its version", path.display());
                return None;
            }
        }

        for attempt in 1..=OSQUERYD_VERSION_TRIES {
            match tokio::time::timeout(
                OSQUERYD_QUERY_TIMEOUT,
                self.querier.query("SELECT version FROM osquery_info"),
            )
            .await
            {
                Ok(Ok(rows)) => {
                    if let Some(version) = rows.first().and_then(|row| row.get("version")) {
                        return Some(version.clone());
                    }
                    warn!("osquery_info returned no version column");
                }
                Ok(Err(e)) => debug!("osqueryd version query attempt {attempt} failed: {e:#}"),
                Err(_) => debug!("osqueryd version query attempt {attempt} timed out"),
            }

            if attempt < OSQUERYD_VERSION_TRIES {
                tokio::time::sleep(OSQUERYD_VERSION_RETRY_INTERVAL).await;
            }
        }

        warn!("could not learn the running osqueryd version");
        None
    }

    fn gather_failures(failures: Vec<(Binary, anyhow::Error)>) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let summary = failures
            .iter()
            .map(|(binary, e)| format!("{binary}: {e:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow!("update check failed: {summary}"))
    }

    fn record_error(&self, error: &anyhow::Error) {
        let Some(store) = &self.error_store else {
            return;
        };
        let key = unix_now_secs().to_string();
        if let Err(e) = store.set(key.as_bytes(), format!("{error:#}").as_bytes()) {
            error!("could not record update check error: {e:#}");
        }
    }

    /// Drops stored errors older than the retention window, along with any
    /// keys that do not parse as unix-second timestamps.
    fn prune_errors(&self) {
        let Some(store) = &self.error_store else {
            return;
        };

        let cutoff = unix_now_secs().saturating_sub(ERROR_RETENTION.as_secs());
        let mut expired: Vec<Vec<u8>> = vec![];
        let scan = store.for_each(&mut |key, _value| {
            let timestamp = std::str::from_utf8(key).ok().and_then(|s| s.parse::<u64>().ok());
            match timestamp {
                Some(ts) if ts >= cutoff => {}
                Some(_) | None => expired.push(key.to_vec()),
            }
            Ok(())
        });
        if let Err(e) = scan {
            error!("could not scan stored update errors: {e:#}");
            return;
        }

        if expired.is_empty() {
            return;
        }
        debug!("pruning {} stored update errors", expired.len());
        if let Err(e) = store.delete(&expired) {
            error!("could not prune stored update errors: {e:#}");
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
