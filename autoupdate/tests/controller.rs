//! End-to-end exercises of the update controller against a real library
//! manager, a real filesystem, and a mock mirror. Only the TUF metadata
//! source and the osqueryd querier are faked.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use autoupdate::{
    Binary, Channel, ConfigValues, ControllerBuilder, FlagKey, KvStore, LibraryManager,
    MetadataSource, Querier, RestartRequired, StaticConfig, TargetMeta, TargetsSnapshot,
    UpdateConfig, UpdateController, UpdateLibrary,
};
use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

fn platform_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn platform_arch() -> &'static str {
    if platform_os() == "darwin" {
        return "universal";
    }
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn archive_target(binary: Binary, version: &str) -> String {
    format!(
        "{name}/{os}/{arch}/{name}-{version}.tar.gz",
        name = binary.name(),
        os = platform_os(),
        arch = platform_arch(),
    )
}

fn release_json_target(binary: Binary, channel: Channel) -> String {
    format!(
        "{name}/{os}/{arch}/{channel}/release.json",
        name = binary.name(),
        os = platform_os(),
        arch = platform_arch(),
    )
}

fn tarball_with_executable(binary: Binary) -> Vec<u8> {
    let mut builder = binstall_tar::Builder::new(GzEncoder::new(vec![], Compression::default()));
    let script = b"#!/bin/sh\nexit 0\n";
    let mut header = binstall_tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    builder
        .append_data(&mut header, binary.executable_name(), script.as_slice())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn meta_for(body: &[u8]) -> TargetMeta {
    TargetMeta {
        length: body.len() as u64,
        hashes: HashMap::from([(
            "sha256".to_string(),
            base16ct::lower::encode_string(&Sha256::digest(body)),
        )]),
        custom: None,
    }
}

fn snapshot_with_release(
    binary: Binary,
    channel: Channel,
    version: &str,
    archive_body: &[u8],
) -> TargetsSnapshot {
    let archive = archive_target(binary, version);
    let mut snapshot = TargetsSnapshot::new();
    snapshot.insert(archive.clone(), meta_for(archive_body));
    snapshot.insert(
        release_json_target(binary, channel),
        TargetMeta {
            length: 64,
            hashes: HashMap::from([("sha256".to_string(), "bb".repeat(32))]),
            custom: Some(serde_json::json!({ "target": archive })),
        },
    );
    snapshot
}

#[derive(Debug)]
struct FakeMetadata {
    snapshot: Mutex<TargetsSnapshot>,
}

impl FakeMetadata {
    fn new(snapshot: TargetsSnapshot) -> Self {
        FakeMetadata {
            snapshot: Mutex::new(snapshot),
        }
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn refresh(&self) -> Result<TargetsSnapshot> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

#[derive(Debug)]
struct FakeQuerier {
    version: Option<String>,
}

#[async_trait]
impl Querier for FakeQuerier {
    async fn query(&self, _sql: &str) -> Result<Vec<HashMap<String, String>>> {
        match &self.version {
            Some(version) => Ok(vec![HashMap::from([(
                "version".to_string(),
                version.clone(),
            )])]),
            None => Err(anyhow!("osqueryd is not answering")),
        }
    }
}

#[derive(Debug, Default)]
struct MemKvStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvStore for MemKvStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for (key, value) in self.entries.lock().unwrap().iter() {
            f(key, value)?;
        }
        Ok(())
    }

    fn delete(&self, keys: &[Vec<u8>]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

struct Harness {
    controller: UpdateController,
    config: Arc<StaticConfig>,
    library: UpdateLibrary,
    store: Arc<MemKvStore>,
    _root: tempfile::TempDir,
}

fn harness(
    mirror: &mockito::Server,
    snapshot: TargetsSnapshot,
    launcher_version: &str,
    osqueryd_version: Option<&str>,
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let updates_dir = root.path().join("updates");
    let library = UpdateLibrary::new(updates_dir.clone());

    let config = Arc::new(StaticConfig::new(ConfigValues {
        installation_id: "integration-test-host".to_string(),
        autoupdate_initial_delay: Duration::ZERO,
        ..ConfigValues::new(root.path().to_path_buf())
    }));

    let librarian = Arc::new(LibraryManager::new(
        UpdateLibrary::new(updates_dir),
        &mirror.url(),
        reqwest::Client::new(),
    ));
    let store = Arc::new(MemKvStore::default());

    let controller = ControllerBuilder::new()
        .launcher_version(launcher_version)
        .config(Arc::clone(&config) as Arc<dyn UpdateConfig>)
        .librarian(librarian)
        .metadata(Arc::new(FakeMetadata::new(snapshot)))
        .querier(Arc::new(FakeQuerier {
            version: osqueryd_version.map(ToString::to_string),
        }))
        .error_store(Arc::clone(&store) as Arc<dyn KvStore>)
        .build()
        .unwrap();

    Harness {
        controller,
        config,
        library,
        store,
        _root: root,
    }
}

#[cfg(target_family = "unix")]
fn install_fake_version(library: &UpdateLibrary, binary: Binary, version: &str) {
    use std::os::unix::fs::PermissionsExt;
    let exe = library.executable_path(binary, version);
    fs::create_dir_all(exe.parent().unwrap()).unwrap();
    fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
}

fn installed_versions(library: &UpdateLibrary, binary: Binary) -> Vec<String> {
    let dir: PathBuf = library.updates_dir().join(binary.name());
    if !dir.exists() {
        return vec![];
    }
    let mut versions: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    versions.sort();
    versions
}

fn assert_runnable(path: &Path) {
    #[cfg(target_family = "unix")]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert!(mode & 0o111 != 0, "{} is not executable", path.display());
    }
    assert!(path.is_file());
}

// Cold install: empty root, the channel serves a release, and the staged
// launcher update surfaces as a restart request from the run loop.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn cold_install_from_channel_requests_restart() {
    let mut mirror = mockito::Server::new_async().await;
    let body = tarball_with_executable(Binary::Launcher);
    let target = archive_target(Binary::Launcher, "1.2.3");
    let mock = mirror
        .mock("GET", format!("/kolide/{target}").as_str())
        .with_body(&body)
        .create_async()
        .await;

    let snapshot = snapshot_with_release(Binary::Launcher, Channel::Nightly, "1.2.3", &body);
    let hx = harness(&mirror, snapshot, "1.0.0", None);
    hx.config.apply(vec![FlagKey::UpdateChannel], |values| {
        values.update_channel = Channel::Nightly;
        values.autoupdate_interval = Duration::from_millis(20);
    });
    // The run loop has not subscribed yet, so deliver the change by hand.
    hx.controller.flags_changed(&[FlagKey::UpdateChannel]).await;

    let err = tokio::time::timeout(Duration::from_secs(10), hx.controller.run())
        .await
        .expect("run loop should return once the update is staged")
        .unwrap_err();
    let restart = err.downcast_ref::<RestartRequired>().unwrap();
    assert_eq!(restart.new_version, "1.2.3");

    mock.assert_async().await;
    assert_eq!(installed_versions(&hx.library, Binary::Launcher), vec!["1.2.3"]);
    assert_runnable(&hx.library.executable_path(Binary::Launcher, "1.2.3"));
}

// Update already staged: no download happens, and the registered restart
// callback for osqueryd fires exactly once.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn staged_update_restarts_without_downloading() {
    let mirror = mockito::Server::new_async().await;
    let snapshot = snapshot_with_release(Binary::Osqueryd, Channel::Stable, "5.11.0", b"unused");
    let hx = harness(&mirror, snapshot, "1.0.0", Some("5.10.0"));

    install_fake_version(&hx.library, Binary::Osqueryd, "5.11.0");

    let restarts = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&restarts);
    hx.controller.register_restart_callback(
        Binary::Osqueryd,
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
        }),
    );

    hx.controller.check_for_update(&[Binary::Osqueryd]).await.unwrap();

    assert_eq!(*restarts.lock().unwrap(), 1);
    assert_eq!(installed_versions(&hx.library, Binary::Osqueryd), vec!["5.11.0"]);
}

// A pin below the launcher policy floor never materializes on disk; the
// channel's release is installed instead.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn rejected_pin_installs_the_channel_release() {
    let mut mirror = mockito::Server::new_async().await;
    let channel_body = tarball_with_executable(Binary::Launcher);
    let channel_target = archive_target(Binary::Launcher, "1.2.4");
    mirror
        .mock("GET", format!("/kolide/{channel_target}").as_str())
        .with_body(&channel_body)
        .create_async()
        .await;

    let mut snapshot = snapshot_with_release(Binary::Launcher, Channel::Stable, "1.2.4", &channel_body);
    // The pinned version is published, so only the pin policy rejects it.
    let pinned_body = tarball_with_executable(Binary::Launcher);
    snapshot.insert(archive_target(Binary::Launcher, "1.5.3"), meta_for(&pinned_body));

    let hx = harness(&mirror, snapshot, "1.0.0", None);
    hx.config.apply(vec![FlagKey::PinnedLauncherVersion], |values| {
        values.pinned_launcher_version = "1.5.3".to_string();
    });
    hx.controller.flags_changed(&[FlagKey::PinnedLauncherVersion]).await;
    hx.controller.check_for_update(&[Binary::Launcher]).await.unwrap();

    assert_eq!(installed_versions(&hx.library, Binary::Launcher), vec!["1.2.4"]);
}

// Corrupt download: nothing appears in the library, the error lands in the
// store under a timestamp key, and pruning respects the retention window.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn corrupt_download_is_recorded_and_never_installed() {
    let mut mirror = mockito::Server::new_async().await;
    let body = tarball_with_executable(Binary::Osqueryd);
    let target = archive_target(Binary::Osqueryd, "5.11.0");
    mirror
        .mock("GET", format!("/kolide/{target}").as_str())
        .with_body(b"tampered bytes".as_slice())
        .create_async()
        .await;

    // The metadata carries the authentic hash; the mirror serves something else.
    let snapshot = snapshot_with_release(Binary::Osqueryd, Channel::Stable, "5.11.0", &body);

    let hx = harness(&mirror, snapshot, "1.0.0", Some("5.10.0"));
    let err = hx.controller.check_for_update(&[Binary::Osqueryd]).await.unwrap_err();
    assert!(err.to_string().contains("update check failed"), "{err}");

    assert_eq!(installed_versions(&hx.library, Binary::Osqueryd), Vec::<String>::new());

    {
        let entries = hx.store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        let key = entries.keys().next().unwrap().clone();
        std::str::from_utf8(&key).unwrap().parse::<u64>().unwrap();
    }
}

// Three near-simultaneous operator requests produce exactly one download.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn concurrent_operator_requests_download_once() {
    let mut mirror = mockito::Server::new_async().await;
    let body = tarball_with_executable(Binary::Launcher);
    let target = archive_target(Binary::Launcher, "1.2.3");
    let mock = mirror
        .mock("GET", format!("/kolide/{target}").as_str())
        .with_body(&body)
        .expect(1)
        .create_async()
        .await;

    let snapshot = snapshot_with_release(Binary::Launcher, Channel::Stable, "1.2.3", &body);
    let hx = Arc::new(harness(&mirror, snapshot, "1.0.0", None));

    let mut handles = vec![];
    for _ in 0..3 {
        let hx = Arc::clone(&hx);
        handles.push(tokio::spawn(async move {
            hx.controller
                .do_request(br#"{"binaries_to_update": [{"name": "launcher"}, {"name": "osqueryd"}], "bypass_initial_delay": true}"#)
                .await
        }));
    }
    for handle in handles {
        // osqueryd has no channel release in this snapshot, so each check
        // reports a failure for it; the launcher side must still be staged
        // exactly once.
        let _ = handle.await.unwrap();
    }

    mock.assert_async().await;
    assert_eq!(installed_versions(&hx.library, Binary::Launcher), vec!["1.2.3"]);
}

// Sleep then wake: checks during modern standby do nothing at all; the
// first check after waking catches up to the release.
#[cfg(target_family = "unix")]
#[tokio::test]
async fn standby_defers_and_wake_catches_up() {
    let mut mirror = mockito::Server::new_async().await;
    let body = tarball_with_executable(Binary::Launcher);
    let target = archive_target(Binary::Launcher, "1.2.3");
    let mock = mirror
        .mock("GET", format!("/kolide/{target}").as_str())
        .with_body(&body)
        .expect(1)
        .create_async()
        .await;

    let snapshot = snapshot_with_release(Binary::Launcher, Channel::Stable, "1.2.3", &body);
    let hx = harness(&mirror, snapshot, "1.0.0", None);

    hx.config.apply(vec![], |values| values.in_modern_standby = true);
    for _ in 0..3 {
        hx.controller.check_for_update(&[Binary::Launcher]).await.unwrap();
        assert_eq!(installed_versions(&hx.library, Binary::Launcher), Vec::<String>::new());
    }

    hx.config.apply(vec![], |values| values.in_modern_standby = false);
    hx.controller.check_for_update(&[Binary::Launcher]).await.unwrap();

    mock.assert_async().await;
    assert_eq!(installed_versions(&hx.library, Binary::Launcher), vec!["1.2.3"]);
}
