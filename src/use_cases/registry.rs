// Inventory of locally installed engine versions plus the on-demand
// installer (CDN index lookup, mirror download, checksum, atomic publish).

use crate::use_cases::runner::{ENGINE_BINARY, engine_binary_path};
use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[cfg(windows)]
const PLATFORM_CATEGORY: &str = "engine_windows64";
#[cfg(not(windows))]
const PLATFORM_CATEGORY: &str = "engine_linux64";

const DOWNLOADS_DIR: &str = ".downloads";

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub engines_dir: PathBuf,
    pub cdn_base_url: String,
    pub install_timeout: Duration,
    pub download_max_attempts: u32,
    pub download_retry_backoff_base: Duration,
}

/// Fatal startup failures while opening the registry.
#[derive(Debug)]
pub enum RegistryError {
    Io(std::io::Error),
    Watch(notify::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "cannot enumerate engines directory: {e}"),
            RegistryError::Watch(e) => write!(f, "cannot watch engines directory: {e}"),
        }
    }
}

#[derive(Debug)]
pub enum InstallError {
    /// The CDN index has no release for this version.
    NotFound { version: String },
    /// The version string itself cannot name a directory safely.
    InvalidVersion { version: String },
    /// The CDN index payload is unusable.
    InvalidIndex { details: String },
    Http { details: String },
    ChecksumMismatch { expected: String, actual: String },
    ExtractFailed { details: String },
    /// The archive did not contain the engine binary.
    BinaryMissing { path: PathBuf },
    Io(std::io::Error),
    TimedOut,
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::NotFound { version } => {
                write!(f, "no engine release found for {version:?}")
            }
            InstallError::InvalidVersion { version } => {
                write!(f, "invalid engine version name {version:?}")
            }
            InstallError::InvalidIndex { details } => write!(f, "bad CDN index response: {details}"),
            InstallError::Http { details } => write!(f, "engine download failed: {details}"),
            InstallError::ChecksumMismatch { expected, actual } => {
                write!(f, "archive checksum mismatch: expected {expected}, got {actual}")
            }
            InstallError::ExtractFailed { details } => write!(f, "archive extraction failed: {details}"),
            InstallError::BinaryMissing { path } => {
                write!(f, "extracted archive has no engine binary at {}", path.display())
            }
            InstallError::Io(e) => write!(f, "io error during install: {e}"),
            InstallError::TimedOut => f.write_str("engine install timed out"),
        }
    }
}

impl From<std::io::Error> for InstallError {
    fn from(e: std::io::Error) -> Self {
        InstallError::Io(e)
    }
}

/// One release descriptor from the CDN index. Unknown fields are tolerated.
#[derive(Debug, Clone, serde::Deserialize)]
struct EngineRelease {
    filename: String,
    md5: String,
    mirrors: Vec<String>,
}

/// Watches `engines/` for installed versions and installs new ones.
pub struct EngineRegistry {
    settings: RegistrySettings,
    http: reqwest::Client,
    versions_tx: watch::Sender<Vec<String>>,
    installing: Mutex<HashSet<String>>,
}

impl EngineRegistry {
    /// Scan the engines directory, publish the initial version set and start
    /// the directory watcher.
    pub fn open(settings: RegistrySettings) -> Result<Arc<Self>, RegistryError> {
        std::fs::create_dir_all(&settings.engines_dir).map_err(RegistryError::Io)?;
        let versions = scan_versions(&settings.engines_dir).map_err(RegistryError::Io)?;
        info!(?versions, "installed engines");
        let (versions_tx, _) = watch::channel(versions);

        let registry = Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            versions_tx,
            installing: Mutex::new(HashSet::new()),
        });
        registry.spawn_watcher()?;
        Ok(registry)
    }

    fn spawn_watcher(self: &Arc<Self>) -> Result<(), RegistryError> {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(_) => {
                    let _ = tick_tx.send(());
                }
                Err(e) => warn!(error = %e, "engines watcher error"),
            }
        })
        .map_err(RegistryError::Watch)?;
        watcher
            .watch(&self.settings.engines_dir, RecursiveMode::NonRecursive)
            .map_err(RegistryError::Watch)?;

        let engines_dir = self.settings.engines_dir.clone();
        let versions_tx = self.versions_tx.clone();
        tokio::spawn(async move {
            // The watcher must live as long as this task.
            let _watcher = watcher;
            while tick_rx.recv().await.is_some() {
                // Collapse bursts of filesystem events into one rescan.
                while tick_rx.try_recv().is_ok() {}
                match scan_versions(&engines_dir) {
                    Ok(versions) => {
                        versions_tx.send_if_modified(|current| {
                            if *current == versions {
                                return false;
                            }
                            info!(?versions, "installed engines changed");
                            *current = versions;
                            true
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to rescan engines directory"),
                }
            }
            debug!("engines watcher stopped");
        });
        Ok(())
    }

    /// Currently installed versions, sorted.
    pub fn versions(&self) -> Vec<String> {
        self.versions_tx.borrow().clone()
    }

    pub fn subscribe_versions(&self) -> watch::Receiver<Vec<String>> {
        self.versions_tx.subscribe()
    }

    pub fn is_installed(&self, version: &str) -> bool {
        engine_binary_path(&self.settings.engines_dir, version).exists()
    }

    /// Install an engine version from the CDN. Concurrent installs of the
    /// same version are collapsed into one.
    pub async fn install(&self, version: &str) -> Result<(), InstallError> {
        {
            let mut installing = self.installing.lock().expect("install set poisoned");
            if !installing.insert(version.to_string()) {
                info!(version, "engine install already in flight");
                return Ok(());
            }
        }

        let result =
            tokio::time::timeout(self.settings.install_timeout, self.install_inner(version)).await;
        self.installing
            .lock()
            .expect("install set poisoned")
            .remove(version);

        match result {
            Ok(result) => result,
            Err(_) => {
                warn!(version, "engine install timed out");
                Err(InstallError::TimedOut)
            }
        }
    }

    async fn install_inner(&self, version: &str) -> Result<(), InstallError> {
        if version.starts_with('.') || version.contains('/') || version.contains('\\') {
            return Err(InstallError::InvalidVersion {
                version: version.to_string(),
            });
        }
        if self.is_installed(version) {
            info!(version, "engine already installed");
            return Ok(());
        }

        let release = self.lookup_release(version).await?;
        info!(version, filename = %release.filename, "installing engine");

        let downloads_dir = self.settings.engines_dir.join(DOWNLOADS_DIR);
        tokio::fs::create_dir_all(&downloads_dir).await?;
        let archive_path = downloads_dir.join(&release.filename);
        let temp_dir = self.settings.engines_dir.join(format!(
            ".tmp-install-{version}-{}",
            uuid::Uuid::new_v4()
        ));

        let result = self
            .download_verify_publish(version, &release, &archive_path, &temp_dir)
            .await;

        // Transient artifacts are removed in every outcome; both live under
        // dot-prefixed names the watcher ignores.
        let _ = tokio::fs::remove_file(&archive_path).await;
        let _ = tokio::fs::remove_dir_all(&temp_dir).await;
        result
    }

    async fn lookup_release(&self, version: &str) -> Result<EngineRelease, InstallError> {
        let url = format!("{}/find", self.settings.cdn_base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("category", PLATFORM_CATEGORY), ("springname", version)])
            .send()
            .await
            .map_err(|e| InstallError::Http {
                details: format!("index request failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(InstallError::Http {
                details: format!("index request returned {}", response.status()),
            });
        }
        let releases: Vec<EngineRelease> =
            response.json().await.map_err(|e| InstallError::InvalidIndex {
                details: e.to_string(),
            })?;
        let release = releases
            .into_iter()
            .next()
            .ok_or_else(|| InstallError::NotFound {
                version: version.to_string(),
            })?;
        if release.filename.is_empty()
            || release.filename.contains('/')
            || release.filename.contains('\\')
        {
            return Err(InstallError::InvalidIndex {
                details: format!("unusable archive filename {:?}", release.filename),
            });
        }
        if release.mirrors.is_empty() {
            return Err(InstallError::InvalidIndex {
                details: "release has no mirrors".to_string(),
            });
        }
        Ok(release)
    }

    async fn download_verify_publish(
        &self,
        version: &str,
        release: &EngineRelease,
        archive_path: &Path,
        temp_dir: &Path,
    ) -> Result<(), InstallError> {
        let mirror = &release.mirrors[0];
        let mut attempt = 1u32;
        loop {
            match self.download_archive(mirror, archive_path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(&release.md5) => break,
                Ok(actual) => {
                    let _ = tokio::fs::remove_file(archive_path).await;
                    if attempt >= self.settings.download_max_attempts {
                        return Err(InstallError::ChecksumMismatch {
                            expected: release.md5.clone(),
                            actual,
                        });
                    }
                    warn!(version, attempt, expected = %release.md5, actual = %actual,
                        "archive checksum mismatch; retrying");
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(archive_path).await;
                    if attempt >= self.settings.download_max_attempts {
                        return Err(e);
                    }
                    warn!(version, attempt, error = %e, "engine download failed; retrying");
                }
            }
            let backoff = self.settings.download_retry_backoff_base * 2u32.pow(attempt - 1);
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }

        tokio::fs::create_dir_all(temp_dir).await?;
        self.extract_archive(archive_path, temp_dir).await?;

        let binary = temp_dir.join(ENGINE_BINARY);
        if !binary.exists() {
            return Err(InstallError::BinaryMissing { path: binary });
        }

        // Replace any previous install of the same version, then publish the
        // finished directory with one rename.
        let dest = self.settings.engines_dir.join(version);
        match tokio::fs::remove_dir_all(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(InstallError::Io(e)),
        }
        tokio::fs::rename(temp_dir, &dest).await?;
        info!(version, "engine installed");
        Ok(())
    }

    async fn download_archive(
        &self,
        mirror: &str,
        archive_path: &Path,
    ) -> Result<String, InstallError> {
        use tokio::io::AsyncWriteExt;

        debug!(mirror, "downloading engine archive");
        let mut response = self
            .http
            .get(mirror)
            .send()
            .await
            .map_err(|e| InstallError::Http {
                details: format!("download request failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(InstallError::Http {
                details: format!("download returned {}", response.status()),
            });
        }

        let mut file = tokio::fs::File::create(archive_path).await?;
        let mut digest = md5::Context::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| InstallError::Http {
            details: format!("download interrupted: {e}"),
        })? {
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(format!("{:x}", digest.compute()))
    }

    async fn extract_archive(&self, archive_path: &Path, temp_dir: &Path) -> Result<(), InstallError> {
        let output = tokio::process::Command::new("7z")
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", temp_dir.display()))
            .arg(archive_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InstallError::ExtractFailed {
                details: format!("cannot run 7z: {e}"),
            })?;
        if !output.status.success() {
            return Err(InstallError::ExtractFailed {
                details: format!(
                    "7z exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Depth-1 scan of the engines directory; dot-prefixed names are transient
/// artifacts and never count as versions.
fn scan_versions(engines_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(engines_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        versions.push(name);
    }
    versions.sort();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(engines_dir: PathBuf) -> RegistrySettings {
        RegistrySettings {
            engines_dir,
            cdn_base_url: "http://127.0.0.1:9".to_string(),
            install_timeout: Duration::from_secs(5),
            download_max_attempts: 2,
            download_retry_backoff_base: Duration::from_millis(5),
        }
    }

    #[test]
    fn scan_ignores_hidden_and_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("105.1.1-2449")).unwrap();
        std::fs::create_dir(dir.path().join("BAR 105")).unwrap();
        std::fs::create_dir(dir.path().join(".downloads")).unwrap();
        std::fs::create_dir(dir.path().join(".tmp-install-x-y")).unwrap();
        std::fs::write(dir.path().join("README"), "not a version").unwrap();

        let versions = scan_versions(dir.path()).unwrap();
        assert_eq!(versions, vec!["105.1.1-2449", "BAR 105"]);
    }

    #[tokio::test]
    async fn install_short_circuits_when_binary_present() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("105.1");
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join(ENGINE_BINARY), b"#!/bin/sh\n").unwrap();

        // The CDN base points nowhere; reaching it would fail the install.
        let registry = EngineRegistry::open(settings(dir.path().to_path_buf())).unwrap();
        registry.install("105.1").await.unwrap();
    }

    #[tokio::test]
    async fn install_rejects_unsafe_version_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EngineRegistry::open(settings(dir.path().to_path_buf())).unwrap();
        assert!(matches!(
            registry.install("../escape").await,
            Err(InstallError::InvalidVersion { .. })
        ));
        assert!(matches!(
            registry.install(".hidden").await,
            Err(InstallError::InvalidVersion { .. })
        ));
    }

    #[tokio::test]
    async fn watcher_publishes_version_set_changes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EngineRegistry::open(settings(dir.path().to_path_buf())).unwrap();
        assert_eq!(registry.versions(), Vec::<String>::new());

        let mut rx = registry.subscribe_versions();
        std::fs::create_dir(dir.path().join("105.2")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("watcher should notice the new version")
            .unwrap();
        assert_eq!(*rx.borrow(), vec!["105.2".to_string()]);
    }
}
