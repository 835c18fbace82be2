//! Local symbol cache preparation.
//!
//! Each `(build, architecture)` pair gets one directory below the configured
//! cache root, holding the shared engine symbol files plus the downloaded
//! per-build application symbol file. Directories are durable: they are never
//! deleted by the decode path and are reused across reports and restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::decoder::Architecture;
use crate::download::S3Downloader;
use crate::report::CrashReport;

/// Name of the per-build application symbol file.
pub const APP_SYMBOL_FILE: &str = "libil2cpp.so";

/// Engine version the client is currently built with.
pub const ENGINE_VERSION: &str = "2019.2.8f1";

/// `libil2cpp.so` debug files average above a gigabyte; anything below this
/// is a truncated download and gets deleted on sight.
const MIN_APP_SYMBOL_SIZE: u64 = 12 * 1000 * 1000;

/// Remote key of the application symbol archive for one build/architecture.
pub fn symbols_download_key(unity_build_id: &str, architecture: Architecture) -> String {
    format!("symbols/android/{unity_build_id}/{architecture}/{APP_SYMBOL_FILE}.debug.gz")
}

/// Manages the local symbol cache, fetching application symbols from the
/// remote bucket on demand.
pub struct SymbolCache {
    config: Arc<Config>,
    downloader: S3Downloader,
    /// Serializes first-time population per cache directory so that
    /// concurrent reports for the same build do not download the same
    /// archive twice.
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SymbolCache {
    pub fn new(config: Arc<Config>, downloader: S3Downloader) -> Self {
        SymbolCache {
            config,
            downloader,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Makes sure a local directory with every symbol file needed to decode
    /// `report` exists, downloading the application symbols if necessary.
    ///
    /// Returns `None` when the report has no native architecture, or when the
    /// symbols could not be prepared in this attempt. Fetch errors are
    /// recorded on the report; the caller is expected to retry with backoff.
    pub async fn ensure_symbols_folder_is_prepared(
        &self,
        report: &mut CrashReport,
    ) -> Option<PathBuf> {
        let architecture = report.architecture()?;

        assert!(
            !self.config.symbols_bucket.is_empty(),
            "bucket for symbols not set"
        );

        let folder_name = cache_folder_name(&report.unity_build_id, architecture);
        let symbols_folder = self.config.cache_dir.join(&folder_name);

        tracing::debug!("preparing symbols folder {}", symbols_folder.display());
        if let Err(err) = tokio::fs::create_dir_all(&symbols_folder).await {
            report.add_error(format!("failed to create symbols folder: {err}"));
            return None;
        }

        // engine symbols are best-effort; without them engine-internal frames
        // simply stay unresolved
        if !self.prepare_engine_symbols(&symbols_folder, architecture).await {
            tracing::warn!(
                "engine symbols could not be prepared, continuing but engine stacktrace lines will not be decoded"
            );
        }

        if valid_app_symbols_exist(&symbols_folder) {
            return Some(symbols_folder);
        }

        let lock = self.population_lock(&folder_name);
        let _guard = lock.lock().await;

        // whoever held the lock before us may have populated the folder
        if valid_app_symbols_exist(&symbols_folder) {
            return Some(symbols_folder);
        }

        let key = match report.symbols_download_key() {
            Ok(key) => key,
            Err(err) => {
                report.add_error(err);
                return None;
            }
        };

        let started = Instant::now();
        let destination = symbols_folder.join(APP_SYMBOL_FILE);
        let result = self.downloader.download_gzipped(&key, &destination).await;
        tracing::debug!(
            "symbols download for report {} took {:?}",
            report.hash,
            started.elapsed()
        );

        match result {
            Ok(()) => {
                assert!(
                    valid_app_symbols_exist(&symbols_folder),
                    "symbols folder contains one valid symbols file"
                );
                Some(symbols_folder)
            }
            Err(err) => {
                report.add_error(format!("Downloading symbols failed: {err}"));
                None
            }
        }
    }

    fn population_lock(&self, folder_name: &str) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        inflight.entry(folder_name.to_owned()).or_default().clone()
    }

    /// Copies the bundled engine symbol files for `architecture` into the
    /// folder. Returns whether the full set was copied.
    async fn prepare_engine_symbols(
        &self,
        symbols_folder: &Path,
        architecture: Architecture,
    ) -> bool {
        let source = self
            .config
            .engine_symbols_dir
            .join(ENGINE_VERSION)
            .join(architecture.as_str());

        let files = match engine_symbol_files(&source) {
            Ok(files) if !files.is_empty() => files,
            _ => {
                tracing::debug!("engine symbols do not exist for architecture {architecture}");
                return false;
            }
        };

        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let destination = symbols_folder.join(name);
            if let Err(err) = tokio::fs::copy(&file, &destination).await {
                tracing::debug!("failed to copy engine symbol {}: {err}", file.display());
                return false;
            }
        }
        true
    }
}

fn engine_symbol_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        if path.extension().is_some_and(|extension| extension == "so") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A filesystem-safe directory name for one `(build, architecture)` pair.
fn cache_folder_name(unity_build_id: &str, architecture: Architecture) -> String {
    format!("{unity_build_id}_{architecture}")
        .chars()
        .map(|c| match c {
            '.' => '-',
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => c,
            _ => '-',
        })
        .collect()
}

/// Checks for a valid application symbol file, deleting truncated leftovers.
fn valid_app_symbols_exist(symbols_folder: &Path) -> bool {
    let path = symbols_folder.join(APP_SYMBOL_FILE);
    match std::fs::metadata(&path) {
        Ok(metadata) if metadata.len() > MIN_APP_SYMBOL_SIZE => true,
        Ok(_) => {
            tracing::debug!("removing truncated symbol file {}", path.display());
            let _ = std::fs::remove_file(&path);
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::payload::CrashPayload;
    use crate::report::ReportStatus;

    use crashdecoder_test::{self as test};

    #[tokio::test]
    async fn test_managed_report_prepares_nothing() {
        let cache = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            cache_dir: cache.path().to_path_buf(),
            symbols_bucket: "symbols-test".to_owned(),
            ..Config::default()
        });
        let downloader = S3Downloader::new(&config.s3, config.symbols_bucket.clone()).await;
        let symbol_cache = SymbolCache::new(config, downloader);

        let payload: CrashPayload =
            serde_json::from_str(&test::jvm_payload("some-build")).unwrap();
        let mut report = CrashReport::new(ReportStatus::Init, payload, "hash".to_owned());

        // nothing to prepare, no network access, no errors recorded
        assert_eq!(
            symbol_cache
                .ensure_symbols_folder_is_prepared(&mut report)
                .await,
            None
        );
        assert_eq!(report.error_count(), 0);
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_symbols_download_key() {
        assert_eq!(
            symbols_download_key(
                "f39fefb7-01d9-4509-8f76-4a99957dcf24",
                Architecture::Arm64
            ),
            "symbols/android/f39fefb7-01d9-4509-8f76-4a99957dcf24/ARM64/libil2cpp.so.debug.gz"
        );
        assert_eq!(
            symbols_download_key("build", Architecture::Armv7),
            "symbols/android/build/ARMv7/libil2cpp.so.debug.gz"
        );
    }

    #[test]
    fn test_cache_folder_name() {
        assert_eq!(
            cache_folder_name("f39fefb7-01d9-4509-8f76-4a99957dcf24", Architecture::Arm64),
            "f39fefb7-01d9-4509-8f76-4a99957dcf24_ARM64"
        );
        // dots and other specials are normalized away
        assert_eq!(
            cache_folder_name("2019.2.8f1 (custom)", Architecture::Armv7),
            "2019-2-8f1--custom-_ARMv7"
        );
    }

    #[test]
    fn test_undersized_symbols_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(APP_SYMBOL_FILE);

        std::fs::write(&path, b"way too small").unwrap();
        assert!(!valid_app_symbols_exist(dir.path()));
        assert!(!path.exists(), "undersized file must be deleted on sight");

        // absent stays invalid without error
        assert!(!valid_app_symbols_exist(dir.path()));
    }

    #[test]
    fn test_large_symbols_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(APP_SYMBOL_FILE);

        std::fs::write(&path, vec![0u8; (MIN_APP_SYMBOL_SIZE + 1) as usize]).unwrap();
        assert!(valid_app_symbols_exist(dir.path()));
        assert!(path.exists());
    }
}
