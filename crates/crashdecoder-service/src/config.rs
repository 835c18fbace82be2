use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the decoder.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Connection settings for the symbols object store.
///
/// Threaded explicitly into the downloader so that tests can run fully
/// isolated instances concurrently; there is no process-global client
/// configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// AWS region of the symbols bucket.
    pub region: String,
    /// Custom endpoint, e.g. a minio instance or the test object server.
    pub endpoint: Option<String>,
    /// Static access key. Defaults to `SYMBOLS_S3_ACCESS_KEY`.
    pub access_key: String,
    /// Static secret key. Defaults to `SYMBOLS_S3_SECRET_ACCESS_KEY`.
    pub secret_key: String,
    /// Use path-style addressing (`endpoint/bucket/key`); required for most
    /// custom endpoints.
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            region: "us-east-1".to_owned(),
            endpoint: None,
            access_key: env::var("SYMBOLS_S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: env::var("SYMBOLS_S3_SECRET_ACCESS_KEY").unwrap_or_default(),
            force_path_style: false,
        }
    }
}

/// Service configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local symbol cache, one subdirectory per build and
    /// architecture. Contents are durable and safe to reuse across restarts.
    pub cache_dir: PathBuf,

    /// Root of the bundled engine symbols, laid out `<version>/<ARCH>/*.so`.
    pub engine_symbols_dir: PathBuf,

    /// Bucket holding the per-build application symbol archives.
    /// Defaults to `SYMBOLS_S3_BUCKET`.
    pub symbols_bucket: String,

    /// Object store connection settings.
    pub s3: S3Config,

    /// Directory containing the `ndk-stack` executable.
    /// Defaults to `ANDROID_NDK_HOME`.
    pub ndk_root: Option<PathBuf>,

    /// Attempts at preparing a symbols folder before a report degrades to the
    /// undecoded backtrace.
    pub max_symbol_attempts: usize,

    /// Pause between those attempts.
    #[serde(with = "humantime_serde")]
    pub symbol_retry_delay: Duration,

    /// Logging configuration, used by the binary only.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("symbols"),
            engine_symbols_dir: PathBuf::from("unity_engine_symbols"),
            symbols_bucket: env::var("SYMBOLS_S3_BUCKET").unwrap_or_default(),
            s3: S3Config::default(),
            ndk_root: env::var_os("ANDROID_NDK_HOME").map(PathBuf::from),
            max_symbol_attempts: 3,
            symbol_retry_delay: Duration::from_secs(2),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the config from a YAML file, or the defaults when `path` is
    /// `None`.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let source =
                    fs::read_to_string(path).context("failed to open configuration file")?;
                if source.trim().is_empty() {
                    anyhow::bail!("config file empty");
                }
                serde_yaml::from_str(&source).context("failed to parse config YAML")
            }
            None => Ok(Config::default()),
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::get(None).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("symbols"));
        assert_eq!(config.max_symbol_attempts, 3);
        assert_eq!(config.symbol_retry_delay, Duration::from_secs(2));
        assert_eq!(config.s3.region, "us-east-1");
        assert!(!config.s3.force_path_style);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
cache_dir: /var/cache/symbols
symbols_bucket: game-symbols
max_symbol_attempts: 5
symbol_retry_delay: 500ms
s3:
  region: eu-west-1
  endpoint: http://127.0.0.1:9000
  force_path_style: true
logging:
  level: debug
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/symbols"));
        assert_eq!(config.symbols_bucket, "game-symbols");
        assert_eq!(config.max_symbol_attempts, 5);
        assert_eq!(config.symbol_retry_delay, Duration::from_millis(500));
        assert_eq!(config.s3.region, "eu-west-1");
        assert_eq!(
            config.s3.endpoint.as_deref(),
            Some("http://127.0.0.1:9000")
        );
        assert!(config.s3.force_path_style);
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = "logging:\n  level: verbose\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
