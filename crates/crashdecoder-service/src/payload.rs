//! Serde models for the inbound crash payload and the crash-report document
//! embedded in it.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de};

/// Build environment the reporting client was built for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStage {
    Prod,
    Test,
    Debug,
}

impl ReleaseStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Test => "test",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for ReleaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime platforms the game client reports from.
///
/// Only [`Android`](Self::Android) makes it past validation; the rest exist so
/// that payloads from other players deserialize into a well-formed rejection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Platform {
    OSXPlayer,
    OSXEditor,
    WindowsPlayer,
    WindowsEditor,
    IPhonePlayer,
    Android,
    LinuxPlayer,
    LinuxEditor,
    WebGLPlayer,
    WSAPlayerX86,
    WSAPlayerX64,
    WSAPlayerARM,
    PS4,
    XboxOne,
    #[serde(rename = "tvOS")]
    TvOS,
    Switch,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OSXPlayer => "OSXPlayer",
            Self::OSXEditor => "OSXEditor",
            Self::WindowsPlayer => "WindowsPlayer",
            Self::WindowsEditor => "WindowsEditor",
            Self::IPhonePlayer => "IPhonePlayer",
            Self::Android => "Android",
            Self::LinuxPlayer => "LinuxPlayer",
            Self::LinuxEditor => "LinuxEditor",
            Self::WebGLPlayer => "WebGLPlayer",
            Self::WSAPlayerX86 => "WSAPlayerX86",
            Self::WSAPlayerX64 => "WSAPlayerX64",
            Self::WSAPlayerARM => "WSAPlayerARM",
            Self::PS4 => "PS4",
            Self::XboxOne => "XboxOne",
            Self::TvOS => "tvOS",
            Self::Switch => "Switch",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side bookkeeping shipped with every report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientStats {
    pub person_id: String,
    pub client_commit: String,
    pub client_version: String,
}

/// The inbound crash report payload.
#[derive(Clone, Debug, Deserialize)]
pub struct CrashPayload {
    pub index: ReleaseStage,
    pub platform: Platform,
    pub client_stats: ClientStats,
    /// The raw crash report document, itself JSON (see [`ReportContents`]).
    pub report_contents: String,
    pub unity_build_id: String,
}

static COMMIT_SHA: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{8,64}$").unwrap());

impl CrashPayload {
    /// Checks the field constraints the schema middleware enforces upstream.
    ///
    /// Violations are fatal for the report.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.report_contents.len() >= 100,
            "report_contents is too short to be a crash report"
        );
        anyhow::ensure!(!self.unity_build_id.is_empty(), "unity_build_id is empty");
        anyhow::ensure!(
            COMMIT_SHA.is_match(&self.client_stats.client_commit),
            "client_commit is not a commit sha: {:?}",
            self.client_stats.client_commit
        );
        Ok(())
    }
}

/// The parsed `report_contents` document.
#[derive(Clone, Debug, Deserialize)]
pub struct ReportContents {
    pub events: Vec<CrashEvent>,
}

impl ReportContents {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// The reporting client only ever sends a single event per report.
    pub fn event(&self) -> Option<&CrashEvent> {
        self.events.first()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CrashEvent {
    #[serde(default)]
    pub exceptions: Vec<CrashException>,
    pub app: AppInfo,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CrashException {
    #[serde(default)]
    pub stacktrace: Vec<StackFrame>,
    /// Usually the signal name, e.g. `SIGSEGV`.
    #[serde(default, rename = "errorClass")]
    pub error_class: Option<String>,
    /// Description of the signal.
    #[serde(default)]
    pub message: Option<String>,
}

/// One raw stack frame.
#[derive(Clone, Debug, Deserialize)]
pub struct StackFrame {
    /// Mapped file, e.g. an on-device library path. May be empty.
    pub file: String,
    /// The program counter for native frames, the source line for JVM frames.
    #[serde(rename = "lineNumber")]
    pub line_number: u64,
    #[serde(default)]
    pub method: Option<String>,
}

/// Application metadata attached to each event.
#[derive(Clone, Debug, Deserialize)]
pub struct AppInfo {
    /// Omitted when the report is for a JVM exception.
    #[serde(default, rename = "binaryArch")]
    pub binary_arch: Option<String>,
    #[serde(rename = "versionCode", deserialize_with = "deserialize_counting_number")]
    pub version_code: u64,
}

fn deserialize_counting_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u64, D::Error> {
    let value = u64::deserialize(deserializer)?;
    if value == 0 {
        return Err(de::Error::invalid_value(
            de::Unexpected::Unsigned(0),
            &"a counting number (1 or greater)",
        ));
    }
    Ok(value)
}
