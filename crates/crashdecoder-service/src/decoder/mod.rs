//! Turning raw crash payloads into decoder input and readable stacktraces.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::payload::{CrashEvent, ReportContents, StackFrame};

mod ndk_stack;

pub use ndk_stack::NdkStack;

/// CPU architectures the game ships native builds for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum Architecture {
    #[serde(rename = "ARM64")]
    Arm64,
    #[serde(rename = "ARMv7")]
    Armv7,
}

impl Architecture {
    /// Maps a reported binary architecture onto a symbols folder name.
    ///
    /// The lookup is case-insensitive; anything outside the table is
    /// unsupported. x86 is gone since the engine deprecated Android x86.
    pub fn from_binary_arch(binary_arch: &str) -> Option<Self> {
        match binary_arch.to_ascii_lowercase().as_str() {
            "arm64" => Some(Self::Arm64),
            "arm32" | "armv7" | "arm" => Some(Self::Armv7),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64 => "ARM64",
            Self::Armv7 => "ARMv7",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of crash a report contains.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// A native machine-code crash for which symbols can be fetched.
    Native(Architecture),
    /// A managed-runtime (JVM) crash; no native symbols involved.
    Managed,
    /// The payload did not identify a supported architecture.
    Unknown,
}

impl Classification {
    pub fn architecture(self) -> Option<Architecture> {
        match self {
            Self::Native(architecture) => Some(architecture),
            _ => None,
        }
    }
}

/// Inspects whether the report's application metadata carries a binary
/// architecture string. Absence means a managed (JVM) report.
pub fn classify(contents: &ReportContents) -> Classification {
    let Some(event) = contents.event() else {
        return Classification::Unknown;
    };
    match event.app.binary_arch.as_deref() {
        None => Classification::Managed,
        Some(binary_arch) => match Architecture::from_binary_arch(binary_arch) {
            Some(architecture) => Classification::Native(architecture),
            None => Classification::Unknown,
        },
    }
}

/// Failures while preparing decoder input or running the symbolication tool.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed report contents: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("report contains no crash events")]
    NoEvents,
    #[error("expected a native crash, got a jvm report")]
    NotNative,
    #[error("expected a jvm report, got a native crash")]
    NotJvm,
    #[error("ndk root is not configured and ANDROID_NDK_HOME is not set")]
    NdkRootNotSet,
    #[error("ndk-stack does not exist: {}", .0.display())]
    NdkStackMissing(PathBuf),
    #[error("no symbol files in {}", .0.display())]
    NoSymbols(PathBuf),
    #[error("i/o error talking to ndk-stack: {0}")]
    Io(#[from] std::io::Error),
    #[error("ndk-stack produced no output")]
    EmptyOutput,
}

/// Renders each stack frame of a native report as a line the symbolication
/// tool accepts:
///
/// ```text
///   #00  pc 000abc12345  path/to/file.so
/// ```
pub fn to_decodable_text(contents: &ReportContents) -> Result<String, DecodeError> {
    let event = contents.event().ok_or(DecodeError::NoEvents)?;
    if is_jvm_event(event) {
        return Err(DecodeError::NotNative);
    }

    let lines: Vec<String> = stacktrace(event)
        .iter()
        .enumerate()
        .map(|(index, frame)| ndk_stack_frame_line(index, frame))
        .collect();
    Ok(lines.join("\n"))
}

/// Renders each frame of a managed report as `#NN <method> in <file>:<line>`.
pub fn to_readable_jvm_stacktrace(contents: &ReportContents) -> Result<String, DecodeError> {
    let event = contents.event().ok_or(DecodeError::NoEvents)?;
    if !is_jvm_event(event) {
        return Err(DecodeError::NotJvm);
    }

    let lines: Vec<String> = stacktrace(event)
        .iter()
        .enumerate()
        .map(|(index, frame)| jvm_frame_line(index, frame))
        .collect();
    Ok(lines.join("\n"))
}

fn ndk_stack_frame_line(index: usize, frame: &StackFrame) -> String {
    format!(
        "  #{index:02}  pc {:x}  {}",
        frame.line_number,
        file_or_unknown(frame)
    )
}

fn jvm_frame_line(index: usize, frame: &StackFrame) -> String {
    format!(
        "#{index:02} {} in {}:{}",
        frame.method.as_deref().unwrap_or("_unknown_method"),
        file_or_unknown(frame),
        frame.line_number
    )
}

fn file_or_unknown(frame: &StackFrame) -> &str {
    if frame.file.is_empty() {
        "_unknown_file"
    } else {
        &frame.file
    }
}

fn is_jvm_event(event: &CrashEvent) -> bool {
    event.app.binary_arch.is_none()
}

fn stacktrace(event: &CrashEvent) -> &[StackFrame] {
    event
        .exceptions
        .first()
        .map(|exception| exception.stacktrace.as_slice())
        .unwrap_or(&[])
}
