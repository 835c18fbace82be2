//! The crash report model and its processing lifecycle.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::decoder::{self, Architecture, Classification};
use crate::payload::{ClientStats, CrashPayload, Platform, ReleaseStage, ReportContents};
use crate::symbols;

/// Maximum length of one rendered processing error.
const MAX_ERROR_LEN: usize = 512;

/// Lifecycle of a [`CrashReport`].
///
/// ```text
/// Init -> Processing -> Success | Failed
///    \-----------------------------------> Faulted
/// ```
///
/// `Success`, `Failed` and `Faulted` are terminal; a finalized report accepts
/// no further errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Init,
    Processing,
    /// Everything went well.
    Success,
    /// Something went wrong during processing; the result is degraded but
    /// valid.
    Failed,
    /// A fatal error was thrown, nothing more can be done with this report.
    Faulted,
}

impl ReportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Faulted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One crash report passing through the pipeline. Single-owner and mutable
/// during processing.
pub struct CrashReport {
    started_processing_at: Instant,
    status: ReportStatus,
    /// Always available during processing. Released once the final document
    /// has been assembled, since payloads can be very large.
    payload: Option<CrashPayload>,
    pub platform: Platform,
    pub hash: String,
    errors: Vec<String>,
    pub release_stage: ReleaseStage,
    pub client_stats: ClientStats,
    pub unity_build_id: String,
    classification: Classification,
    /// Rendered eagerly so it survives `release_payload`.
    body_info: String,
}

impl CrashReport {
    /// Builds a report, copying the commonly used values out of `payload` so
    /// they stay available after the payload is released.
    ///
    /// Never fails: a payload that cannot be classified yields a report
    /// without a native architecture.
    pub fn new(status: ReportStatus, payload: CrashPayload, hash: String) -> Self {
        let classification = match ReportContents::parse(&payload.report_contents) {
            Ok(contents) => decoder::classify(&contents),
            Err(_) => Classification::Unknown,
        };

        let stats = &payload.client_stats;
        let body_info = format!(
            "Build: {} - {}\nVersion: {} (commit: {})\nPerson: {}",
            payload.index,
            payload.platform,
            stats.client_version,
            stats.client_commit,
            stats.person_id,
        );

        CrashReport {
            started_processing_at: Instant::now(),
            status,
            platform: payload.platform,
            hash,
            errors: Vec::new(),
            release_stage: payload.index,
            client_stats: payload.client_stats.clone(),
            unity_build_id: payload.unity_build_id.clone(),
            classification,
            body_info,
            payload: Some(payload),
        }
    }

    pub fn status(&self) -> ReportStatus {
        self.status
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// The native CPU architecture, or `None` for a managed (JVM) report or
    /// one whose architecture could not be classified.
    pub fn architecture(&self) -> Option<Architecture> {
        self.classification.architecture()
    }

    pub fn payload(&self) -> Option<&CrashPayload> {
        self.payload.as_ref()
    }

    pub fn report_contents(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .map(|payload| payload.report_contents.as_str())
    }

    /// Remote key of this report's application symbol archive.
    ///
    /// Fails when the report has no native architecture; symbols cannot be
    /// downloaded for a managed crash.
    pub fn symbols_download_key(&self) -> anyhow::Result<String> {
        let architecture = self.architecture().ok_or_else(|| {
            anyhow::anyhow!("do not attempt to download symbols when architecture is unknown")
        })?;
        Ok(symbols::symbols_download_key(
            &self.unity_build_id,
            architecture,
        ))
    }

    /// Marks the start of processing after validation passed.
    pub fn start_processing(&mut self) {
        assert_eq!(self.status, ReportStatus::Init, "report already started");
        self.status = ReportStatus::Processing;
    }

    /// Renders `error` to a bounded string and records it on this report.
    ///
    /// Must not be called once the report is finalized.
    pub fn add_error(&mut self, error: impl fmt::Display) {
        let error = truncate_error(error.to_string());
        tracing::debug!("add_error {error}");

        assert!(
            !self.status.is_terminal(),
            "error added to a finalized report"
        );

        self.errors.push(error);
    }

    /// Finalizes this report.
    ///
    /// `error` is a final error to record. With `faulted` the report is kaput
    /// and ends [`Faulted`](ReportStatus::Faulted); otherwise it ends
    /// [`Success`](ReportStatus::Success), or
    /// [`Failed`](ReportStatus::Failed) when any processing errors were
    /// recorded along the way.
    pub fn mark_done(&mut self, error: Option<String>, faulted: bool) {
        if let Some(error) = error {
            self.add_error(error);
        }

        if faulted {
            self.status = ReportStatus::Faulted;
            return;
        }

        self.status = if self.errors.is_empty() {
            ReportStatus::Success
        } else {
            ReportStatus::Failed
        };
        tracing::info!("{} - finished processing report", self.status);
        if let Some(errors) = self.error_output_secret() {
            tracing::warn!("finished processing report with errors:\n{errors}");
        }
    }

    /// Drops the raw payload to bound peak memory. Safe to call repeatedly.
    pub fn release_payload(&mut self) {
        self.payload = None;
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Numbered error output. May contain confidential information.
    pub fn error_output_secret(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let numbered: Vec<String> = self
            .errors
            .iter()
            .enumerate()
            .map(|(i, error)| format!("#ERROR_{} {}", i + 1, error))
            .collect();
        Some(numbered.join("\n"))
    }

    /// Payload highlights; survives [`release_payload`](Self::release_payload).
    pub fn body_info(&self) -> &str {
        &self.body_info
    }

    /// Human-readable summary that is safe to index and log.
    pub fn description(&self) -> String {
        format!(
            "{}\n{} processing errors\n{}",
            self.status,
            self.error_count(),
            self.body_info
        )
    }

    /// Like [`description`](Self::description) but with the full error text.
    /// Must never be logged to a non-confidential sink.
    pub fn description_secret(&self) -> String {
        match self.error_output_secret() {
            Some(errors) => format!("{}\n{}\n{}", self.status, errors, self.body_info),
            None => format!("{}\n{}", self.status, self.body_info),
        }
    }

    pub fn processing_duration(&self) -> Duration {
        self.started_processing_at.elapsed()
    }
}

fn truncate_error(mut error: String) -> String {
    if error.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        error.truncate(cut);
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;

    use crashdecoder_test::{self as test};

    const BUILD_ID: &str = "f39fefb7-01d9-4509-8f76-4a99957dcf24";

    fn report_from(raw_payload: String) -> CrashReport {
        let payload: CrashPayload = serde_json::from_str(&raw_payload).unwrap();
        CrashReport::new(ReportStatus::Init, payload, "cafebabe".to_owned())
    }

    #[test]
    fn test_native_report_classification() {
        let report = report_from(test::native_payload(BUILD_ID));
        assert_eq!(report.architecture(), Some(Architecture::Arm64));
        assert_eq!(report.status(), ReportStatus::Init);
        assert_eq!(report.platform, Platform::Android);
    }

    #[test]
    fn test_managed_report_has_no_architecture() {
        let report = report_from(test::jvm_payload(BUILD_ID));
        assert_eq!(report.architecture(), None);
        assert_eq!(report.classification(), Classification::Managed);
    }

    #[test]
    fn test_unparsable_contents_are_swallowed() {
        let payload = test::payload("Android", BUILD_ID, &"not json ".repeat(20));
        let report = report_from(payload);
        assert_eq!(report.architecture(), None);
        assert_eq!(report.classification(), Classification::Unknown);
    }

    #[test]
    fn test_symbols_download_key() {
        let report = report_from(test::native_payload(BUILD_ID));
        assert_eq!(
            report.symbols_download_key().unwrap(),
            "symbols/android/f39fefb7-01d9-4509-8f76-4a99957dcf24/ARM64/libil2cpp.so.debug.gz"
        );
        // deterministic
        assert_eq!(
            report.symbols_download_key().unwrap(),
            report.symbols_download_key().unwrap()
        );
    }

    #[test]
    fn test_symbols_download_key_needs_architecture() {
        let report = report_from(test::jvm_payload(BUILD_ID));
        assert!(report.symbols_download_key().is_err());
    }

    #[test]
    fn test_errors_are_capped() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.add_error("x".repeat(600));
        assert_eq!(report.error_count(), 1);
        let output = report.error_output_secret().unwrap();
        assert!(output.starts_with("#ERROR_1 "));
        assert_eq!(output.len(), "#ERROR_1 ".len() + 512);
    }

    #[test]
    #[should_panic(expected = "finalized")]
    fn test_add_error_after_finalize_panics() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.start_processing();
        report.mark_done(None, false);
        report.add_error("too late");
    }

    #[test]
    fn test_mark_done_without_errors_is_success() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.start_processing();
        report.mark_done(None, false);
        assert_eq!(report.status(), ReportStatus::Success);
    }

    #[test]
    fn test_mark_done_with_prior_errors_is_failed() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.start_processing();
        report.add_error("symbols kaput");
        report.mark_done(None, false);
        assert_eq!(report.status(), ReportStatus::Failed);
    }

    #[test]
    fn test_mark_done_faulted() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.mark_done(Some("only android supported".to_owned()), true);
        assert_eq!(report.status(), ReportStatus::Faulted);
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn test_release_payload_is_idempotent() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        assert!(report.payload().is_some());
        report.release_payload();
        report.release_payload();
        assert!(report.payload().is_none());
        // copied fields survive
        assert_eq!(report.unity_build_id, BUILD_ID);
        assert!(report.body_info().contains("Person: person-123"));
    }

    #[test]
    fn test_descriptions() {
        let mut report = report_from(test::native_payload(BUILD_ID));
        report.start_processing();
        report.add_error("Downloading symbols failed: not found");
        report.mark_done(None, false);

        let description = report.description();
        assert!(description.starts_with("failed\n1 processing errors\n"));
        assert!(!description.contains("not found"));

        let secret = report.description_secret();
        assert!(secret.contains("#ERROR_1 Downloading symbols failed: not found"));
        assert!(secret.contains("Build: prod - Android"));
    }
}
