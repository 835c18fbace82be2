//! The processing pipeline: validation, symbolication with fallback, and
//! assembly of the outbound document.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::decoder::{self, Classification, NdkStack};
use crate::download::S3Downloader;
use crate::payload::{CrashPayload, Platform};
use crate::report::{CrashReport, ReportStatus};
use crate::symbols::SymbolCache;

/// Stamped into every outbound document.
pub const DECODER_VERSION: u32 = 20200516;
pub const DECODER_NAME: &str = "V2.4.0 - new crashreporting";

/// Drives crash reports through the full pipeline.
///
/// One report is processed by one logical task; independent reports may run
/// through the same `Processor` concurrently.
pub struct Processor {
    config: Arc<Config>,
    symbols: SymbolCache,
}

impl Processor {
    pub async fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let downloader = S3Downloader::new(&config.s3, config.symbols_bucket.clone()).await;
        let symbols = SymbolCache::new(config.clone(), downloader);
        Processor { config, symbols }
    }

    /// Decodes one raw JSON payload into the outbound document.
    ///
    /// Returns `None` when no document could be produced at all; every other
    /// outcome yields a complete document, possibly with a non-zero
    /// `decoder_error_count`.
    pub async fn decode_json_payload(&self, json_payload: &str) -> Option<Value> {
        let payload: CrashPayload = match serde_json::from_str(json_payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("could not parse crash payload: {err}");
                return None;
            }
        };

        let hash = report_hash(&payload.report_contents);
        let mut report = CrashReport::new(ReportStatus::Init, payload, hash);

        match self.validate_and_process(&mut report).await {
            Ok(document) => Some(document),
            Err(fatal) => {
                report.mark_done(Some(format!("{fatal:#}")), true);
                tracing::error!("{}", report.description_secret());
                // null to indicate a fatal error
                None
            }
        }
    }

    /// Rejects unsupported reports, then runs the decode pipeline.
    ///
    /// Everything returned as `Err` from here is fatal and faults the report.
    async fn validate_and_process(&self, report: &mut CrashReport) -> Result<Value> {
        let payload = report.payload().context("report payload is gone")?;
        if payload.platform != Platform::Android {
            bail!("only android supported");
        }
        payload.validate()?;

        report.start_processing();
        let maybe_decoded = self.parse_and_symbolicate(report).await?;
        report.mark_done(None, false);

        let document = final_report_document(report, "", &maybe_decoded);
        report.release_payload();
        Ok(document)
    }

    /// Returns the crash text, decoded when possible.
    ///
    /// All recoverable problems are recorded on `report` and answered with
    /// the undecoded backtrace text; only malformed payloads bubble up.
    async fn parse_and_symbolicate(&self, report: &mut CrashReport) -> Result<String> {
        let contents = {
            let raw = report.report_contents().context("report payload is gone")?;
            crate::payload::ReportContents::parse(raw).context("malformed report contents")?
        };

        if report.classification() == Classification::Managed {
            return Ok(decoder::to_readable_jvm_stacktrace(&contents)?);
        }

        // the undecoded backtrace is the fallback for everything below
        let decodable_text = decoder::to_decodable_text(&contents)?;

        if report.classification() == Classification::Unknown {
            report.add_error("reported binary architecture is not supported by the crash decoder");
            return Ok(decodable_text);
        }

        let max_attempts = self.config.max_symbol_attempts;
        let mut symbols_folder = None;
        for attempt in 1..=max_attempts {
            symbols_folder = self
                .symbols
                .ensure_symbols_folder_is_prepared(report)
                .await;
            if symbols_folder.is_some() {
                break;
            }
            tracing::debug!("symbols folder not prepared (attempt {attempt}/{max_attempts})");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.symbol_retry_delay).await;
            }
        }

        let Some(symbols_folder) = symbols_folder else {
            report.add_error(format!(
                "failed to prepare symbols folder (tried {max_attempts} times)."
            ));
            return Ok(decodable_text);
        };

        tracing::debug!("will try to decode report {}", report.hash);

        let ndk_stack = match NdkStack::from_config(&self.config) {
            Ok(ndk_stack) => ndk_stack,
            Err(err) => {
                report.add_error(err);
                return Ok(decodable_text);
            }
        };

        let input_lines: Vec<String> = decodable_text.lines().map(str::to_owned).collect();
        match ndk_stack.symbolicate(&symbols_folder, &input_lines).await {
            Ok(decoded) => {
                tracing::info!("decoded backtrace successfully. report {}", report.hash);
                Ok(decoded)
            }
            Err(err) => {
                report.add_error(err);
                Ok(decodable_text)
            }
        }
    }
}

/// The document shipped to the analytics index.
fn final_report_document(report: &CrashReport, reason: &str, stripped_contents: &str) -> Value {
    let stats = &report.client_stats;

    let mut document = json!({
        "@timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "decoder_version": DECODER_VERSION,
        "decoder_name": DECODER_NAME,
        "release_stage": report.release_stage,
        "person_id": stats.person_id,
        "client_commit": stats.client_commit,
        "client_version": stats.client_version,
        "crash_contents_md5": report.hash,
        "decoder_status": report.status(),
        "decoder_error_count": report.error_count(),
        "decoder_debug": report.body_info(),
        "decoder_processing_duration":
            format!("{} seconds", report.processing_duration().as_secs_f64()),
        "crashreport_reason": reason,
        "crashreport_description": stripped_contents,
    });

    if let Some(errors) = report.error_output_secret() {
        document["decoder_errors"] = Value::String(errors);
    }

    document
}

/// Stable fingerprint of the raw report contents, used as cache and log key.
fn report_hash(report_contents: &str) -> String {
    let digest = Sha256::digest(report_contents.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crashdecoder_test::{self as test};

    const BUILD_ID: &str = "f39fefb7-01d9-4509-8f76-4a99957dcf24";

    fn report() -> CrashReport {
        let raw = test::native_payload(BUILD_ID);
        let payload: CrashPayload = serde_json::from_str(&raw).unwrap();
        let hash = report_hash(&payload.report_contents);
        CrashReport::new(ReportStatus::Init, payload, hash)
    }

    #[test]
    fn test_report_hash_is_stable() {
        let one = report_hash("report contents");
        let two = report_hash("report contents");
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
        assert_ne!(one, report_hash("other contents"));
    }

    #[test]
    fn test_document_shape() {
        let mut report = report();
        report.start_processing();
        report.mark_done(None, false);

        let document = final_report_document(&report, "", "  #00  pc 1010  libil2cpp.so");
        assert_eq!(document["decoder_status"], "success");
        assert_eq!(document["decoder_error_count"], 0);
        assert_eq!(document["decoder_version"], DECODER_VERSION);
        assert_eq!(document["decoder_name"], DECODER_NAME);
        assert_eq!(document["release_stage"], "prod");
        assert_eq!(document["person_id"], "person-123");
        assert_eq!(document["crashreport_reason"], "");
        assert_eq!(
            document["crashreport_description"],
            "  #00  pc 1010  libil2cpp.so"
        );
        assert_eq!(document["crash_contents_md5"], report.hash);
        assert!(document.get("decoder_errors").is_none());
        assert!(
            document["decoder_processing_duration"]
                .as_str()
                .unwrap()
                .ends_with(" seconds")
        );
    }

    #[test]
    fn test_document_with_errors() {
        let mut report = report();
        report.start_processing();
        report.add_error("Downloading symbols failed: not found");
        report.mark_done(None, false);

        let document = final_report_document(&report, "", "fallback");
        assert_eq!(document["decoder_status"], "failed");
        assert_eq!(document["decoder_error_count"], 1);
        assert_eq!(
            document["decoder_errors"],
            "#ERROR_1 Downloading symbols failed: not found"
        );
    }
}
