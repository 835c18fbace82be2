use std::env;

use crashdecoder_service::config::{Config, LogFormat};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => {
            "INFO,\
             aws_config=WARN,\
             aws_smithy_runtime=WARN"
        }
        LevelFilter::DEBUG => {
            "INFO,\
             crashdecoder=DEBUG,\
             crashdecoder_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             crashdecoder=TRACE,\
             crashdecoder_service=TRACE"
        }
    }
}

/// Initializes logging for the decoder.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the
/// level specified in the configuration. Additionally, this toggles
/// `RUST_BACKTRACE` based on the
/// [`enable_backtraces`](crashdecoder_service::config::Logging::enable_backtraces)
/// config value.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That
/// function is only safe to call in single-threaded contexts.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a
        // single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    let subscriber = tracing_subscriber::fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(EnvFilter::new(&rust_log));

    match config.logging.format {
        LogFormat::Auto | LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Simplified => subscriber.compact().with_ansi(false).init(),
        LogFormat::Json => subscriber.json().flatten_event(true).init(),
    }
}
