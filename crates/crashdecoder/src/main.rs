use std::io::Read;
use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use crashdecoder_service::config::Config;
use crashdecoder_service::processing::Processor;

mod cli;
mod logging;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config = Config::get(args.config.as_deref())?;

    // SAFETY: no other threads are running this early.
    unsafe { logging::init_logging(&config) };

    let payload = read_payload(&args.payload)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    let document = runtime.block_on(async {
        let processor = Processor::new(config).await;
        processor.decode_json_payload(&payload).await
    });

    match document {
        Some(document) => {
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
        None => {
            tracing::error!("no document could be produced for this payload");
            process::exit(1);
        }
    }
}

fn read_payload(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read payload from stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read payload from {}", path.display()))
    }
}
