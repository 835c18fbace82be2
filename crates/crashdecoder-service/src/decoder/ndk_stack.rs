//! Invoking the external `ndk-stack` tool and condensing its output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::DecodeError;
use crate::config::Config;

/// Lines that make ndk-stack recognize the beginning of a backtrace. The
/// fingerprint and pid are synthetic, the tool only cares about the shape.
const TRIGGER_LINES: [&str; 2] = [
    "*** *** *** *** *** *** *** *** *** *** *** *** *** *** *** ***",
    "00-00 00:00:00.000: E/CRASH(12300): Build fingerprint: 'placeholder/release-keys'\
     00-00 00:00:00.000: E/CRASH(12300): pid: 12300, tid: 12300, name: Thread  >>> app.app <<<",
];

/// Handle on a resolved `ndk-stack` executable.
#[derive(Debug)]
pub struct NdkStack {
    executable: PathBuf,
}

impl NdkStack {
    /// Resolves the executable below the configured NDK root.
    pub fn from_config(config: &Config) -> Result<Self, DecodeError> {
        let root = config.ndk_root.as_ref().ok_or(DecodeError::NdkRootNotSet)?;
        let executable = root.join("ndk-stack");
        if !executable.exists() {
            return Err(DecodeError::NdkStackMissing(executable));
        }
        Ok(NdkStack { executable })
    }

    /// Feeds `input_lines` to the tool and returns the symbolicated backtrace.
    ///
    /// The subprocess is spawned per call. Its stdout is drained until EOF and
    /// the process is killed afterwards instead of waited on, to bound latency
    /// when the tool does not exit cleanly.
    pub async fn symbolicate(
        &self,
        symbols_folder: &Path,
        input_lines: &[String],
    ) -> Result<String, DecodeError> {
        let symbol_files = so_files(symbols_folder)?;
        for file in &symbol_files {
            if let Ok(metadata) = std::fs::metadata(file) {
                tracing::debug!("{} is {} KB", file.display(), metadata.len() / 1024);
            }
        }
        if symbol_files.is_empty() {
            return Err(DecodeError::NoSymbols(symbols_folder.to_path_buf()));
        }

        tracing::info!(
            "running {} with symbols folder {}",
            self.executable.display(),
            symbols_folder.display()
        );

        let mut child = Command::new(&self.executable)
            .arg("-sym")
            .arg(symbols_folder)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        for line in TRIGGER_LINES
            .iter()
            .copied()
            .chain(input_lines.iter().map(String::as_str))
        {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        stdin.shutdown().await?;
        drop(stdin);

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut output = String::new();
        stdout.read_to_string(&mut output).await?;

        // do not wait for a clean exit, the tool occasionally lingers
        let _ = child.start_kill();

        // the first two lines echo the trigger preamble
        let raw_lines: Vec<&str> = output.trim_end().split('\n').skip(2).collect();
        if raw_lines.is_empty() || raw_lines.iter().all(|line| line.is_empty()) {
            return Err(DecodeError::EmptyOutput);
        }

        let rewritten: Vec<String> = raw_lines
            .iter()
            .map(|line| postprocess_line(line))
            .collect();
        Ok(rewritten.join("\n"))
    }
}

fn so_files(folder: &Path) -> Result<Vec<PathBuf>, DecodeError> {
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

type RewriteRule = fn(&str) -> String;

/// Ordered rewrites applied to every output line.
///
/// Each rule is pure and best-effort: a line it does not match passes through
/// unchanged. The order is load-bearing, later rules match against the result
/// of earlier ones.
const REWRITE_RULES: &[RewriteRule] = &[
    collapse_build_prefix,
    strip_managed_staging,
    elide_generated_symbol,
    collapse_lumped_cpp,
    collapse_il2cpp_output,
    redact_device_lib_path,
    align_frame_address,
];

fn postprocess_line(line: &str) -> String {
    REWRITE_RULES
        .iter()
        .fold(line.to_owned(), |line, rule| rule(&line))
}

/// Absolute build-machine prefixes collapse to the project-relative marker.
fn collapse_build_prefix(line: &str) -> String {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"C:\\(?:\w+\\)+idlegame").unwrap());
    RE.replace_all(line, r"\idlegame").into_owned()
}

fn strip_managed_staging(line: &str) -> String {
    line.replacen(
        r"\idlegame\IdleGame\Temp\StagingArea\assets\bin\Data\Managed/",
        "",
        1,
    )
}

/// Obfuscated generated names shrink to `prefix...suffix` to keep lines
/// readable at a glance.
fn elide_generated_symbol(line: &str) -> String {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(_[a-z][A-Z0-9]{8})[A-Z0-9]+([A-Z0-9]{3})").unwrap());
    RE.replace(line, "${1}...${2}").into_owned()
}

fn collapse_lumped_cpp(line: &str) -> String {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"\\idlegame\\IdleGame\\Temp\\StagingArea\\Il2Cpp\\il2cppOutput\\lumpedcpp/(?:\.\.\\)+Program",
        )
        .unwrap()
    });
    RE.replace(line, r"\Program").into_owned()
}

fn collapse_il2cpp_output(line: &str) -> String {
    line.replacen(
        r"\idlegame\IdleGame\Temp\StagingArea\Il2Cpp\il2cppOutput",
        "il2cppOutput",
        1,
    )
}

/// On-device install paths must never leave this stage.
fn redact_device_lib_path(line: &str) -> String {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?:/data/app/)?com\.\w+\.\w+-[^/]+/lib").unwrap());
    RE.replace_all(line, "<app-lib>").into_owned()
}

/// Pads the frame address so the columns line up when scanning many lines.
fn align_frame_address(line: &str) -> String {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?:Stack frame )?#(\d+) +pc +([a-f0-9]+)\s+(.+)$").unwrap());
    RE.replace(line, |caps: &Captures| {
        format!("#{} {:>6} {}", &caps[1], &caps[2], &caps[3])
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crashdecoder_test::{self as test};

    fn input_lines() -> Vec<String> {
        vec!["  #00  pc 1010  libil2cpp.so".to_owned()]
    }

    #[test]
    fn test_from_config_preconditions() {
        let config = Config {
            ndk_root: None,
            ..Config::default()
        };
        assert!(matches!(
            NdkStack::from_config(&config),
            Err(DecodeError::NdkRootNotSet)
        ));

        let config = Config {
            ndk_root: Some(PathBuf::from("/nonexistent-ndk")),
            ..Config::default()
        };
        assert!(matches!(
            NdkStack::from_config(&config),
            Err(DecodeError::NdkStackMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_symbolicate_requires_symbol_files() {
        let symbols = tempfile::tempdir().unwrap();
        let ndk = tempfile::tempdir().unwrap();

        let ndk_stack = NdkStack {
            executable: test::fake_ndk_root(ndk.path()).join("ndk-stack"),
        };
        let result = ndk_stack.symbolicate(symbols.path(), &input_lines()).await;
        assert!(matches!(result, Err(DecodeError::NoSymbols(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_symbolicate_with_stand_in_tool() {
        let symbols = tempfile::tempdir().unwrap();
        std::fs::write(symbols.path().join("libil2cpp.so"), b"elf").unwrap();
        let ndk = tempfile::tempdir().unwrap();

        let ndk_stack = NdkStack {
            executable: test::fake_ndk_root(ndk.path()).join("ndk-stack"),
        };
        let decoded = ndk_stack
            .symbolicate(symbols.path(), &input_lines())
            .await
            .unwrap();

        assert_eq!(
            decoded,
            "#00   1010 <app-lib>/arm64/libil2cpp.so (Foo::bar(int)+64)"
        );
    }

    #[test]
    fn test_collapse_build_prefix() {
        let line = r"      at C:\build\agent\idlegame\IdleGame\Temp\StagingArea\Il2Cpp\il2cppOutput\Bulk_Generics_7.cpp:4242";
        assert_eq!(
            postprocess_line(line),
            r"      at il2cppOutput\Bulk_Generics_7.cpp:4242"
        );
    }

    #[test]
    fn test_strip_managed_staging() {
        let line = r"\idlegame\IdleGame\Temp\StagingArea\assets\bin\Data\Managed/Assembly-CSharp.dll";
        assert_eq!(postprocess_line(line), "Assembly-CSharp.dll");
    }

    #[test]
    fn test_elide_generated_symbol() {
        let line = "_a12345678ABCDEFXYZ ()";
        assert_eq!(postprocess_line(line), "_a12345678...XYZ ()");
    }

    #[test]
    fn test_collapse_lumped_cpp() {
        let line = r"\idlegame\IdleGame\Temp\StagingArea\Il2Cpp\il2cppOutput\lumpedcpp/..\..\Program\Main.cpp";
        assert_eq!(postprocess_line(line), r"\Program\Main.cpp");
    }

    #[test]
    fn test_redact_device_lib_path() {
        let line =
            "#01 pc 00a0 /data/app/com.gamin.game-8pvIZOQIOKNw==/lib/arm64/libunity.so (foo+64)";
        assert_eq!(
            postprocess_line(line),
            "#01   00a0 <app-lib>/arm64/libunity.so (foo+64)"
        );
    }

    #[test]
    fn test_align_frame_address() {
        let line = "Stack frame #00 pc 0001a2b4 libfoo.so (routine+12)";
        assert_eq!(postprocess_line(line), "#00 0001a2b4 libfoo.so (routine+12)");

        let line = "#3 pc 1f libbar.so";
        assert_eq!(postprocess_line(line), "#3     1f libbar.so");
    }

    #[test]
    fn test_unmatched_lines_pass_through() {
        let line = "Crash dump is completed";
        assert_eq!(postprocess_line(line), line);
    }
}
