//! Helpers for testing the crash decoding pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory
//!    is held for the entire lifetime of the test. When dropped too early,
//!    this might silently leak the temp directory. Assign it to a variable in
//!    the test function (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - When using [`ObjectServer`], keep the value alive until the last
//!    download has completed; dropping it aborts the server task.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: the logger only captures logs from the
///    `crashdecoder_service` crate and mutes all others.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("crashdecoder_service=trace")
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it
/// as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// A local object store speaking just enough of the S3 REST dialect for the
/// downloader: `GET /{bucket}/{key}` with path-style addressing.
pub struct ObjectServer {
    addr: SocketAddr,
    objects: Objects,
    handle: tokio::task::JoinHandle<()>,
}

impl ObjectServer {
    /// Binds to an ephemeral localhost port; requires a running tokio
    /// runtime.
    pub async fn spawn() -> Self {
        let objects = Objects::default();
        let router = Router::new()
            .route("/:bucket/*key", get(serve_object))
            .with_state(objects.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        ObjectServer {
            addr,
            objects,
            handle,
        }
    }

    /// Endpoint URL for the downloader config.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stores `bytes` under `bucket/key`.
    pub fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"), bytes);
    }
}

impl Drop for ObjectServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_object(
    UrlPath((bucket, key)): UrlPath<(String, String)>,
    State(objects): State<Objects>,
) -> Result<Vec<u8>, StatusCode> {
    objects
        .lock()
        .unwrap()
        .get(&format!("{bucket}/{key}"))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

/// Compresses `bytes` the way symbol archives are stored remotely.
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Writes a stand-in `ndk-stack` executable into `dir` and returns the
/// directory, to be used as the NDK root.
///
/// The stand-in echoes the two trigger lines and then emits one resolved
/// frame per input line, with an on-device library path so the redaction
/// rules have something to chew on.
pub fn fake_ndk_root(dir: &Path) -> PathBuf {
    let script = r#"#!/bin/sh
exec awk '
NR <= 2 { print; next }
{
    printf "Stack frame %s pc %s /data/app/com.example.game-3xYz12AbC==/lib/arm64/libil2cpp.so (Foo::bar(int)+64)\n", $1, $3
}
'
"#;
    let executable = dir.join("ndk-stack");
    std::fs::write(&executable, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    dir.to_path_buf()
}

/// A complete inbound payload for the given platform and report contents.
pub fn payload(platform: &str, unity_build_id: &str, report_contents: &str) -> String {
    serde_json::json!({
        "index": "prod",
        "platform": platform,
        "client_stats": {
            "person_id": "person-123",
            "client_commit": "abcdef1234567890",
            "client_version": "1.33.7"
        },
        "report_contents": report_contents,
        "unity_build_id": unity_build_id
    })
    .to_string()
}

/// A native ARM64 crash payload with a single `libil2cpp.so` frame at
/// pc `0x1010`.
pub fn native_payload(unity_build_id: &str) -> String {
    native_payload_with_arch(unity_build_id, "arm64")
}

/// Same as [`native_payload`] but with an arbitrary reported architecture.
pub fn native_payload_with_arch(unity_build_id: &str, binary_arch: &str) -> String {
    payload(
        "Android",
        unity_build_id,
        &report_contents(Some(binary_arch)),
    )
}

/// A managed (JVM) crash payload without a binary architecture.
pub fn jvm_payload(unity_build_id: &str) -> String {
    payload("Android", unity_build_id, &report_contents(None))
}

/// The crash-reporter document embedded in a payload.
pub fn report_contents(binary_arch: Option<&str>) -> String {
    let mut app = serde_json::json!({ "versionCode": 512 });
    if let Some(binary_arch) = binary_arch {
        app["binaryArch"] = binary_arch.into();
    }
    serde_json::json!({
        "events": [{
            "exceptions": [{
                "stacktrace": [
                    { "file": "libil2cpp.so", "lineNumber": 4112, "method": "Foo.bar" }
                ],
                "errorClass": "SIGSEGV",
                "message": "Segmentation violation (invalid memory reference)",
                "type": "c"
            }],
            "breadcrumbs": [],
            "app": app
        }]
    })
    .to_string()
}
