use std::io::Write;
use std::path::Path;

use flate2::write::GzDecoder;
use futures::{Stream, StreamExt};

use crate::caching::{CacheEntry, CacheError};

/// Wires a remote byte stream through gzip decompression into a newly created
/// output file.
///
/// Exactly one of three outcomes resolves the transfer: the remote stream
/// errors, the local write errors, or the stream ends cleanly. On the error
/// paths the file handle is force-closed best-effort; a partial file is left
/// behind for the cache validity check to clean up.
pub async fn extract_gz_stream(
    stream: impl Stream<Item = Result<impl AsRef<[u8]>, CacheError>>,
    destination: &Path,
) -> CacheEntry {
    // All file I/O in this function is blocking!
    let file = std::fs::File::create(destination)?;
    let mut decoder = GzDecoder::new(file);

    futures::pin_mut!(stream);

    let result: CacheEntry = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            decoder.write_all(chunk.as_ref()).map_err(malformed)?;
        }
        decoder.try_finish().map_err(malformed)?;
        Ok(())
    }
    .await;

    if result.is_err() {
        // swallow secondary close errors, the transfer already failed
        let _ = decoder.finish();
    }

    result
}

/// Decompression failures are more likely a corrupt archive than a local file
/// system problem.
fn malformed(err: std::io::Error) -> CacheError {
    match err.kind() {
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
            CacheError::Malformed(err.to_string())
        }
        _ => CacheError::from(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::stream;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_clean_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("libil2cpp.so");

        let compressed = gzip(b"just enough of an elf file");
        let chunks: Vec<CacheEntry<Vec<u8>>> = compressed
            .chunks(7)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        let result = extract_gz_stream(stream::iter(chunks), &destination).await;
        assert_eq!(result, Ok(()));
        assert_eq!(
            std::fs::read(&destination).unwrap(),
            b"just enough of an elf file"
        );
    }

    #[tokio::test]
    async fn test_source_error_resolves_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("libil2cpp.so");

        let compressed = gzip(b"the transfer will not get this far");
        let chunks: Vec<CacheEntry<Vec<u8>>> = vec![
            Ok(compressed[..10].to_vec()),
            Err(CacheError::DownloadError("connection reset".to_owned())),
        ];

        let result = extract_gz_stream(stream::iter(chunks), &destination).await;
        assert_eq!(
            result,
            Err(CacheError::DownloadError("connection reset".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("libil2cpp.so");

        let chunks: Vec<CacheEntry<Vec<u8>>> =
            vec![Ok(b"this is not a gzip archive at all".to_vec())];

        let result = extract_gz_stream(stream::iter(chunks), &destination).await;
        assert!(
            matches!(result, Err(CacheError::Malformed(_))),
            "{result:?}"
        );
    }
}
