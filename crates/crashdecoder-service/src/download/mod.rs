//! Downloading symbol archives from the remote object store.

use std::path::Path;

use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use futures::TryStreamExt as _;

use crate::caching::{CacheEntry, CacheError};
use crate::config::S3Config;

mod extract;

pub use extract::extract_gz_stream;

/// Downloader for the app-symbol bucket.
///
/// Built from explicit configuration; nothing is read from ambient process
/// state beyond the base AWS environment.
#[derive(Clone, Debug)]
pub struct S3Downloader {
    client: Client,
    bucket: String,
}

impl S3Downloader {
    pub async fn new(config: &S3Config, bucket: String) -> Self {
        let credentials = Credentials::from_keys(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
        );
        let mut loader = aws_config::from_env()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        S3Downloader {
            client: Client::from_conf(builder.build()),
            bucket,
        }
    }

    /// Downloads the gzip archive at `key` and decompresses it into
    /// `destination` in-flight.
    ///
    /// A single transfer attempt; retrying is up to the caller.
    pub async fn download_gzipped(&self, key: &str, destination: &Path) -> CacheEntry {
        tracing::debug!("begin download; bucket:{}; key:{}", self.bucket, key);

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_content_type("application/gzip")
            .send();

        let response = match request.await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(
                    "skipping response from s3://{}/{}: {}",
                    self.bucket,
                    key,
                    err
                );
                return Err(map_get_object_error(err));
            }
        };

        let mut body = std::pin::pin!(response.body);
        let stream = futures::stream::poll_fn(move |cx| body.as_mut().poll_next(cx))
            .map_err(|err| CacheError::download_error(&err));

        extract::extract_gz_stream(stream, destination).await
    }
}

fn map_get_object_error(err: SdkError<GetObjectError>) -> CacheError {
    if let SdkError::ServiceError(service_err) = &err {
        // The errors and status codes are explained here:
        // <https://docs.aws.amazon.com/AmazonS3/latest/API/ErrorResponses.html#ErrorCodeList>
        let status = service_err.raw().status();
        let code = service_err.err().code();

        // NOTE: leaving the credentials empty, as unit / integration tests do,
        // leads to an `AuthorizationHeaderMalformed` error.
        if matches!(status.as_u16(), 401 | 403) || code == Some("AuthorizationHeaderMalformed") {
            let details = service_err.err().message().unwrap_or_default().to_string();
            return CacheError::PermissionDenied(details);
        }

        if status.as_u16() == 404
            || service_err.err().is_no_such_key()
            || matches!(code, Some("NoSuchBucket" | "NoSuchKey" | "NotFound"))
        {
            return CacheError::NotFound;
        }
    }

    CacheError::download_error(&err)
}
