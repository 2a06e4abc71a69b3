use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{DeckcoreError, DeckcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Transient failures retried before a download gives up.
const MAX_RETRIES: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A body being downloaded.
pub struct Download {
    /// The body in chunks.
    pub stream: BoxStream<'static, DeckcoreResult<Bytes>>,

    /// The length announced by the server, if any.
    pub content_length: Option<u64>,
}

/// Fetches remote resources.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    /// Starts downloading `url`.
    async fn get(&self, url: &str) -> DeckcoreResult<Download>;
}

/// A [`DownloadClient`] over HTTP that retries transient errors with exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpDownloadClient {
    client: ClientWithMiddleware,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpDownloadClient {
    /// Creates a client with the default retry policy.
    pub fn new() -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Downloads `url` into `destination`, replacing any existing file.
///
/// A partially written file is removed if the transfer fails. Returns the number of bytes
/// written.
pub async fn download_to_file(
    client: &dyn DownloadClient,
    url: &str,
    destination: &Path,
) -> DeckcoreResult<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut download = client.get(url).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(destination)
        .await?;

    let mut written = 0u64;
    let result: DeckcoreResult<()> = async {
        while let Some(chunk) = download.stream.next().await {
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(destination).await;
        return Err(DeckcoreError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        });
    }

    if let Some(expected) = download.content_length {
        if expected != written {
            let _ = fs::remove_file(destination).await;
            return Err(DeckcoreError::Download {
                url: url.to_string(),
                reason: format!("expected {expected} bytes, received {written}"),
            });
        }
    }

    tracing::info!(%url, bytes = written, "download complete");
    Ok(written)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl DownloadClient for HttpDownloadClient {
    async fn get(&self, url: &str) -> DeckcoreResult<Download> {
        tracing::info!(%url, "downloading");

        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(DeckcoreError::from));

        Ok(Download {
            stream: stream.boxed(),
            content_length,
        })
    }
}

impl Default for HttpDownloadClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
