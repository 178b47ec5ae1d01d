use mkvm_fs::{self as fs, FsError};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Failed to build HTTP client: {0}")]
    BuildClient(#[source] reqwest::Error),

    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} replied {status}")]
    Status { url: String, status: StatusCode },

    #[error("HTTP stream from {url} failed: {source}")]
    Stream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("File write error for '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("sha256 mismatch for {url}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Download {
    /// The destination already existed; nothing was fetched.
    Cached,
    Fetched { bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let client = Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(HttpError::BuildClient)?;
        Ok(HttpClient { client })
    }

    /// Stream `url` into `file_path`.
    ///
    /// Bytes land in a sibling `.part` file which is renamed into place only
    /// after the whole body arrived (and, when `expected_sha256` is given,
    /// matched). `file_path` therefore either doesn't exist or is complete.
    pub async fn download_file<P: AsRef<Path>>(
        &self,
        url: &str,
        file_path: P,
        expected_sha256: Option<&str>,
    ) -> Result<Download, HttpError> {
        let file_path = file_path.as_ref();

        if fs::path_exists(file_path).await? {
            return Ok(Download::Cached);
        }

        let temp_file = partial_path(file_path);

        if fs::path_exists(&temp_file).await? {
            debug!("removing stale partial download {}", temp_file.display());
            fs::remove_file(&temp_file).await?;
        }

        debug!("fetching {url} into {}", temp_file.display());

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| HttpError::Request {
                url: url.to_owned(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(HttpError::Status {
                url: url.to_owned(),
                status: resp.status(),
            });
        }

        let mut file = fs::create_file(&temp_file).await?;
        let mut hasher = Sha256::new();
        let mut bytes_written: u64 = 0;

        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|source| HttpError::Stream {
                url: url.to_owned(),
                source,
            })?;
            hasher.update(&bytes);
            file.write_all(&bytes)
                .await
                .map_err(|source| HttpError::Write {
                    path: temp_file.clone(),
                    source,
                })?;
            bytes_written += bytes.len() as u64;
        }

        // Ensure all data is flushed before renaming
        file.flush().await.map_err(|source| HttpError::Write {
            path: temp_file.clone(),
            source,
        })?;
        drop(file);

        if let Some(expected) = expected_sha256 {
            let actual = hex::encode(hasher.finalize());
            if !expected.eq_ignore_ascii_case(&actual) {
                fs::remove_file(&temp_file).await?;
                return Err(HttpError::ChecksumMismatch {
                    url: url.to_owned(),
                    expected: expected.to_owned(),
                    actual,
                });
            }
            debug!("sha256 verified: {actual}");
        }

        fs::rename_file(&temp_file, file_path).await?;

        Ok(Download::Fetched {
            bytes: bytes_written,
        })
    }
}

fn partial_path(file_path: &Path) -> PathBuf {
    let mut name: OsString = file_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
