use mkvm_fs::{self as fs, FsError};
use crate::paths::Paths;
use mkvm_http::{Download, HttpClient, HttpError};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("checksum {checksum:?} can't be used as a cache key")]
    InvalidKey { checksum: String },

    #[error(transparent)]
    Fs(#[from] FsError),

    /// `source` already names the url.
    #[error("can't fetch base image: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: HttpError,
    },
}

/// A base image sitting in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub checksum: String,
    pub path: PathBuf,
}

/// Downloaded base images, keyed by checksum.
///
/// Entries are never evicted or rewritten. Concurrent runs fetching the same
/// checksum are not coordinated.
#[derive(Debug, Clone)]
pub struct ImageCache {
    paths: Paths,
    http: HttpClient,
    verify: bool,
}

impl ImageCache {
    pub fn new(paths: Paths, http: HttpClient) -> Self {
        Self {
            paths,
            http,
            verify: false,
        }
    }

    /// Check downloads against their sha256 before publishing them.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn path_for(&self, checksum: &str) -> Result<PathBuf, CacheError> {
        let valid = !checksum.is_empty()
            && checksum != "."
            && checksum != ".."
            && !checksum.contains(['/', '\\', '\0']);
        if !valid {
            return Err(CacheError::InvalidKey {
                checksum: checksum.to_owned(),
            });
        }
        Ok(self.paths.image_file(checksum))
    }

    /// Return the cached image for `checksum`, downloading it from `url` first
    /// if it isn't cached yet.
    #[instrument(skip(self))]
    pub async fn ensure(&self, checksum: &str, url: &str) -> Result<CachedImage, CacheError> {
        let path = self.path_for(checksum)?;

        if fs::path_exists(&path).await? {
            info!("using cached image {}", path.display());
            return Ok(CachedImage {
                checksum: checksum.to_owned(),
                path,
            });
        }

        fs::setup_directory_access(self.paths.images_dir()).await?;

        info!("downloading distro image {url} to {}", path.display());

        let expected = self.verify.then_some(checksum);
        let download = self
            .http
            .download_file(url, &path, expected)
            .await
            .map_err(|source| CacheError::DownloadFailed {
                url: url.to_owned(),
                source,
            })?;

        if let Download::Fetched { bytes } = download {
            info!("downloaded {bytes} bytes");
        }

        Ok(CachedImage {
            checksum: checksum.to_owned(),
            path,
        })
    }
}
