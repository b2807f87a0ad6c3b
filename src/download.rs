//! Image fetching and decoding.
//!
//! Every failure here is classified as a [`FailureReason`] and handed back to
//! the caller; nothing in this module aborts a batch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use image::RgbImage;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::ImageSettings;
use crate::models::FailureReason;

/// A downloaded image, converted to 8-bit RGB.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }
}

impl From<RgbImage> for DecodedImage {
    fn from(pixels: RgbImage) -> Self {
        Self { pixels }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("body exceeds {0} bytes")]
    TooLarge(u64),
    #[error("body read failed: {0}")]
    Read(#[from] reqwest::Error),
}

/// Read a response body, giving up once it grows past `max_bytes`.
pub async fn read_body_capped(
    mut response: reqwest::Response,
    max_bytes: u64,
) -> Result<Vec<u8>, BodyError> {
    if response.content_length().is_some_and(|len| len > max_bytes) {
        return Err(BodyError::TooLarge(max_bytes));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if (body.len() + chunk.len()) as u64 > max_bytes {
            return Err(BodyError::TooLarge(max_bytes));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub struct ImageFetcher {
    client: reqwest::Client,
    min_pixel_area: u64,
    max_bytes: u64,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(settings: &ImageSettings, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            min_pixel_area: settings.min_pixel_area,
            max_bytes: settings.max_bytes,
            timeout: settings.timeout(),
        })
    }

    /// Download `url` once and decode it. No retries.
    pub async fn fetch(&self, url: &str) -> Result<DecodedImage, FailureReason> {
        debug!(url, "downloading image");

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(url, error = %e, "image download error");
                FailureReason::DownloadFailed
            })?;

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "image download rejected");
            return Err(FailureReason::DownloadFailed);
        }

        let bytes = read_body_capped(response, self.max_bytes)
            .await
            .map_err(|e| {
                warn!(url, error = %e, "image body read failed");
                FailureReason::DownloadFailed
            })?;

        let min_pixel_area = self.min_pixel_area;
        let image = tokio::task::spawn_blocking(move || decode_image(&bytes, min_pixel_area))
            .await
            .map_err(|e| {
                warn!(url, error = %e, "decode task failed");
                FailureReason::DecodeError
            })??;

        info!(url, width = image.width(), height = image.height(), "image downloaded");
        Ok(image)
    }
}

/// Decode `bytes`, reject images under `min_pixel_area` and normalize to RGB.
pub fn decode_image(bytes: &[u8], min_pixel_area: u64) -> Result<DecodedImage, FailureReason> {
    let img = image::load_from_memory(bytes).map_err(|e| {
        warn!(error = %e, "image decode error");
        FailureReason::DecodeError
    })?;

    let (width, height) = (img.width(), img.height());
    if u64::from(width) * u64::from(height) < min_pixel_area {
        warn!(width, height, min_pixel_area, "image too small");
        return Err(FailureReason::TooSmall);
    }

    Ok(DecodedImage::from(img.into_rgb8()))
}

/// Loads images from one directory tree for single-file captioning.
///
/// Every rejection (outside the root, missing, not a regular file, too large)
/// is reported as [`FailureReason::ReadFailed`].
#[derive(Debug, Clone)]
pub struct LocalImageLoader {
    root: PathBuf,
    max_bytes: u64,
}

impl LocalImageLoader {
    /// `root` must exist; it is canonicalized once here.
    pub fn new(root: impl AsRef<Path>, max_bytes: u64) -> std::io::Result<Self> {
        Ok(Self {
            root: std::fs::canonicalize(root)?,
            max_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load `path`, which may be absolute or relative to the root.
    pub async fn load(&self, path: &Path) -> Result<DecodedImage, FailureReason> {
        let bytes = self.read(path).await?;
        tokio::task::spawn_blocking(move || decode_image(&bytes, 0))
            .await
            .map_err(|_| FailureReason::DecodeError)?
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, FailureReason> {
        let rejected = |why: &str| {
            warn!(path = %path.display(), why, "image file rejected");
            FailureReason::ReadFailed
        };

        let candidate = self.root.join(path);
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| rejected("unresolvable"))?;
        if !resolved.starts_with(&self.root) {
            return Err(rejected("outside local root"));
        }

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| rejected("no metadata"))?;
        if !metadata.is_file() {
            return Err(rejected("not a regular file"));
        }
        if metadata.len() > self.max_bytes {
            return Err(rejected("file too large"));
        }

        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|_| rejected("open failed"))?;
        let mut bytes = Vec::new();
        file.take(self.max_bytes + 1)
            .read_to_end(&mut bytes)
            .await
            .map_err(|_| rejected("read failed"))?;
        // The file may have grown since the metadata check.
        if bytes.len() as u64 > self.max_bytes {
            return Err(rejected("file too large"));
        }
        Ok(bytes)
    }
}
