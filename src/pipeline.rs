//! Scrape → download → caption → aggregate.
//!
//! A run either produces a complete [`PipelineSummary`] or fails with a single
//! [`PipelineError`]. Per-image problems never escape the loop; they become
//! [`FailureRecord`]s.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::caption::CaptionOracle;
use crate::download::{DecodedImage, ImageFetcher, LocalImageLoader};
use crate::extract::{ExtractionError, PageFetcher};
use crate::models::{
    CaptionRecord, FailureReason, FailureRecord, FileBatchSummary, FileCaptionRecord,
    ImageDescriptor, PipelineSummary, Scope,
};

const DEFAULT_CAPTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("pipeline run cancelled")]
    Cancelled,
    #[error("local image captioning is not enabled")]
    LocalFilesDisabled,
}

/// Shared flag a caller can trip to stop a running batch between images.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Pipeline {
    pages: PageFetcher,
    images: ImageFetcher,
    oracle: Arc<dyn CaptionOracle>,
    local_images: Option<LocalImageLoader>,
    caption_timeout: Duration,
    default_prompt: Option<String>,
}

impl Pipeline {
    pub fn new(pages: PageFetcher, images: ImageFetcher, oracle: Arc<dyn CaptionOracle>) -> Self {
        Self {
            pages,
            images,
            oracle,
            local_images: None,
            caption_timeout: DEFAULT_CAPTION_TIMEOUT,
            default_prompt: None,
        }
    }

    pub fn with_caption_timeout(mut self, timeout: Duration) -> Self {
        self.caption_timeout = timeout;
        self
    }

    /// Enables local-file captioning, confined to the loader's root.
    pub fn with_local_images(mut self, loader: Option<LocalImageLoader>) -> Self {
        self.local_images = loader;
        self
    }

    /// Prompt used for batches that don't bring their own.
    pub fn with_default_prompt(mut self, prompt: Option<String>) -> Self {
        self.default_prompt = prompt;
        self
    }

    /// Caption every image found at `source_url`.
    ///
    /// Images are handled one at a time in sequence-index order. `max_images`
    /// keeps only the first N descriptors; `Some(0)` is treated as no cap.
    pub async fn process(
        &self,
        source_url: &str,
        prompt: Option<&str>,
        max_images: Option<usize>,
        scope: Scope,
        cancel: &CancelToken,
    ) -> Result<PipelineSummary, PipelineError> {
        info!(url = source_url, ?scope, "processing URL");
        let prompt = self.resolve_prompt(prompt);

        let page_title = self.pages.page_title(source_url).await;

        let mut descriptors = self.pages.scrape_images(source_url, scope).await?;
        info!(found = descriptors.len(), "images found");

        if let Some(cap) = max_images.filter(|&n| n > 0) {
            descriptors.truncate(cap);
        }
        let total = descriptors.len();

        let mut results = Vec::new();
        let mut errors = Vec::new();

        for (position, descriptor) in descriptors.into_iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    completed = position,
                    total, "run cancelled, discarding partial results"
                );
                return Err(PipelineError::Cancelled);
            }

            info!(
                "Processing image {}/{} (index {})",
                position + 1,
                total,
                descriptor.sequence_index
            );

            match self.process_descriptor(descriptor, prompt, scope).await {
                Ok(record) => results.push(record),
                Err(failure) => errors.push(failure),
            }
        }

        info!(
            processed = results.len(),
            failed = errors.len(),
            total,
            "pipeline complete"
        );

        Ok(PipelineSummary {
            source_url: source_url.to_string(),
            page_title,
            total_images_found: total,
            images_processed: results.len(),
            images_failed: errors.len(),
            results,
            errors,
        })
    }

    /// Caption one local image. The outer error is fatal; the inner one uses
    /// the same record shape as URL batches, with the path in place of the
    /// image URL.
    pub async fn process_image_file(
        &self,
        path: &Path,
        prompt: Option<&str>,
    ) -> Result<Result<FileCaptionRecord, FailureRecord>, PipelineError> {
        let loader = self.local_images()?;
        let prompt = self.resolve_prompt(prompt);
        Ok(self.caption_file(loader, path, prompt, 1).await)
    }

    /// Caption local images in input order.
    pub async fn process_image_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
        prompt: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<FileBatchSummary, PipelineError> {
        let loader = self.local_images()?;
        let prompt = self.resolve_prompt(prompt);
        info!(count = paths.len(), "processing local images");

        let mut results = Vec::new();
        let mut errors = Vec::new();

        for (idx, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.caption_file(loader, path.as_ref(), prompt, idx + 1).await {
                Ok(record) => results.push(record),
                Err(failure) => errors.push(failure),
            }
        }

        Ok(FileBatchSummary { results, errors })
    }

    async fn process_descriptor(
        &self,
        descriptor: ImageDescriptor,
        prompt: Option<&str>,
        scope: Scope,
    ) -> Result<CaptionRecord, FailureRecord> {
        let index = descriptor.sequence_index;
        let fail = |reason: FailureReason| {
            warn!(index, url = %descriptor.url, %reason, "image skipped");
            FailureRecord {
                sequence_index: index,
                image_url: descriptor.url.clone(),
                error_reason: reason,
            }
        };

        let image = self.images.fetch(&descriptor.url).await.map_err(fail)?;
        let caption = self.caption_image(&image, prompt).await.map_err(fail)?;
        info!(index, caption = %caption, "image captioned");

        let nearby_caption = match scope {
            Scope::Article => Some(descriptor.nearby_caption.clone()),
            Scope::Page => None,
        };

        Ok(CaptionRecord {
            image_url: descriptor.url,
            caption,
            alt_text: descriptor.alt_text,
            title: descriptor.title,
            width: image.width(),
            height: image.height(),
            sequence_index: index,
            nearby_caption,
        })
    }

    fn local_images(&self) -> Result<&LocalImageLoader, PipelineError> {
        self.local_images.as_ref().ok_or_else(|| {
            warn!("local image request refused, no local root configured");
            PipelineError::LocalFilesDisabled
        })
    }

    async fn caption_file(
        &self,
        loader: &LocalImageLoader,
        path: &Path,
        prompt: Option<&str>,
        index: usize,
    ) -> Result<FileCaptionRecord, FailureRecord> {
        let shown = path.display().to_string();
        let fail = |reason: FailureReason| {
            warn!(index, path = %shown, %reason, "local image skipped");
            FailureRecord {
                sequence_index: index,
                image_url: shown.clone(),
                error_reason: reason,
            }
        };

        let image = loader.load(path).await.map_err(fail)?;
        let caption = self.caption_image(&image, prompt).await.map_err(fail)?;

        Ok(FileCaptionRecord {
            image_path: shown,
            prompt: prompt.map(str::to_string),
            caption,
            width: image.width(),
            height: image.height(),
            sequence_index: index,
        })
    }

    async fn caption_image(
        &self,
        image: &DecodedImage,
        prompt: Option<&str>,
    ) -> Result<String, FailureReason> {
        match tokio::time::timeout(self.caption_timeout, self.oracle.caption(image, prompt)).await {
            Ok(Ok(caption)) => Ok(caption),
            Ok(Err(e)) => {
                warn!(error = %e, "captioning failed");
                Err(FailureReason::CaptioningError)
            }
            Err(_) => {
                warn!(timeout = ?self.caption_timeout, "captioning timed out");
                Err(FailureReason::CaptioningError)
            }
        }
    }

    fn resolve_prompt<'a>(&'a self, prompt: Option<&'a str>) -> Option<&'a str> {
        prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .or(self.default_prompt.as_deref())
    }
}
