//! Split one uploaded PDF into per-page artifacts and publish them.
//!
//! Every write is an overwrite and the landing-zone delete tolerates a
//! missing object, so running the same upload twice leaves the stores in
//! the same state as running it once.

use bytes::Bytes;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::captioning::FigureCaptioner;
use crate::error::{ServiceError, ServiceResult, StorageError, format_error_chain};
use crate::messages::{ArtifactKind, UploadMessage, page_object_key, validate_upload_filename};
use crate::render::figures::{crop_figure, splice_captions};
use crate::render::{PageLayout, PageRenderer, RenderedPage};
use crate::retry::{BackoffPolicy, with_backoff};
use crate::storage::{ObjectLocation, ObjectStore};

/// What one successful pass produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub pages: u32,
    pub objects_written: usize,
    pub figures_captioned: usize,
    /// The landing-zone copy was already gone and every page artifact existed.
    pub already_processed: bool,
}

pub struct PageProcessor {
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn PageRenderer>,
    captioner: Option<Arc<dyn FigureCaptioner>>,
    backoff: BackoffPolicy,
    scratch_dir: PathBuf,
}

impl PageProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn PageRenderer>,
        backoff: BackoffPolicy,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            renderer,
            captioner: None,
            backoff,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Enable figure captioning for multimodal uploads.
    pub fn with_captioner(mut self, captioner: Arc<dyn FigureCaptioner>) -> Self {
        self.captioner = Some(captioner);
        self
    }

    /// Process every page of `upload`, then delete its landing-zone copy.
    ///
    /// Any page failure aborts the document; artifacts already written stay
    /// and are overwritten on the next attempt.
    pub async fn process(&self, upload: &UploadMessage) -> ServiceResult<ProcessingSummary> {
        validate_upload_filename(&upload.filename)?;
        let location = ObjectLocation::parse(&upload.blob_url)?;

        let source = match self.store.get(&location.container, &location.key).await {
            Ok(source) => source,
            Err(ServiceError::Storage(StorageError::NotFound { container, key })) => {
                // A previous attempt may have finished everything but the queue delete
                if self.all_artifacts_exist(upload).await? {
                    info!(
                        filename = %upload.filename,
                        "Landing-zone copy already removed and all pages present, nothing to do"
                    );
                    return Ok(ProcessingSummary {
                        pages: upload.num_pages,
                        already_processed: true,
                        ..ProcessingSummary::default()
                    });
                }
                return Err(StorageError::NotFound { container, key }.into());
            }
            Err(e) => return Err(e),
        };

        // Removed on drop, whichever way this function exits
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| scratch_error(&self.scratch_dir, e))?;
        let work_dir = tempfile::Builder::new()
            .prefix("folio-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| scratch_error(&self.scratch_dir, e))?;
        let source_path = work_dir.path().join("source.pdf");
        tokio::fs::write(&source_path, &source)
            .await
            .map_err(|e| scratch_error(&source_path, e))?;

        let mut summary = ProcessingSummary {
            pages: upload.num_pages,
            ..ProcessingSummary::default()
        };
        for page_index in 0..upload.num_pages {
            let captioned = self.process_page(upload, &source_path, page_index).await?;
            summary.objects_written += 3;
            summary.figures_captioned += captioned;
            counter!("folio_pages_processed_total").increment(1);
        }

        self.store
            .delete(&upload.lz_container, &upload.filename)
            .await?;
        debug!(
            container = %upload.lz_container,
            filename = %upload.filename,
            "Deleted landing-zone copy"
        );

        Ok(summary)
    }

    /// Returns the number of figures captioned on this page.
    async fn process_page(
        &self,
        upload: &UploadMessage,
        source_path: &Path,
        page_index: u32,
    ) -> ServiceResult<usize> {
        let page = page_index + 1;
        let renderer = &self.renderer;

        let page_pdf = renderer.extract_page(source_path, page_index).await?;
        let rendered = renderer.render_image(&page_pdf).await?;

        let page_bytes = page_pdf.as_slice();
        let layout = with_backoff(&self.backoff, "layout extraction", move || {
            renderer.extract_layout(page_bytes)
        })
        .await?;

        let (markdown, captioned) = match &self.captioner {
            Some(captioner) if upload.is_multimodal && !layout.figures.is_empty() => {
                self.caption_figures(captioner.as_ref(), &layout, &rendered, &upload.filename, page)
                    .await
            }
            None if upload.is_multimodal && !layout.figures.is_empty() => {
                warn!(
                    filename = %upload.filename,
                    page,
                    figures = layout.figures.len(),
                    "Multimodal upload but no captioner configured, figures left uncaptioned"
                );
                (layout.content, 0)
            }
            _ => (layout.content, 0),
        };

        let key = |kind| page_object_key(&upload.filename, page_index, kind);
        self.store
            .put(
                &upload.reference_container,
                &key(ArtifactKind::Pdf),
                Bytes::from(page_pdf),
            )
            .await?;
        self.store
            .put(
                &upload.reference_container,
                &key(ArtifactKind::Png),
                Bytes::from(rendered.png),
            )
            .await?;
        self.store
            .put(
                &upload.ingestion_container,
                &key(ArtifactKind::Markdown),
                Bytes::from(markdown),
            )
            .await?;

        debug!(filename = %upload.filename, page, "Uploaded page artifacts");
        Ok(captioned)
    }

    /// Caption what can be captioned; a figure that fails is left as is.
    async fn caption_figures(
        &self,
        captioner: &dyn FigureCaptioner,
        layout: &PageLayout,
        rendered: &RenderedPage,
        filename: &str,
        page: u32,
    ) -> (String, usize) {
        let mut captions = Vec::new();

        for figure in &layout.figures {
            let Some(bounding_box) = &figure.bounding_box else {
                continue;
            };

            let crop = match crop_figure(&rendered.png, bounding_box, rendered.pixels_per_inch) {
                Ok(Some(crop)) => crop,
                Ok(None) => continue,
                Err(e) => {
                    warn!(filename = %filename, page, figure = %figure.id, error = %e, "Failed to crop figure");
                    continue;
                }
            };

            let crop = crop.as_slice();
            match with_backoff(&self.backoff, "figure captioning", move || {
                captioner.caption(crop)
            })
            .await
            {
                Ok(caption) => captions.push((figure.clone(), caption)),
                Err(e) => warn!(
                    filename = %filename,
                    page,
                    figure = %figure.id,
                    error = %format_error_chain(&e),
                    "Failed to caption figure"
                ),
            }
        }

        let captioned = captions.len();
        (splice_captions(&layout.content, &captions), captioned)
    }

    async fn all_artifacts_exist(&self, upload: &UploadMessage) -> ServiceResult<bool> {
        for page_index in 0..upload.num_pages {
            let expected = [
                (&upload.reference_container, ArtifactKind::Pdf),
                (&upload.reference_container, ArtifactKind::Png),
                (&upload.ingestion_container, ArtifactKind::Markdown),
            ];
            for (container, kind) in expected {
                let key = page_object_key(&upload.filename, page_index, kind);
                if !self.store.exists(container, &key).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn scratch_error(path: &Path, source: std::io::Error) -> ServiceError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}
