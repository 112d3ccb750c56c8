//! Per-page artifacts: single-page PDF, rendered image, extracted layout.

pub mod figures;
mod layout;
mod pdf;

pub use layout::LayoutClient;
pub use pdf::PdfiumEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ServiceResult;

/// A page rasterized to PNG.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub png: Vec<u8>,
    pub pixels_per_inch: f32,
}

/// Axis-aligned box in inches from the page's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// A figure found by layout extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureRegion {
    pub id: String,
    /// Start of the figure's markup in `PageLayout::content`, in characters.
    pub offset: usize,
    /// Length of the figure's markup, in characters.
    pub length: usize,
    pub bounding_box: Option<BoundingBox>,
}

/// Markdown for one page plus the figures located within it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub content: String,
    pub figures: Vec<FigureRegion>,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Copy page `page_index` (0-based) of the PDF at `pdf_path` into a
    /// standalone single-page PDF.
    async fn extract_page(&self, pdf_path: &Path, page_index: u32) -> ServiceResult<Vec<u8>>;

    /// Rasterize the first page of a single-page PDF.
    async fn render_image(&self, page_pdf: &[u8]) -> ServiceResult<RenderedPage>;

    /// Structured text for a single-page PDF. May fail with a rate-limited error.
    async fn extract_layout(&self, page_pdf: &[u8]) -> ServiceResult<PageLayout>;
}

/// Production renderer: pdfium for splitting and rasterizing, the layout
/// service for text.
pub struct DocumentRenderer {
    engine: PdfiumEngine,
    layout: LayoutClient,
}

impl DocumentRenderer {
    pub fn new(engine: PdfiumEngine, layout: LayoutClient) -> Self {
        Self { engine, layout }
    }
}

#[async_trait]
impl PageRenderer for DocumentRenderer {
    async fn extract_page(&self, pdf_path: &Path, page_index: u32) -> ServiceResult<Vec<u8>> {
        self.engine.extract_page(pdf_path, page_index).await
    }

    async fn render_image(&self, page_pdf: &[u8]) -> ServiceResult<RenderedPage> {
        self.engine.render_image(page_pdf).await
    }

    async fn extract_layout(&self, page_pdf: &[u8]) -> ServiceResult<PageLayout> {
        self.layout.analyze(page_pdf).await
    }
}
