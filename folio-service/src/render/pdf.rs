//! PDF splitting and rasterization with pdfium-render.
//!
//! Pdfium calls are blocking and the document handles are not `Send`, so
//! each operation binds the library, does its work and drops everything
//! inside one `spawn_blocking` task.

use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::RenderedPage;
use crate::error::{RenderError, ServiceResult};

const POINTS_PER_INCH: f32 = 72.0;

#[derive(Debug, Clone)]
pub struct PdfiumEngine {
    library_dir: Option<PathBuf>,
    dpi: u32,
}

impl PdfiumEngine {
    pub fn new(library_dir: Option<PathBuf>, dpi: u32) -> Self {
        Self { library_dir, dpi }
    }

    /// Bind the library once so a missing libpdfium fails at startup.
    pub fn check(&self) -> ServiceResult<()> {
        create_pdfium(self.library_dir.as_deref())?;
        Ok(())
    }

    pub async fn extract_page(&self, pdf_path: &Path, page_index: u32) -> ServiceResult<Vec<u8>> {
        let library_dir = self.library_dir.clone();
        let pdf_path = pdf_path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            extract_page_blocking(library_dir.as_deref(), &pdf_path, page_index)
        })
        .await
        .map_err(RenderError::Task)?
    }

    pub async fn render_image(&self, page_pdf: &[u8]) -> ServiceResult<RenderedPage> {
        let library_dir = self.library_dir.clone();
        let page_pdf = page_pdf.to_vec();
        let dpi = self.dpi;

        tokio::task::spawn_blocking(move || {
            render_page_blocking(library_dir.as_deref(), &page_pdf, dpi)
        })
        .await
        .map_err(RenderError::Task)?
    }
}

/// Bind libpdfium, trying in order: the configured directory (or library
/// file), `./`, `./vendor/pdfium/lib/`, then the system library path.
fn create_pdfium(library_dir: Option<&Path>) -> Result<Pdfium, RenderError> {
    if let Some(path) = library_dir {
        let bound = if path.is_dir() {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        } else {
            Pdfium::bind_to_library(path)
        };
        match bound {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => debug!(path = %path.display(), error = ?e, "Configured PDFium path failed"),
        }
    }

    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| RenderError::Library {
            message: format!(
                "Failed to load PDFium library. Set rendering.pdfium_library_dir or install libpdfium: {:?}",
                e
            ),
        })?;

    Ok(Pdfium::new(bindings))
}

fn pdf_error(page: u32) -> impl Fn(PdfiumError) -> RenderError {
    move |e| RenderError::Pdf {
        page,
        message: format!("{:?}", e),
    }
}

fn extract_page_blocking(
    library_dir: Option<&Path>,
    pdf_path: &Path,
    page_index: u32,
) -> ServiceResult<Vec<u8>> {
    let page_number = page_index + 1;
    let pdfium = create_pdfium(library_dir)?;

    let source = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(pdf_error(page_number))?;

    let page_count = u32::from(source.pages().len());
    if page_index >= page_count {
        return Err(RenderError::PageOutOfRange {
            page: page_number,
            page_count,
        }
        .into());
    }

    let mut single = pdfium.create_new_pdf().map_err(pdf_error(page_number))?;
    single
        .pages_mut()
        .copy_page_from_document(&source, page_index as PdfPageIndex, 0)
        .map_err(pdf_error(page_number))?;

    let bytes = single.save_to_bytes().map_err(pdf_error(page_number))?;
    debug!(page = page_number, bytes = bytes.len(), "Extracted single-page PDF");
    Ok(bytes)
}

fn render_page_blocking(
    library_dir: Option<&Path>,
    page_pdf: &[u8],
    dpi: u32,
) -> ServiceResult<RenderedPage> {
    let pdfium = create_pdfium(library_dir)?;
    let document = pdfium
        .load_pdf_from_byte_slice(page_pdf, None)
        .map_err(pdf_error(1))?;
    let page = document.pages().get(0).map_err(pdf_error(1))?;

    let pixels_per_point = dpi as f32 / POINTS_PER_INCH;
    let width = (page.width().value * pixels_per_point).ceil() as i32;
    let height = (page.height().value * pixels_per_point).ceil() as i32;

    let config = PdfRenderConfig::new()
        .set_target_width(width.max(1))
        .set_target_height(height.max(1));
    let bitmap = page.render_with_config(&config).map_err(pdf_error(1))?;
    let image: DynamicImage = bitmap.as_image();

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(RenderError::Image)?;

    debug!(width, height, dpi, bytes = png.len(), "Rendered page image");
    Ok(RenderedPage {
        png,
        pixels_per_inch: dpi as f32,
    })
}
