//! Figure cropping and caption splicing for multimodal uploads.

use image::ImageFormat;
use std::io::Cursor;

use super::{BoundingBox, FigureRegion};
use crate::error::RenderError;

/// Cut a figure out of a rendered page. Returns `None` when the box lies
/// entirely outside the image or has no area after clamping.
pub fn crop_figure(
    page_png: &[u8],
    bounding_box: &BoundingBox,
    pixels_per_inch: f32,
) -> Result<Option<Vec<u8>>, RenderError> {
    let page = image::load_from_memory(page_png).map_err(RenderError::Image)?;
    let (width, height) = (page.width(), page.height());

    // Round outward so the crop never trims the figure's edge
    let left = ((bounding_box.left * pixels_per_inch).floor().max(0.0) as u32).min(width);
    let top = ((bounding_box.top * pixels_per_inch).floor().max(0.0) as u32).min(height);
    let right = ((bounding_box.right * pixels_per_inch).ceil().max(0.0) as u32).min(width);
    let bottom = ((bounding_box.bottom * pixels_per_inch).ceil().max(0.0) as u32).min(height);

    if right <= left || bottom <= top {
        return Ok(None);
    }

    let cropped = page.crop_imm(left, top, right - left, bottom - top);
    let mut png = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(RenderError::Image)?;
    Ok(Some(png))
}

/// Insert `<figcaption>` elements into page markdown.
///
/// A caption goes just before the figure's closing `</figure>` tag when the
/// span contains one, otherwise right after the span. Figures are applied
/// from the highest offset down so the character offsets of the remaining
/// figures stay valid. Figures whose offset lies past the end are skipped.
pub fn splice_captions(content: &str, captions: &[(FigureRegion, String)]) -> String {
    let mut ordered: Vec<&(FigureRegion, String)> = captions.iter().collect();
    ordered.sort_by(|a, b| b.0.offset.cmp(&a.0.offset));

    let mut spliced = content.to_string();
    for (figure, caption) in ordered {
        let Some(start) = byte_index(&spliced, figure.offset) else {
            continue;
        };
        let end = byte_index(&spliced, figure.offset + figure.length).unwrap_or(spliced.len());

        match spliced[start..end].rfind("</figure>") {
            Some(pos) => spliced.insert_str(
                start + pos,
                &format!("<figcaption>{}</figcaption>\n", caption.trim()),
            ),
            None => spliced.insert_str(
                end,
                &format!("\n<figcaption>{}</figcaption>", caption.trim()),
            ),
        }
    }
    spliced
}

/// Byte index of the `char_offset`-th character; the end of the string is a
/// valid position.
fn byte_index(text: &str, char_offset: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn figure(offset: usize, length: usize) -> FigureRegion {
        FigureRegion {
            id: format!("f{offset}"),
            offset,
            length,
            bounding_box: None,
        }
    }

    fn blank_png(width: u32, height: u32) -> Vec<u8> {
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(width, height))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn test_caption_inserted_before_closing_tag() {
        let content = "Intro\n<figure>\nchart\n</figure>\nOutro";
        let fig = figure(6, "<figure>\nchart\n</figure>".chars().count());

        let out = splice_captions(content, &[(fig, " Revenue by quarter ".to_string())]);
        assert_eq!(
            out,
            "Intro\n<figure>\nchart\n<figcaption>Revenue by quarter</figcaption>\n</figure>\nOutro"
        );
    }

    #[test]
    fn test_caption_appended_when_span_has_no_tag() {
        let content = "ab[img]cd";
        let out = splice_captions(content, &[(figure(2, 5), "pic".to_string())]);
        assert_eq!(out, "ab[img]\n<figcaption>pic</figcaption>cd");
    }

    #[test]
    fn test_multiple_figures_keep_offsets_valid() {
        // Offsets count characters, not bytes
        let content = "é<figure>A</figure>ü<figure>B</figure>";
        let first = figure(1, 18);
        let second = figure(20, 18);

        let out = splice_captions(
            content,
            &[(first, "one".to_string()), (second, "two".to_string())],
        );
        assert_eq!(
            out,
            "é<figure>A<figcaption>one</figcaption>\n</figure>ü<figure>B<figcaption>two</figcaption>\n</figure>"
        );
    }

    #[test]
    fn test_out_of_range_figure_skipped() {
        let out = splice_captions("short", &[(figure(50, 3), "x".to_string())]);
        assert_eq!(out, "short");
    }

    #[test]
    fn test_crop_clamps_to_page() {
        // 2in x 1in at 100 ppi
        let page = blank_png(200, 100);

        let inside = BoundingBox {
            left: 0.5,
            top: 0.25,
            right: 1.5,
            bottom: 0.75,
        };
        let png = crop_figure(&page, &inside, 100.0).unwrap().unwrap();
        let cropped = image::load_from_memory(&png).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (100, 50));

        let overhanging = BoundingBox {
            left: 1.5,
            top: 0.5,
            right: 3.0,
            bottom: 2.0,
        };
        let png = crop_figure(&page, &overhanging, 100.0).unwrap().unwrap();
        let cropped = image::load_from_memory(&png).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (50, 50));

        let outside = BoundingBox {
            left: 3.0,
            top: 0.0,
            right: 4.0,
            bottom: 1.0,
        };
        assert!(crop_figure(&page, &outside, 100.0).unwrap().is_none());
    }
}
