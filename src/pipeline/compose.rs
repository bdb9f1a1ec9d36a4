//! PDF composition: lay out a [`CapturedPage`] onto fixed-size pages.
//!
//! The built-in [`LopdfComposer`] writes a plain PDF 1.7 object graph with
//! `lopdf`: one shared resources dictionary with the two standard Helvetica
//! faces and any image XObjects, one FlateDecode content stream per page, and
//! an Info dictionary carrying the page title. No timestamps or random IDs
//! are written, so the same input always produces the same bytes.
//!
//! Layout is a greedy word wrap using approximate Helvetica advance widths.
//! Text is emitted in `WinAnsiEncoding`; characters outside it print as `?`.
//!
//! Loaded images are decoded with `image`, flattened to 8-bit RGB and drawn
//! at 96 dpi, scaled down to fit the text box. An image that is missing or
//! cannot be decoded prints its alternative text instead.

use crate::config::RenderOptions;
use crate::error::PageError;
use crate::pipeline::extract::{Block, CapturedPage};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::DynamicImage;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::borrow::Cow;
use std::io::Write;
use tracing::debug;

/// Turns captured page content into PDF bytes.
///
/// Implementations are shared across concurrent render tasks and called from
/// a blocking thread.
pub trait PageComposer: Send + Sync {
    /// # Errors
    /// [`PageError::ArtifactFailed`] when the document cannot be constructed.
    fn compose(&self, page: &CapturedPage, opts: &RenderOptions) -> Result<Vec<u8>, PageError>;
}

/// Default composer backed by `lopdf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfComposer;

impl PageComposer for LopdfComposer {
    fn compose(&self, page: &CapturedPage, opts: &RenderOptions) -> Result<Vec<u8>, PageError> {
        build_pdf(page, opts).map_err(|e| PageError::ArtifactFailed {
            detail: e.to_string(),
        })
    }
}

/// Content of the synthetic page used when nothing real could be captured.
pub fn placeholder_page(source_url: &str, reason: &str) -> CapturedPage {
    CapturedPage {
        title: Some("Webpage PDF".to_string()),
        blocks: vec![
            Block::Heading("Webpage PDF".to_string()),
            Block::Paragraph(format!("URL: {source_url}")),
            Block::Paragraph(
                "Note: Due to browser security restrictions, the webpage content could not be \
                 accessed directly. This is a placeholder PDF."
                    .to_string(),
            ),
            Block::Paragraph(format!("Error: {reason}")),
        ],
    }
}

#[derive(Debug, thiserror::Error)]
enum ComposeError {
    #[error("content stream encoding failed: {0}")]
    Content(#[from] lopdf::Error),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Layout ──────────────────────────────────────────────────────────────────

const BODY_SIZE: f32 = 11.0;
const HEADING_SIZE: f32 = 16.0;
const LEADING: f32 = 1.3;
/// Extra space after each block, as a fraction of its font size.
const BLOCK_GAP: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Face {
    Regular,
    Bold,
}

impl Face {
    fn resource_name(self) -> &'static str {
        match self {
            Face::Regular => "F1",
            Face::Bold => "F2",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlacedLine {
    face: Face,
    size: f32,
    x: f32,
    y: f32,
    text: String,
}

/// An image drawn with its lower-left corner at (`x`, `y`).
#[derive(Debug, Clone, PartialEq)]
struct PlacedImage {
    /// Index of the image's block, which also names its XObject.
    block: usize,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PageLayout {
    lines: Vec<PlacedLine>,
    images: Vec<PlacedImage>,
}

impl PageLayout {
    fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.images.is_empty()
    }
}

/// Decoded pixels of one image block.
struct Raster {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

/// Longest edge kept when decoding; larger images are downscaled.
const MAX_RASTER_EDGE: u32 = 2000;
/// CSS pixels to points.
const PX_TO_PT: f32 = 0.75;

/// Decode every loaded image, indexed by block.
fn decode_images(page: &CapturedPage) -> Vec<Option<Raster>> {
    page.blocks
        .iter()
        .map(|block| match block {
            Block::Image(img) => img.data.as_deref().and_then(|bytes| {
                image::load_from_memory(bytes)
                    .inspect_err(|e| debug!("Image {} not decodable: {}", img.src, e))
                    .ok()
                    .map(to_raster)
            }),
            _ => None,
        })
        .collect()
}

fn to_raster(img: DynamicImage) -> Raster {
    let img = if img.width() > MAX_RASTER_EDGE || img.height() > MAX_RASTER_EDGE {
        img.thumbnail(MAX_RASTER_EDGE, MAX_RASTER_EDGE)
    } else {
        img
    };
    let rgb = img.to_rgb8();
    Raster {
        width: rgb.width(),
        height: rgb.height(),
        rgb: rgb.into_raw(),
    }
}

/// Size in points of a `width`×`height` px image inside a `max_width`×`max_height` box.
fn fit(width: u32, height: u32, max_width: f32, max_height: f32) -> (f32, f32) {
    let w = width.max(1) as f32 * PX_TO_PT;
    let h = height.max(1) as f32 * PX_TO_PT;
    let scale = (max_width / w).min(max_height / h).min(1.0);
    (w * scale, h * scale)
}

fn image_caption(alt: &str) -> String {
    if alt.is_empty() {
        "[image]".to_string()
    } else {
        format!("[image: {alt}]")
    }
}

/// Place every block, returning one layout per PDF page. `rasters` holds the
/// decoded image of each block, if any.
fn layout(
    page: &CapturedPage,
    opts: &RenderOptions,
    rasters: &[Option<Raster>],
) -> Vec<PageLayout> {
    let (width, height) = opts.page_dimensions_pt();
    // Margins are capped at a quarter of the shorter side.
    let margin = opts
        .margin
        .to_points()
        .clamp(0.0, (width.min(height) / 4.0).max(0.0));
    let text_width = width - 2.0 * margin;
    let top = height - margin;

    let mut pages: Vec<PageLayout> = vec![PageLayout::default()];
    let mut cursor = top;

    for (index, block) in page.blocks.iter().enumerate() {
        let (face, size, text) = match block {
            Block::Heading(t) => (Face::Bold, HEADING_SIZE, Cow::Borrowed(t.as_str())),
            Block::Paragraph(t) => (Face::Regular, BODY_SIZE, Cow::Borrowed(t.as_str())),
            Block::Image(img) => match rasters.get(index).and_then(Option::as_ref) {
                Some(raster) => {
                    let (w, h) = fit(raster.width, raster.height, text_width, top - margin);
                    if cursor - h < margin && pages.last().is_some_and(|p| !p.is_empty()) {
                        pages.push(PageLayout::default());
                        cursor = top;
                    }
                    cursor -= h;
                    if let Some(current) = pages.last_mut() {
                        current.images.push(PlacedImage {
                            block: index,
                            x: margin,
                            y: cursor,
                            width: w,
                            height: h,
                        });
                    }
                    cursor -= BODY_SIZE * BLOCK_GAP;
                    continue;
                }
                None => (Face::Regular, BODY_SIZE, Cow::Owned(image_caption(&img.alt))),
            },
        };
        let line_height = size * LEADING;
        for text in wrap(&text, size, face, text_width) {
            if cursor - line_height < margin && pages.last().is_some_and(|p| !p.is_empty()) {
                pages.push(PageLayout::default());
                cursor = top;
            }
            cursor -= line_height;
            if let Some(current) = pages.last_mut() {
                current.lines.push(PlacedLine {
                    face,
                    size,
                    x: margin,
                    // Baseline sits a little above the bottom of the line box.
                    y: cursor + (line_height - size),
                    text,
                });
            }
        }
        cursor -= size * BLOCK_GAP;
    }
    pages
}

/// Greedy word wrap; words wider than a line are split by character.
fn wrap(text: &str, size: f32, face: Face, max_width: f32) -> Vec<String> {
    let space = char_width(' ', face) * size;
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0.0;

    for word in text.split_whitespace() {
        let word_width = text_width(word, size, face);
        if word_width > max_width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                current_width = 0.0;
            }
            for c in word.chars() {
                let w = char_width(c, face) * size;
                if current_width + w > max_width && !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                    current_width = 0.0;
                }
                current.push(c);
                current_width += w;
            }
            continue;
        }
        let needed = if current.is_empty() {
            word_width
        } else {
            current_width + space + word_width
        };
        if needed > max_width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_width = word_width;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_width = needed;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn text_width(text: &str, size: f32, face: Face) -> f32 {
    text.chars().map(|c| char_width(c, face)).sum::<f32>() * size
}

/// Approximate Helvetica advance width in em.
fn char_width(c: char, face: Face) -> f32 {
    let base = match c {
        ' ' | 'i' | 'j' | 'l' | '.' | ',' | '\'' | '|' | '!' | ':' | ';' | 'I' => 0.278,
        'f' | 't' | 'r' | '(' | ')' | '[' | ']' | '/' | '-' => 0.333,
        'm' | 'M' | 'W' => 0.833,
        'w' => 0.722,
        '0'..='9' => 0.556,
        c if c.is_ascii_uppercase() => 0.667,
        _ => 0.556,
    };
    match face {
        Face::Regular => base,
        Face::Bold => base * 1.05,
    }
}

/// Encode text for a `WinAnsiEncoding` font.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            ' '..='~' => c as u8,
            '\u{A0}'..='\u{FF}' => c as u32 as u8,
            '€' => 0x80,
            '…' => 0x85,
            '‘' => 0x91,
            '’' => 0x92,
            '“' => 0x93,
            '”' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '—' => 0x97,
            '™' => 0x99,
            _ => b'?',
        })
        .collect()
}

// ── PDF object graph ────────────────────────────────────────────────────────

fn build_pdf(page: &CapturedPage, opts: &RenderOptions) -> Result<Vec<u8>, ComposeError> {
    let (width, height) = opts.page_dimensions_pt();
    let rasters = decode_images(page);
    let mut document = Document::with_version("1.7");
    let pages_id = document.new_object_id();

    let regular = document.add_object(font_dict("Helvetica"));
    let bold = document.add_object(font_dict("Helvetica-Bold"));
    let mut resources = dictionary! {
        "Font" => dictionary! {
            "F1" => regular,
            "F2" => bold,
        },
    };

    let mut xobjects = Dictionary::new();
    for (index, raster) in rasters.iter().enumerate() {
        if let Some(raster) = raster {
            let image_id = document.add_object(image_stream(raster)?);
            xobjects.set(xobject_name(index), image_id);
        }
    }
    if !xobjects.is_empty() {
        resources.set("XObject", xobjects);
    }
    let resources_id = document.add_object(resources);

    let mut page_ids: Vec<ObjectId> = Vec::new();
    for placed in layout(page, opts, &rasters) {
        let content = Content {
            operations: page_operations(&placed),
        };
        let content_id = document.add_object(Stream::new(
            dictionary! { "Filter" => "FlateDecode" },
            deflate(&content.encode()?)?,
        ));
        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        page_ids.push(page_id);
    }

    let kids: Vec<Object> = page_ids.iter().map(|id| Object::from(*id)).collect();
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_ids.len() as i64,
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut info = dictionary! {
        "Producer" => Object::string_literal(concat!("webpdf-batch ", env!("CARGO_PKG_VERSION"))),
    };
    if let Some(title) = &page.title {
        info.set("Title", Object::string_literal(win_ansi(title)));
    }
    let info_id = document.add_object(info);
    document.trailer.set("Info", info_id);

    let mut bytes = Vec::new();
    document.save_to(&mut bytes)?;
    Ok(bytes)
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn xobject_name(block: usize) -> String {
    format!("Im{block}")
}

fn image_stream(raster: &Raster) -> Result<Stream, std::io::Error> {
    Ok(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => raster.width as i64,
            "Height" => raster.height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8i64,
            "Filter" => "FlateDecode",
        },
        deflate(&raster.rgb)?,
    ))
}

fn font_dict(base_font: &str) -> lopdf::Dictionary {
    dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
        "Encoding" => "WinAnsiEncoding",
    }
}

fn page_operations(placed: &PageLayout) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(placed.images.len() * 4 + placed.lines.len() * 5);
    for img in &placed.images {
        ops.push(Operation::new("q", vec![]));
        ops.push(Operation::new(
            "cm",
            vec![
                img.width.into(),
                Object::Integer(0),
                Object::Integer(0),
                img.height.into(),
                img.x.into(),
                img.y.into(),
            ],
        ));
        ops.push(Operation::new(
            "Do",
            vec![Object::Name(xobject_name(img.block).into_bytes())],
        ));
        ops.push(Operation::new("Q", vec![]));
    }
    for line in &placed.lines {
        ops.push(Operation::new("BT", vec![]));
        ops.push(Operation::new(
            "Tf",
            vec![line.face.resource_name().into(), line.size.into()],
        ));
        ops.push(Operation::new("Td", vec![line.x.into(), line.y.into()]));
        ops.push(Operation::new(
            "Tj",
            vec![Object::string_literal(win_ansi(&line.text))],
        ));
        ops.push(Operation::new("ET", vec![]));
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Orientation, PageSize};
    use crate::pipeline::extract::ImageBlock;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn with_image(data: Option<Vec<u8>>) -> CapturedPage {
        CapturedPage {
            title: None,
            blocks: vec![
                Block::Heading("Chart".into()),
                Block::Image(ImageBlock {
                    data,
                    ..ImageBlock::new("https://example.com/q1.png", "Q1 revenue")
                }),
            ],
        }
    }

    /// Image XObjects in `bytes` as (width, height).
    fn image_xobjects(bytes: &[u8]) -> Vec<(i64, i64)> {
        let doc = Document::load_mem(bytes).unwrap();
        doc.objects
            .values()
            .filter_map(|o| match o {
                Object::Stream(s)
                    if s.dict.get(b"Subtype").and_then(Object::as_name).ok()
                        == Some(b"Image".as_slice()) =>
                {
                    Some((
                        s.dict.get(b"Width").unwrap().as_i64().unwrap(),
                        s.dict.get(b"Height").unwrap().as_i64().unwrap(),
                    ))
                }
                _ => None,
            })
            .collect()
    }

    fn opts(size: PageSize, orientation: Orientation) -> RenderOptions {
        RenderOptions {
            page_size: size,
            orientation,
            ..RenderOptions::default()
        }
    }

    fn sample() -> CapturedPage {
        CapturedPage {
            title: Some("Sample".into()),
            blocks: vec![
                Block::Heading("Quarterly report".into()),
                Block::Paragraph("Revenue grew in every region.".into()),
            ],
        }
    }

    #[test]
    fn composes_a_loadable_pdf_with_requested_media_box() {
        let bytes = LopdfComposer
            .compose(&sample(), &opts(PageSize::Letter, Orientation::Landscape))
            .unwrap();
        assert!(bytes.starts_with(b"%PDF-1.7"));
        let doc = Document::load_mem(&bytes).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 1);
        let page_id = *pages.values().next().unwrap();
        let media_box = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o.as_float().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(media_box, vec![0.0, 0.0, 792.0, 612.0]);
    }

    #[test]
    fn output_is_deterministic() {
        let o = RenderOptions::default();
        let a = LopdfComposer.compose(&sample(), &o).unwrap();
        let b = LopdfComposer.compose(&sample(), &o).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_content_still_yields_one_page() {
        let bytes = LopdfComposer
            .compose(&CapturedPage::default(), &RenderOptions::default())
            .unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn long_content_paginates() {
        let paragraph = "lorem ipsum dolor sit amet ".repeat(40);
        let page = CapturedPage {
            title: None,
            blocks: (0..60).map(|_| Block::Paragraph(paragraph.clone())).collect(),
        };
        let pages = layout(&page, &RenderOptions::default(), &[]);
        assert!(pages.len() > 1);
        let margin = RenderOptions::default().margin.to_points();
        for line in pages.iter().flat_map(|p| &p.lines) {
            assert!(line.y >= margin - 0.01, "line below bottom margin: {}", line.y);
        }
    }

    #[test]
    fn wrap_respects_width_and_splits_long_words() {
        let lines = wrap("alpha beta gamma delta", BODY_SIZE, Face::Regular, 80.0);
        assert!(lines.len() > 1);
        for l in &lines {
            assert!(text_width(l, BODY_SIZE, Face::Regular) <= 80.0);
        }
        let long = "x".repeat(200);
        let lines = wrap(&long, BODY_SIZE, Face::Regular, 100.0);
        assert!(lines.len() > 1);
        assert_eq!(lines.concat(), long);
    }

    #[test]
    fn landscape_lines_are_wider() {
        let text = "word ".repeat(200);
        let page = CapturedPage {
            title: None,
            blocks: vec![Block::Paragraph(text)],
        };
        let portrait = layout(&page, &opts(PageSize::A4, Orientation::Portrait), &[]);
        let landscape = layout(&page, &opts(PageSize::A4, Orientation::Landscape), &[]);
        assert!(landscape[0].lines.len() < portrait[0].lines.len());
    }

    #[test]
    fn loaded_images_are_embedded_as_xobjects() {
        let bytes = LopdfComposer
            .compose(&with_image(Some(png(4, 3))), &RenderOptions::default())
            .unwrap();
        assert_eq!(image_xobjects(&bytes), vec![(4, 3)]);

        let page = with_image(Some(png(4, 3)));
        let pages = layout(&page, &RenderOptions::default(), &decode_images(&page));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].images.len(), 1);
        assert_eq!(pages[0].images[0].block, 1);
        assert!((pages[0].images[0].width - 3.0).abs() < 0.01);
        assert!(pages[0].lines.iter().all(|l| !l.text.contains("[image")));
    }

    #[test]
    fn missing_or_undecodable_images_print_their_alt_text() {
        for data in [None, Some(b"not an image".to_vec())] {
            let page = with_image(data);
            let rasters = decode_images(&page);
            let pages = layout(&page, &RenderOptions::default(), &rasters);
            assert!(pages[0].images.is_empty());
            assert_eq!(pages[0].lines[1].text, "[image: Q1 revenue]");

            let bytes = LopdfComposer.compose(&page, &RenderOptions::default()).unwrap();
            assert!(image_xobjects(&bytes).is_empty());
        }
    }

    #[test]
    fn large_images_shrink_to_the_text_box() {
        let (w, h) = fit(2000, 500, 400.0, 700.0);
        assert!((w - 400.0).abs() < 0.01);
        assert!((h - 100.0).abs() < 0.01);
        let (w, h) = fit(100, 4000, 400.0, 700.0);
        assert!((h - 700.0).abs() < 0.01);
        assert!(w < 400.0);
    }

    #[test]
    fn win_ansi_maps_common_punctuation() {
        assert_eq!(win_ansi("a€—é"), vec![b'a', 0x80, 0x97, 0xE9]);
        assert_eq!(win_ansi("漢"), vec![b'?']);
    }

    #[test]
    fn placeholder_documents_url_and_reason() {
        let page = placeholder_page("https://example.com", "Timeout loading webpage");
        let texts: Vec<&str> = page.blocks.iter().map(Block::text).collect();
        assert_eq!(texts[0], "Webpage PDF");
        assert_eq!(texts[1], "URL: https://example.com");
        assert!(texts[2].starts_with("Note: Due to browser security restrictions"));
        assert_eq!(texts[3], "Error: Timeout loading webpage");
        assert!(LopdfComposer
            .compose(&page, &RenderOptions::default())
            .is_ok());
    }
}
