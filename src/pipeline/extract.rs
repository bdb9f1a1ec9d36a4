//! Text extraction: reduce an HTML document to the blocks a PDF page shows.
//!
//! Capture works on the document's readable text, not on pixels. Two
//! `lol_html` passes do the structural work:
//!
//! 1. **Strip** — drop non-rendered subtrees (`script`, `style`, `template`,
//!    …), mark block boundaries and headings with sentinel characters, and
//!    turn each `<img src>` into an image marker carrying its `src` and `alt`.
//! 2. **Collect** — gather every remaining text chunk in document order.
//!
//! Image blocks come out without pixels; the renderer loads them afterwards
//! from the (possibly rewritten) `src`.
//!
//! A handful of deterministic string rules then clean the collected text.
//!
//! ## Rule Order
//!
//! Whitespace is collapsed before entities are decoded so that `&nbsp;`
//! survives as a deliberate space, and invisible characters are removed last
//! so they cannot glue two words back together after collapsing.

use lol_html::html_content::ContentType;
use lol_html::{doc_text, element, rewrite_str, RewriteStrSettings};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::rc::Rc;

/// Marks the boundary between two blocks.
const BLOCK_BREAK: char = '\u{1E}';
/// Marks the start of a heading block.
const HEADING_MARK: char = '\u{1F}';
/// Marks the start of an image block.
const IMAGE_MARK: char = '\u{1D}';
/// Separates an image's `src` from its `alt` text.
const FIELD_SEP: char = '\u{1C}';

const DROPPED: &str = "script, style, noscript, template, title, svg, iframe, object, canvas";
const BLOCKS: &str = "p, div, br, li, tr, section, article, header, footer, main, nav, aside, \
blockquote, pre, table, ul, ol, dl, dt, dd, hr, figure, figcaption, form, address";
const HEADINGS: &str = "h1, h2, h3, h4, h5, h6";

/// One block of captured content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading(String),
    Paragraph(String),
    Image(ImageBlock),
}

impl Block {
    /// The block's text; the alternative text for images.
    pub fn text(&self) -> &str {
        match self {
            Block::Heading(t) | Block::Paragraph(t) => t,
            Block::Image(image) => &image.alt,
        }
    }
}

/// An `<img>` found in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBlock {
    /// `src` as it appears in the captured document.
    pub src: String,
    pub alt: String,
    /// Encoded image bytes, once loaded.
    pub data: Option<Vec<u8>>,
}

impl ImageBlock {
    pub fn new(src: impl Into<String>, alt: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            alt: alt.into(),
            data: None,
        }
    }
}

/// Readable content of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedPage {
    pub title: Option<String>,
    pub blocks: Vec<Block>,
}

impl CapturedPage {
    /// True when the body carries neither visible text nor images.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Extract the title and text blocks of an HTML document.
///
/// # Errors
/// Returns the `lol_html` error message when the document cannot be parsed.
pub fn extract_page(html: &str) -> Result<CapturedPage, String> {
    let title = extract_title(html);
    let stripped = strip_non_content(html)?;
    let raw = collect_text(&stripped)?;
    let blocks = split_blocks(&raw);
    Ok(CapturedPage { title, blocks })
}

// ── Pass 1: strip non-rendered subtrees, mark blocks ────────────────────────

fn strip_non_content(html: &str) -> Result<String, String> {
    let brk = BLOCK_BREAK.to_string();
    let heading_start = format!("{BLOCK_BREAK}{HEADING_MARK}");
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!(DROPPED, |el| {
                    el.remove();
                    Ok(())
                }),
                element!(BLOCKS, {
                    let brk = brk.clone();
                    move |el| {
                        el.before(&brk, ContentType::Text);
                        el.after(&brk, ContentType::Text);
                        Ok(())
                    }
                }),
                element!("img[src]", |el| {
                    let src = decode_entities(&el.get_attribute("src").unwrap_or_default());
                    let alt = decode_entities(&el.get_attribute("alt").unwrap_or_default());
                    let marker = format!("{BLOCK_BREAK}{IMAGE_MARK}{src}{FIELD_SEP}{alt}{BLOCK_BREAK}");
                    el.replace(&marker, ContentType::Text);
                    Ok(())
                }),
                element!(HEADINGS, {
                    let brk = brk.clone();
                    move |el| {
                        el.before(&heading_start, ContentType::Text);
                        el.after(&brk, ContentType::Text);
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| e.to_string())
}

// ── Pass 2: collect text chunks ─────────────────────────────────────────────

fn collect_text(html: &str) -> Result<String, String> {
    let buffer = Rc::new(RefCell::new(String::with_capacity(html.len() / 2)));
    rewrite_str(
        html,
        RewriteStrSettings {
            document_content_handlers: vec![doc_text!({
                let buffer = Rc::clone(&buffer);
                move |t| {
                    buffer.borrow_mut().push_str(t.as_str());
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| e.to_string())?;
    let text = buffer.borrow().clone();
    Ok(text)
}

// ── Cleanup rules ───────────────────────────────────────────────────────────

fn split_blocks(raw: &str) -> Vec<Block> {
    raw.split(BLOCK_BREAK)
        .filter_map(|segment| {
            if let Some(image) = segment.strip_prefix(IMAGE_MARK) {
                return image_block(image);
            }
            let (is_heading, body) = match segment.strip_prefix(HEADING_MARK) {
                Some(rest) => (true, rest),
                None => (false, segment),
            };
            let text = clean_text(body);
            if text.is_empty() {
                None
            } else if is_heading {
                Some(Block::Heading(text))
            } else {
                Some(Block::Paragraph(text))
            }
        })
        .collect()
}

fn image_block(marker: &str) -> Option<Block> {
    let (src, alt) = marker.split_once(FIELD_SEP).unwrap_or((marker, ""));
    let src = decode_entities(src).trim().to_string();
    if src.is_empty() {
        return None;
    }
    Some(Block::Image(ImageBlock::new(src, clean_text(alt))))
}

/// Apply the text rules to one block.
pub fn clean_text(input: &str) -> String {
    let s = collapse_whitespace(input);
    let s = decode_entities(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_whitespace(input: &str) -> String {
    RE_WHITESPACE.replace_all(input, " ").to_string()
}

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());

fn decode_entities(input: &str) -> String {
    RE_ENTITY
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(name)
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "bull" => '•',
        "middot" => '·',
        "euro" => '€',
        "pound" => '£',
        "deg" => '°',
        _ => return None,
    })
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

static RE_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").unwrap());

fn extract_title(html: &str) -> Option<String> {
    let caps = RE_TITLE.captures(html)?;
    let title = clean_text(&caps[1]);
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
