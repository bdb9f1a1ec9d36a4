//! Resource rewriting for content retrieved through the intermediary.
//!
//! Content fetched via a proxy is detached from its origin, so root-relative
//! references (`/static/app.css`) would resolve against the proxy instead.
//! Stylesheet links, images and scripts starting with a single `/` are
//! rewritten to absolute URLs on the page's own origin. Protocol-relative
//! (`//cdn…`), absolute and document-relative references are left untouched.

use lol_html::{element, rewrite_str, RewriteStrSettings};
use url::Url;

/// Rewrite root-relative resource references in `html` against `page_url`'s origin.
///
/// # Errors
/// Returns the `lol_html` error message when the document cannot be parsed.
pub fn rewrite_root_relative(html: &str, page_url: &Url) -> Result<String, String> {
    let origin = page_url.origin().ascii_serialization();

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!(r#"link[rel="stylesheet"][href]"#, {
                    let origin = origin.clone();
                    move |el| {
                        if let Some(href) = el.get_attribute("href") {
                            if let Some(abs) = absolutise(&origin, &href) {
                                el.set_attribute("href", &abs)?;
                            }
                        }
                        Ok(())
                    }
                }),
                element!("img[src], script[src]", {
                    let origin = origin.clone();
                    move |el| {
                        if let Some(src) = el.get_attribute("src") {
                            if let Some(abs) = absolutise(&origin, &src) {
                                el.set_attribute("src", &abs)?;
                            }
                        }
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| e.to_string())
}

/// `Some(origin + reference)` for root-relative references, `None` otherwise.
fn absolutise(origin: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.starts_with('/') && !reference.starts_with("//") && origin != "null" {
        Some(format!("{origin}{reference}"))
    } else {
        None
    }
}
