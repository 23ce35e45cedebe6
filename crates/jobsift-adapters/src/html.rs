use scraper::{ElementRef, Html, Selector};

use crate::SourceError;

pub(crate) fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Malformed(format!("selector {css:?}: {e}")))
}

/// Trimmed text with inner whitespace runs collapsed; `None` when blank.
pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

/// Paragraph-preserving text: one line per block of text nodes.
pub(crate) fn element_block_text(element: ElementRef<'_>) -> Option<String> {
    let lines: Vec<String> = element
        .text()
        .filter_map(text_or_none)
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

pub(crate) fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

pub(crate) fn first_text_in(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().and_then(element_text)
}

pub(crate) fn first_attr_in(element: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}
