//! Visible-text rendering for the free-text strategies.

use scraper::{ElementRef, Html, Node, Selector};

/// Subtrees that never carry page content.
const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "svg",
    "iframe", "form", "button",
];

/// Elements that break lines when rendered.
const BLOCK: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "dl", "dt", "dd", "tr", "td",
    "th", "table", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "br", "hr",
    "figure", "figcaption", "address",
];

/// Render the page's main content as plain text, one block per line.
///
/// Prefers `<main>`, then `<article>`, then `[role=main]`, then `<body>`.
/// The `<title>` is prepended when present.
pub fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    if let Some(title) = page_title(doc) {
        out.push_str(&title);
        out.push('\n');
    }
    walk(content_root(doc), &mut out);
    tidy(&out)
}

/// Text of the document's `<title>`, if any.
pub fn page_title(doc: &Html) -> Option<String> {
    let sel = Selector::parse("title").ok()?;
    let title = doc.select(&sel).next()?.text().collect::<String>();
    let title = collapse_whitespace(&title);
    (!title.is_empty()).then_some(title)
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn content_root(doc: &Html) -> ElementRef<'_> {
    for css in ["main", "article", r#"[role="main"]"#, "body"] {
        let Ok(sel) = Selector::parse(css) else { continue };
        if let Some(el) = doc.select(&sel).next() {
            return el;
        }
    }
    doc.root_element()
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED.contains(&name)
                    || el.attr("hidden").is_some()
                    || el.attr("aria-hidden") == Some("true")
                {
                    continue;
                }
                let Some(child_el) = ElementRef::wrap(child) else { continue };
                let block = BLOCK.contains(&name);
                if block {
                    out.push('\n');
                }
                walk(child_el, out);
                if block {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

fn tidy(raw: &str) -> String {
    raw.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
