//! Flattening of the document store's XML-markdown mix into clean markdown.
//!
//! The docs API emits markdown interleaved with structural XML tags: a
//! `<page>` wrapper with `<pageTitle>`/`<content>`, `<collection>` blocks
//! with typed properties, nested pages for cards and subpages, and inline
//! `<callout>`/`<highlight>` tags. This module rewrites all of that into
//! plain markdown. On any surprise the raw input is returned unchanged;
//! losing formatting beats losing content.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PAGE_WITH_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<page[^>]*>\s*<pageTitle>([^<]*)</pageTitle>\s*<content>(.*?)</content>\s*</page>",
    )
    .expect("valid regex")
});
static OUTER_PAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)\A\s*<page[^>]*>\s*<pageTitle>([^<]*)</pageTitle>\s*<content>(.*?)</content>\s*</page>",
    )
    .expect("valid regex")
});
static OUTER_CONTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A\s*(?:<page[^>]*>)?\s*<content>(.*?)</content>").expect("valid regex"));
static CONTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<content>(.*?)</content>").expect("valid regex"));
static COLLECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<collection>\s*<title>([^<]*)</title>\s*<properties>([^<]*)</properties>\s*<content>(.*?)</content>\s*</collection>",
    )
    .expect("valid regex")
});
static COLLECTION_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<collectionItem>\s*(.*?)\s*</collectionItem>").expect("valid regex"));
static ITEM_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<title>([^<]*)</title>").expect("valid regex"));
static ITEM_PROP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<property name="([^"]+)">([^<]*)</property>"#).expect("valid regex"));
static CALLOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<callout>(.*?)</callout>").expect("valid regex"));
static HIGHLIGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<highlight[^>]*>([^<]*)</highlight>").expect("valid regex"));
static PAGE_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<pageTitle>([^<]*)</pageTitle>").expect("valid regex"));
static PAGE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<page[^>]*>|</page>").expect("valid regex"));
static CONTENT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?content>").expect("valid regex"));
static EXCESS_BLANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static TRAILING_WS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)[ \t]+$").expect("valid regex"));
static HEADER_SPACING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(#{1,6} )").expect("valid regex"));

/// Convert the docs source's XML-markdown mix to clean markdown.
/// Falls back to the raw content when nothing structural is recognised.
pub fn flatten_markdown(raw: &str) -> String {
    if raw.is_empty() {
        return raw.to_string();
    }

    let content = unwrap_page(raw);
    let content = process_collections(&content);
    let content = process_nested_pages(&content);
    let content = process_simple_tags(&content);
    clean_whitespace(&content).trim().to_string()
}

/// Extract the body from the outer `<page>` wrapper, promoting the page
/// title to an `# h1`. Only a wrapper at the very start counts; pages in
/// the middle of the document are cards and handled later.
fn unwrap_page(content: &str) -> String {
    if let Some(caps) = OUTER_PAGE_RE.captures(content) {
        let title = caps[1].trim();
        let inner = &caps[2];
        return format!("# {title}\n\n{inner}");
    }
    if let Some(caps) = OUTER_CONTENT_RE.captures(content) {
        return caps[1].to_string();
    }
    content.to_string()
}

/// Convert `<collection>` blocks to markdown tables.
fn process_collections(content: &str) -> String {
    COLLECTION_RE
        .replace_all(content, |caps: &Captures<'_>| {
            let title = caps[1].trim().to_string();
            let props: Vec<String> = caps[2]
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            let items = parse_collection_items(&caps[3]);
            build_collection_table(&title, &props, &items)
        })
        .into_owned()
}

struct CollectionItem {
    title: String,
    content: String,
    props: Vec<(String, String)>,
}

impl CollectionItem {
    fn prop(&self, name: &str) -> &str {
        self.props
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .unwrap_or("")
    }
}

fn parse_collection_items(content: &str) -> Vec<CollectionItem> {
    let mut items = Vec::new();

    for caps in COLLECTION_ITEM_RE.captures_iter(content) {
        let body = &caps[1];

        let title = ITEM_TITLE_RE
            .captures(body)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        let props: Vec<(String, String)> = ITEM_PROP_RE
            .captures_iter(body)
            .map(|c| (c[1].to_string(), c[2].trim().to_string()))
            .collect();

        let nested = CONTENT_RE
            .captures(body)
            .map(|c| process_simple_tags(c[1].trim()))
            .unwrap_or_default();

        // Skip rows that carry no information
        if !title.is_empty() || props.iter().any(|(_, v)| !v.is_empty()) {
            items.push(CollectionItem { title, content: nested, props });
        }
    }

    items
}

fn build_collection_table(title: &str, props: &[String], items: &[CollectionItem]) -> String {
    if items.is_empty() {
        return format!("## {title}\n\n*Empty collection*\n");
    }

    let mut lines = vec![format!("## {title}\n")];

    let header = format!("| Title | {} |", props.join(" | "));
    let separator = format!("|{}", "---|".repeat(props.len() + 1));
    lines.push(header);
    lines.push(separator);

    let mut nested_sections: Vec<(String, String)> = Vec::new();
    for item in items {
        let mut cells = vec![escape_table_cell(&item.title)];
        for prop in props {
            cells.push(escape_table_cell(item.prop(prop)));
        }
        lines.push(format!("| {} |", cells.join(" | ")));

        if !item.content.is_empty() {
            nested_sections.push((item.title.clone(), item.content.clone()));
        }
    }

    lines.push(String::new());

    for (item_title, item_content) in nested_sections {
        if !item_title.is_empty() {
            lines.push(format!("### {item_title}\n"));
        }
        lines.push(item_content.trim().to_string());
        lines.push(String::new());
    }

    lines.join("\n")
}

fn escape_table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Convert nested `<page>` elements (cards, subpages) to `### sections`.
fn process_nested_pages(content: &str) -> String {
    PAGE_WITH_TITLE_RE
        .replace_all(content, |caps: &Captures<'_>| {
            let title = caps[1].trim().to_string();
            let inner = process_nested_pages(caps[2].trim());
            let inner = process_simple_tags(&inner);
            format!("### {title}\n\n{inner}\n")
        })
        .into_owned()
}

/// Convert the simple inline tags and drop any structural leftovers.
fn process_simple_tags(content: &str) -> String {
    let content = CALLOUT_RE.replace_all(content, |caps: &Captures<'_>| {
        let quoted = caps[1].trim().replace('\n', "\n> ");
        format!("> {quoted}")
    });
    let content = HIGHLIGHT_RE.replace_all(&content, "**$1**");
    let content = PAGE_TITLE_RE.replace_all(&content, "# $1");
    let content = CONTENT_TAG_RE.replace_all(&content, "");
    PAGE_TAG_RE.replace_all(&content, "").into_owned()
}

fn clean_whitespace(content: &str) -> String {
    let content = EXCESS_BLANK_RE.replace_all(content, "\n\n");
    let content = TRAILING_WS_RE.replace_all(&content, "");
    HEADER_SPACING_RE.replace_all(&content, "\n\n$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_page_and_promotes_title() {
        let raw = "<page id=\"d1\"><pageTitle>Notes</pageTitle><content>body text</content></page>";
        let out = flatten_markdown(raw);
        assert!(out.starts_with("# Notes"));
        assert!(out.contains("body text"));
        assert!(!out.contains("<page"));
    }

    #[test]
    fn passes_plain_markdown_through() {
        let raw = "# Already markdown\n\nSome *text*.";
        assert_eq!(flatten_markdown(raw), raw);
    }

    #[test]
    fn converts_collections_to_tables() {
        let raw = "<collection><title>Tasks</title><properties>Status, Owner</properties><content>\
            <collectionItem><title>Ship it</title>\
            <property name=\"Status\">Done</property>\
            <property name=\"Owner\">Ada</property>\
            </collectionItem></content></collection>";
        let out = flatten_markdown(raw);
        assert!(out.contains("## Tasks"));
        assert!(out.contains("| Title | Status | Owner |"));
        assert!(out.contains("| Ship it | Done | Ada |"));
    }

    #[test]
    fn empty_collection_is_labelled() {
        let raw = "<collection><title>Nothing</title><properties>A</properties><content></content></collection>";
        let out = flatten_markdown(raw);
        assert!(out.contains("*Empty collection*"));
    }

    #[test]
    fn nested_pages_become_sections() {
        let raw = "intro\n<page><pageTitle>Card</pageTitle><content>card body</content></page>";
        let out = flatten_markdown(raw);
        assert!(out.contains("### Card"));
        assert!(out.contains("card body"));
    }

    #[test]
    fn inline_tags_are_rewritten() {
        let raw = "<callout>watch out</callout> and <highlight color=\"yellow\">bold</highlight>";
        let out = flatten_markdown(raw);
        assert!(out.contains("> watch out"));
        assert!(out.contains("**bold**"));
    }

    #[test]
    fn pipes_in_table_cells_are_escaped() {
        assert_eq!(escape_table_cell("a|b"), "a\\|b");
        assert_eq!(escape_table_cell("two\nlines"), "two lines");
    }

    #[test]
    fn empty_input_is_returned_unchanged() {
        assert_eq!(flatten_markdown(""), "");
    }
}
