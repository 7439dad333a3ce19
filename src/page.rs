use crate::dom::{ContentTree, Document, Element, NodeId};
use anyhow::{Context, Result};
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use pulldown_cmark::{Options, Parser, html};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_WIDTH: usize = 80;

pub fn parse_html(input: &str) -> Document {
    parse_html_with_width(input, DEFAULT_WIDTH)
}

pub fn parse_html_with_width(input: &str, width: usize) -> Document {
    let dom = parse_document(RcDom::default(), Default::default()).one(input);
    let mut doc = Document::new();
    let root = doc.root();
    for child in dom.document.children.borrow().iter() {
        convert(&mut doc, root, child);
    }
    doc.reflow(width);
    doc
}

fn convert(doc: &mut Document, parent: NodeId, handle: &Handle) {
    let id = match handle.data {
        NodeData::Element {
            ref name,
            ref attrs,
            ..
        } => {
            let mut element = Element::new(&name.local);
            for attr in attrs.borrow().iter() {
                element = element.with_attr(&attr.name.local, &attr.value);
            }
            doc.create_element(element)
        }
        NodeData::Text { ref contents } => {
            let text = contents.borrow();
            doc.create_text(&text)
        }
        _ => return,
    };
    doc.append_child(parent, id);
    for child in handle.children.borrow().iter() {
        convert(doc, id, child);
    }
}

pub fn markdown_to_html(input: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    let parser = Parser::new_ext(input, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

pub fn read_page_source(path: &Path) -> Result<String> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" | "xhtml" => Ok(raw),
        "md" | "markdown" | "mdown" => Ok(markdown_to_html(&raw)),
        other => anyhow::bail!(
            "Unsupported page type `{other}` for {} (expected .html or .md)",
            path.display()
        ),
    }
}

/// Host of an absolute URL as a browser reports it: IDNA-encoded,
/// percent-decoded, lowercased. `None` for relative or host-less URLs.
pub fn host_of(href: &str) -> Option<String> {
    let url = Url::parse(href.trim()).ok()?;
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Site identifier declared by the page itself: the canonical link, then
/// `og:url`. Pages without one share the empty identifier, like `file://`
/// pages in a browser.
pub fn detect_site(doc: &Document) -> String {
    let mut og = None;
    for id in doc.preorder(doc.root()) {
        let Some(el) = doc.element(id) else {
            continue;
        };
        match el.tag.as_str() {
            "link" if el.attr("rel").map(|r| r.eq_ignore_ascii_case("canonical")).unwrap_or(false) => {
                if let Some(host) = el.attr("href").and_then(host_of) {
                    return host;
                }
            }
            "meta" if el.attr("property") == Some("og:url") && og.is_none() => {
                og = el.attr("content").and_then(host_of);
            }
            _ => {}
        }
    }
    og.unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub kept: usize,
    pub removed: usize,
    pub inserted: usize,
}

/// A loaded page: the content tree plus what it was built from.
pub struct Page {
    pub path: PathBuf,
    pub site: String,
    pub document: Document,
    fingerprints: Vec<String>,
}

impl Page {
    pub fn load(path: &Path, site: Option<&str>) -> Result<Self> {
        let source = read_page_source(path)?;
        let document = parse_html(&source);
        let site = site
            .map(|s| s.to_string())
            .unwrap_or_else(|| detect_site(&document));
        let fingerprints = body_fingerprints(&document);
        Ok(Self {
            path: path.to_path_buf(),
            site,
            document,
            fingerprints,
        })
    }

    /// Re-reads the page. Body children that are unchanged since the last
    /// read stay as they are (with any replacements already applied);
    /// everything after the first difference is swapped for the fresh
    /// nodes, which subscribers see as inserted subtrees.
    pub fn reload(&mut self) -> Result<ReloadSummary> {
        let source = read_page_source(&self.path)?;
        let fresh = parse_html(&source);
        let fresh_prints = body_fingerprints(&fresh);

        let kept = self
            .fingerprints
            .iter()
            .zip(fresh_prints.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let body = self.document.body();
        let stale: Vec<NodeId> = self.document.children(body).iter().skip(kept).copied().collect();
        for node in &stale {
            self.document.remove(*node);
        }

        let fresh_body = fresh.body();
        let mut inserted = 0;
        for node in fresh.children(fresh_body).iter().skip(kept) {
            if let Some(copy) = self.document.import(&fresh, *node) {
                self.document.append_child(body, copy);
                inserted += 1;
            }
        }
        self.fingerprints = fresh_prints;
        Ok(ReloadSummary {
            kept,
            removed: stale.len(),
            inserted,
        })
    }
}

fn body_fingerprints(doc: &Document) -> Vec<String> {
    let body = doc.body();
    doc.children(body)
        .iter()
        .map(|child| doc.outer_html(*child))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Page, detect_site, host_of, markdown_to_html, parse_html};
    use crate::dom::{ContentTree, Mutation};
    use std::fs;

    #[test]
    fn host_of_strips_scheme_port_and_userinfo() {
        assert_eq!(host_of("https://Example.com/a/b"), Some("example.com".to_string()));
        assert_eq!(host_of("http://user:pw@docs.rs:8080/x?y"), Some("docs.rs".to_string()));
        assert_eq!(host_of("http://[::1]:3000/"), Some("[::1]".to_string()));
        assert_eq!(host_of("/relative/path"), None);
        assert_eq!(host_of("file:///tmp/page.html"), None);
    }

    #[test]
    fn host_of_matches_browser_hostnames() {
        assert_eq!(
            host_of("https://bücher.example/x"),
            Some("xn--bcher-kva.example".to_string())
        );
        assert_eq!(host_of("https://ex%41mple.com/"), Some("example.com".to_string()));
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn canonical_link_wins_over_og_url() {
        let doc = parse_html(
            r#"<html><head><meta property="og:url" content="https://og.example/x">
            <link rel="canonical" href="https://www.example.com/page"></head><body></body></html>"#,
        );
        assert_eq!(detect_site(&doc), "www.example.com");
        let bare = parse_html("<p>no metadata</p>");
        assert_eq!(detect_site(&bare), "");
    }

    #[test]
    fn markdown_renders_through_html() {
        let html = markdown_to_html("# Title\n\nHello *world*\n");
        let doc = parse_html(&html);
        let h1 = doc.first_element_by_tag("h1").expect("heading");
        assert_eq!(doc.rendered_text(h1), "Title");
        assert!(doc.first_element_by_tag("em").is_some());
    }

    #[test]
    fn reload_keeps_prefix_and_inserts_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        fs::write(&path, "<p>one</p><p>two</p>").expect("write");
        let mut page = Page::load(&path, Some("example.com")).expect("load");
        let rx = page.document.subscribe();
        let first = page.document.first_element_by_tag("p").expect("p");

        fs::write(&path, "<p>one</p><p>two!</p><p>three</p>").expect("write");
        let summary = page.reload().expect("reload");
        assert_eq!((summary.kept, summary.removed, summary.inserted), (1, 1, 2));
        assert_eq!(page.document.first_element_by_tag("p"), Some(first));

        let events: Vec<Mutation> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        let body = page.document.body();
        assert_eq!(page.document.rendered_text(body), "one\ntwo!\nthree");
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.pdf");
        fs::write(&path, "x").expect("write");
        let err = Page::load(&path, None).err().expect("should fail");
        assert!(err.to_string().contains("Unsupported page type"));
    }
}
