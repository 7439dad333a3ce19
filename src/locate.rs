use crate::dom::{ContentTree, NodeId};
use crate::filter::{is_eligible, is_visible};
use crate::layout::Rect;
use crate::selector::Selector;
use regex::{NoExpand, Regex, RegexBuilder};
use std::borrow::Cow;
use std::ops::Range;
use tracing::{debug, warn};

/// Case-insensitive literal search for one token. Every place that matches
/// or rewrites rule text goes through this type.
#[derive(Debug, Clone)]
pub struct LiteralFinder {
    pattern: Regex,
}

impl LiteralFinder {
    /// `None` for an empty token, which would otherwise match everywhere.
    pub fn new(token: &str) -> Option<Self> {
        if token.is_empty() {
            return None;
        }
        match RegexBuilder::new(&regex::escape(token))
            .case_insensitive(true)
            .build()
        {
            Ok(pattern) => Some(Self { pattern }),
            Err(err) => {
                warn!(%err, "token cannot be compiled into a literal pattern");
                None
            }
        }
    }

    /// Non-overlapping byte ranges, left to right.
    pub fn occurrences(&self, text: &str) -> Vec<Range<usize>> {
        self.pattern.find_iter(text).map(|m| m.range()).collect()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Replaces every occurrence. The replacement is inserted verbatim.
    pub fn replace_all<'t>(&self, text: &'t str, replacement: &str) -> Cow<'t, str> {
        self.pattern.replace_all(text, NoExpand(replacement))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub node: NodeId,
    pub range: Range<usize>,
    pub rects: Vec<Rect>,
}

/// Element a scope selector points at, or `<body>` when there is no scope or
/// it does not resolve.
pub fn resolve_scope<T: ContentTree + ?Sized>(tree: &T, scope: Option<&str>) -> NodeId {
    let body = tree.body();
    let Some(scope) = scope.map(str::trim).filter(|s| !s.is_empty()) else {
        return body;
    };
    match Selector::parse(scope) {
        Ok(selector) => selector.query_first(tree, tree.root()).unwrap_or_else(|| {
            debug!(scope, "scope matched nothing, searching the whole body");
            body
        }),
        Err(err) => {
            warn!(scope, %err, "invalid scope selector, searching the whole body");
            body
        }
    }
}

/// Text nodes under `root` whose parent element passes `accept`, in
/// document order.
pub fn candidate_text_nodes<T, F>(tree: &T, root: NodeId, accept: F) -> Vec<NodeId>
where
    T: ContentTree + ?Sized,
    F: Fn(&T, NodeId) -> bool,
{
    tree.text_nodes(root)
        .into_iter()
        .filter(|node| {
            let Some(text) = tree.text(*node) else {
                return false;
            };
            if text.is_empty() {
                return false;
            }
            match tree.parent(*node) {
                Some(parent) => accept(tree, parent),
                None => false,
            }
        })
        .collect()
}

/// Every occurrence of `token` in eligible, visible text under the scope.
pub fn locate<T: ContentTree + ?Sized>(tree: &T, token: &str, scope: Option<&str>) -> Vec<Match> {
    let Some(finder) = LiteralFinder::new(token) else {
        return Vec::new();
    };
    let root = resolve_scope(tree, scope);
    let nodes = candidate_text_nodes(tree, root, |t, parent| {
        is_eligible(t, parent) && is_visible(t, parent)
    });

    let mut out = Vec::new();
    for node in nodes {
        let Some(text) = tree.text(node) else {
            continue;
        };
        for range in finder.occurrences(text) {
            let rects = tree.client_rects(node, range.clone()).unwrap_or_else(|err| {
                debug!(?node, %err, "no geometry for match");
                Vec::new()
            });
            out.push(Match { node, range, rects });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{LiteralFinder, locate, resolve_scope};
    use crate::dom::ContentTree;
    use crate::layout::Rect;
    use crate::page::parse_html;

    #[test]
    fn finder_is_literal_and_case_insensitive() {
        let finder = LiteralFinder::new("a.b*").expect("finder");
        assert_eq!(finder.occurrences("xA.B*y a.b* axbb"), vec![1..5, 7..11]);
        assert!(!finder.is_match("axbb"));
        assert!(LiteralFinder::new("").is_none());
    }

    #[test]
    fn replacement_is_not_expanded() {
        let finder = LiteralFinder::new("cost").expect("finder");
        assert_eq!(finder.replace_all("Cost: cost", "$1 $0"), "$1 $0: $1 $0");
    }

    #[test]
    fn occurrences_do_not_overlap() {
        let finder = LiteralFinder::new("aa").expect("finder");
        assert_eq!(finder.occurrences("aaaaa"), vec![0..2, 2..4]);
    }

    #[test]
    fn locate_returns_matches_in_document_order() {
        let doc = parse_html("<p>foo one Foo</p><div><span>FOO</span></div>");
        let matches = locate(&doc, "foo", None);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].range, 0..3);
        assert_eq!(matches[1].range, 8..11);
        assert_eq!(matches[0].node, matches[1].node);
        assert_eq!(matches[0].rects, vec![Rect::new(0, 0, 3, 1)]);
        assert_eq!(doc.text(matches[2].node), Some("FOO"));
    }

    #[test]
    fn locate_skips_hidden_excluded_and_editable_text() {
        let doc = parse_html(
            r#"<p>foo</p><p style="display:none">foo</p><p style="visibility:hidden">foo</p>
            <script>var foo;</script><div contenteditable>foo</div><textarea>foo</textarea>"#,
        );
        let matches = locate(&doc, "foo", None);
        assert_eq!(matches.len(), 2, "{matches:?}");
        let textarea = doc.first_element_by_tag("textarea").expect("textarea");
        assert_eq!(doc.parent(matches[1].node), Some(textarea));
    }

    #[test]
    fn scope_limits_the_search_and_bad_scopes_fall_back() {
        let doc = parse_html("<p>foo</p><p>foo</p>");
        assert_eq!(locate(&doc, "foo", Some("html > body > p")).len(), 1);
        assert_eq!(locate(&doc, "foo", Some("html > body > p:nth-of-type(2)")).len(), 1);
        assert_eq!(locate(&doc, "foo", Some("p[broken")).len(), 2);
        assert_eq!(locate(&doc, "foo", Some("article")).len(), 2);
        assert_eq!(resolve_scope(&doc, Some("  ")), doc.body());
    }

    #[test]
    fn empty_token_matches_nothing() {
        let doc = parse_html("<p>foo</p>");
        assert!(locate(&doc, "", None).is_empty());
    }
}
