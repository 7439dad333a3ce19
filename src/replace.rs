use crate::dom::{ContentTree, NodeId};
use crate::layout::Rect;
use crate::locate::{LiteralFinder, locate};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub matches: usize,
    pub nodes: usize,
}

/// Preview rectangles plus the single-level undo snapshot.
#[derive(Debug, Default)]
pub struct Replacer {
    snapshot: Option<Vec<(NodeId, String)>>,
    previews: Vec<Rect>,
}

impl Replacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previews(&self) -> &[Rect] {
        &self.previews
    }

    pub fn clear_previews(&mut self) {
        self.previews.clear();
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Replaces the live previews with one rectangle per match line.
    pub fn preview<T: ContentTree + ?Sized>(
        &mut self,
        tree: &T,
        token: &str,
        scope: Option<&str>,
    ) -> usize {
        self.clear_previews();
        let matches = locate(tree, token, scope);
        self.previews = matches.iter().flat_map(|m| m.rects.iter().copied()).collect();
        debug!(token, matches = matches.len(), "preview");
        matches.len()
    }

    /// Rewrites every occurrence under the scope. `None` when there was
    /// nothing to do because the token or the trimmed replacement is empty.
    pub fn apply<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        token: &str,
        scope: Option<&str>,
        replacement: &str,
    ) -> Option<ApplyOutcome> {
        self.clear_previews();
        let replacement = replacement.trim();
        if replacement.is_empty() {
            return None;
        }
        let finder = LiteralFinder::new(token)?;

        let matches = locate(&*tree, token, scope);
        let mut touched: Vec<NodeId> = Vec::new();
        for m in &matches {
            if !touched.contains(&m.node) {
                touched.push(m.node);
            }
        }

        let mut snapshot = Vec::with_capacity(touched.len());
        for node in touched {
            let Some(old) = tree.text(node).map(str::to_string) else {
                debug!(?node, "node vanished before replacement");
                continue;
            };
            let new = finder.replace_all(&old, replacement).into_owned();
            if tree.set_text(node, new) {
                snapshot.push((node, old));
            }
        }

        let outcome = ApplyOutcome {
            matches: matches.len(),
            nodes: snapshot.len(),
        };
        info!(token, matches = outcome.matches, nodes = outcome.nodes, "applied replacement");
        self.snapshot = Some(snapshot);
        Some(outcome)
    }

    /// Restores the nodes touched by the last apply. Returns how many were
    /// restored.
    pub fn undo<T: ContentTree + ?Sized>(&mut self, tree: &mut T) -> usize {
        let Some(snapshot) = self.snapshot.take() else {
            return 0;
        };
        let mut restored = 0;
        for (node, old) in snapshot {
            if tree.set_text(node, old) {
                restored += 1;
            }
        }
        info!(restored, "undo");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::Replacer;
    use crate::dom::ContentTree;
    use crate::page::parse_html;

    #[test]
    fn apply_then_undo_restores_every_node() {
        let mut doc = parse_html("<p>Hello world</p><div>hello <b>HELLO</b> there</div>");
        let before = doc.rendered_text(doc.body());
        let mut replacer = Replacer::new();

        let outcome = replacer.apply(&mut doc, "hello", None, "  Hi ").expect("applied");
        assert_eq!(outcome.matches, 3);
        assert_eq!(outcome.nodes, 3);
        assert_eq!(doc.rendered_text(doc.body()), "Hi world\nHi Hi there");

        assert_eq!(replacer.undo(&mut doc), 3);
        assert_eq!(doc.rendered_text(doc.body()), before);
        assert!(!replacer.has_snapshot());
        assert_eq!(replacer.undo(&mut doc), 0);
    }

    #[test]
    fn one_snapshot_entry_per_node() {
        let mut doc = parse_html("<p>a a a</p>");
        let mut replacer = Replacer::new();
        let outcome = replacer.apply(&mut doc, "a", None, "b").expect("applied");
        assert_eq!((outcome.matches, outcome.nodes), (3, 1));
        assert_eq!(replacer.undo(&mut doc), 1);
        assert_eq!(doc.rendered_text(doc.body()), "a a a");
    }

    #[test]
    fn empty_token_or_replacement_is_a_no_op() {
        let mut doc = parse_html("<p>Hello</p>");
        let mut replacer = Replacer::new();
        assert!(replacer.apply(&mut doc, "", None, "x").is_none());
        assert_eq!(replacer.preview(&doc, "Hello", None), 1);
        assert!(replacer.apply(&mut doc, "Hello", None, "   ").is_none());
        assert!(replacer.previews().is_empty());
        assert!(!replacer.has_snapshot());
        assert_eq!(doc.rendered_text(doc.body()), "Hello");
    }

    #[test]
    fn apply_respects_scope() {
        let mut doc = parse_html("<p>Hello</p><p>Hello</p>");
        let mut replacer = Replacer::new();
        replacer
            .apply(&mut doc, "Hello", Some("html > body > p:nth-of-type(2)"), "Bye")
            .expect("applied");
        assert_eq!(doc.rendered_text(doc.body()), "Hello\nBye");
    }

    #[test]
    fn preview_replaces_the_previous_generation() {
        let mut doc = parse_html("<p>one two one</p>");
        let mut replacer = Replacer::new();
        assert_eq!(replacer.preview(&doc, "one", None), 2);
        assert_eq!(replacer.previews().len(), 2);
        assert_eq!(replacer.preview(&doc, "two", None), 1);
        assert_eq!(replacer.previews().len(), 1);
        replacer.apply(&mut doc, "two", None, "2").expect("applied");
        assert!(replacer.previews().is_empty());
    }

    #[test]
    fn literal_dollar_signs_survive() {
        let mut doc = parse_html("<p>price</p>");
        let mut replacer = Replacer::new();
        replacer.apply(&mut doc, "price", None, "$1.00").expect("applied");
        assert_eq!(doc.rendered_text(doc.body()), "$1.00");
    }
}
