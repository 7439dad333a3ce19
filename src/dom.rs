use crate::layout::{Layout, Point, Rect};
use std::ops::Range;
use std::sync::mpsc::{self, Receiver, Sender};
use thiserror::Error;

/// Arena slot plus the generation it was handed out in. A freed slot is
/// reused under a new generation, so old ids stay dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputedStyle {
    pub display_none: bool,
    pub visibility_hidden: bool,
    pub opacity: f32,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display_none: false,
            visibility_hidden: false,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("node {0:?} no longer exists")]
    Removed(NodeId),
    #[error("node {0:?} is not attached to the document")]
    Detached(NodeId),
    #[error("node {0:?} is not an element")]
    NotAnElement(NodeId),
    #[error("node {0:?} has no layout box")]
    NoBox(NodeId),
    #[error("range {start}..{end} is outside the text of node {node:?}")]
    OutOfRange {
        node: NodeId,
        start: usize,
        end: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    SubtreeInserted(NodeId),
}

/// Capability surface the locator, replacer and picker run against.
///
/// Geometry is expressed in document cells: `x` is the column, `y` the
/// rendered line counted from the top of the page.
pub trait ContentTree {
    fn root(&self) -> NodeId;
    fn body(&self) -> NodeId;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn children(&self, node: NodeId) -> &[NodeId];
    fn element(&self, node: NodeId) -> Option<&Element>;
    fn text(&self, node: NodeId) -> Option<&str>;
    /// Returns false when the node is gone or is not a text node.
    fn set_text(&mut self, node: NodeId, text: String) -> bool;
    fn computed_style(&self, node: NodeId) -> Result<ComputedStyle, GeometryError>;
    fn bounding_rect(&self, node: NodeId) -> Result<Rect, GeometryError>;
    fn client_rects(&self, node: NodeId, range: Range<usize>) -> Result<Vec<Rect>, GeometryError>;
    fn element_at(&self, point: Point) -> Option<NodeId>;
    fn text_between(&self, from: Point, to: Point) -> String;

    fn is_connected(&self, node: NodeId) -> bool {
        let root = self.root();
        let mut current = Some(node);
        while let Some(id) = current {
            if id == root {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.parent(node).filter(|p| self.element(*p).is_some())
    }

    /// Preorder walk of `root` and everything below it.
    fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.children(id).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    fn text_nodes(&self, root: NodeId) -> Vec<NodeId> {
        self.preorder(root)
            .into_iter()
            .filter(|id| self.text(*id).is_some())
            .collect()
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Rendered text of an element, roughly `innerText`: hidden subtrees and
    /// non-content elements are skipped, whitespace is collapsed and block
    /// boundaries become newlines.
    fn rendered_text(&self, node: NodeId) -> String {
        let mut out = String::new();
        collect_rendered_text(self, node, &mut out);
        out.lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn collect_rendered_text<T: ContentTree + ?Sized>(tree: &T, node: NodeId, out: &mut String) {
    if let Some(text) = tree.text(node) {
        for (idx, word) in text.split_whitespace().enumerate() {
            let starts_with_space = idx > 0 || text.starts_with(char::is_whitespace);
            if starts_with_space && !out.is_empty() && !out.ends_with([' ', '\n']) {
                out.push(' ');
            }
            out.push_str(word);
        }
        if text.ends_with(char::is_whitespace) && !out.is_empty() && !out.ends_with([' ', '\n']) {
            out.push(' ');
        }
        return;
    }
    if let Some(el) = tree.element(node) {
        if matches!(el.tag.as_str(), "script" | "style" | "noscript" | "iframe" | "head") {
            return;
        }
        if tree
            .computed_style(node)
            .map(|style| style.display_none)
            .unwrap_or(false)
        {
            return;
        }
        let block = crate::layout::is_block(&el.tag);
        if el.tag == "br" || (block && !out.is_empty() && !out.ends_with('\n')) {
            out.push('\n');
        }
        for child in tree.children(node) {
            collect_rendered_text(tree, *child, out);
        }
        if block && !out.ends_with('\n') {
            out.push('\n');
        }
        return;
    }
    for child in tree.children(node) {
        collect_rendered_text(tree, *child, out);
    }
}

/// Arena-backed content tree with a cached layout and a mutation feed.
pub struct Document {
    slots: Vec<Slot>,
    free: Vec<usize>,
    root: NodeId,
    layout: Layout,
    layout_dirty: bool,
    observers: Vec<Sender<Mutation>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node {
                    kind: NodeKind::Document,
                    parent: None,
                    children: Vec::new(),
                }),
            }],
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            layout: Layout::default(),
            layout_dirty: true,
            observers: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let node = Node {
            kind,
            parent: None,
            children: Vec::new(),
        };
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.node = Some(node);
                return NodeId {
                    index,
                    generation: slot.generation,
                };
            }
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    /// Slots allocated so far, live or free.
    #[cfg(test)]
    fn arena_len(&self) -> usize {
        self.slots.len()
    }

    pub fn create_element(&mut self, element: Element) -> NodeId {
        self.push(NodeKind::Element(element))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    pub fn exists(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.node(id).map(|n| &n.kind)
    }

    /// Appends `child` under `parent`, detaching it from any previous parent.
    /// Subscribers hear about it when `parent` is connected to the document.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if !self.exists(parent) || !self.exists(child) || parent == child {
            return false;
        }
        if self.contains(child, parent) {
            return false;
        }
        self.detach(child);
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        self.layout_dirty = true;
        if self.is_connected(parent) {
            self.notify(Mutation::SubtreeInserted(child));
        }
        true
    }

    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.node(child).and_then(|n| n.parent) else {
            return;
        };
        if let Some(node) = self.node_mut(parent) {
            node.children.retain(|c| *c != child);
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = None;
        }
    }

    /// Detaches `node` and frees its whole subtree. Ids held elsewhere stop
    /// resolving.
    pub fn remove(&mut self, node: NodeId) {
        if node == self.root || !self.exists(node) {
            return;
        }
        self.detach(node);
        for id in self.preorder(node) {
            let Some(slot) = self.slots.get_mut(id.index) else {
                continue;
            };
            if slot.generation == id.generation && slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
        self.layout_dirty = true;
    }

    /// Deep-copies `node` from `other` into this document, detached.
    pub fn import(&mut self, other: &Document, node: NodeId) -> Option<NodeId> {
        let kind = other.kind(node)?.clone();
        if matches!(kind, NodeKind::Document) {
            return None;
        }
        let copy = self.push(kind);
        for child in other.children(node) {
            if let Some(child_copy) = self.import(other, *child) {
                if let Some(n) = self.node_mut(child_copy) {
                    n.parent = Some(copy);
                }
                if let Some(n) = self.node_mut(copy) {
                    n.children.push(child_copy);
                }
            }
        }
        Some(copy)
    }

    pub fn subscribe(&mut self) -> Receiver<Mutation> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    fn notify(&mut self, mutation: Mutation) {
        self.observers.retain(|tx| tx.send(mutation).is_ok());
    }

    pub fn first_element_by_tag(&self, tag: &str) -> Option<NodeId> {
        self.preorder(self.root).into_iter().find(|id| {
            self.element(*id)
                .map(|el| el.tag == tag)
                .unwrap_or(false)
        })
    }

    pub fn needs_reflow(&self) -> bool {
        self.layout_dirty
    }

    pub fn reflow(&mut self, width: usize) {
        self.layout = Layout::compute(self, width);
        self.layout_dirty = false;
    }

    /// Reflows at the current width if anything changed since the last
    /// layout.
    pub fn ensure_layout(&mut self) {
        if self.layout_dirty {
            let width = match self.layout.width() {
                0 => crate::page::DEFAULT_WIDTH,
                w => w,
            };
            self.reflow(width);
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Serialized form used to fingerprint subtrees across reloads.
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_html(node, &mut out);
        out
    }

    fn write_html(&self, node: NodeId, out: &mut String) {
        match self.kind(node) {
            Some(NodeKind::Text(text)) => out.push_str(text),
            Some(NodeKind::Element(el)) => {
                out.push('<');
                out.push_str(&el.tag);
                for (key, value) in &el.attrs {
                    out.push_str(&format!(" {key}=\"{value}\""));
                }
                out.push('>');
                for child in self.children(node) {
                    self.write_html(*child, out);
                }
                out.push_str(&format!("</{}>", el.tag));
            }
            Some(NodeKind::Document) => {
                for child in self.children(node) {
                    self.write_html(*child, out);
                }
            }
            None => {}
        }
    }
}

impl ContentTree for Document {
    fn root(&self) -> NodeId {
        self.root
    }

    fn body(&self) -> NodeId {
        self.first_element_by_tag("body")
            .or_else(|| {
                self.children(self.root)
                    .iter()
                    .copied()
                    .find(|c| self.element(*c).is_some())
            })
            .unwrap_or(self.root)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent)
    }

    fn children(&self, node: NodeId) -> &[NodeId] {
        self.node(node).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    fn element(&self, node: NodeId) -> Option<&Element> {
        match self.kind(node) {
            Some(NodeKind::Element(el)) => Some(el),
            _ => None,
        }
    }

    fn text(&self, node: NodeId) -> Option<&str> {
        match self.kind(node) {
            Some(NodeKind::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    fn set_text(&mut self, node: NodeId, text: String) -> bool {
        match self.node_mut(node) {
            Some(Node {
                kind: NodeKind::Text(current),
                ..
            }) => {
                *current = text;
                self.layout_dirty = true;
                true
            }
            _ => false,
        }
    }

    fn computed_style(&self, node: NodeId) -> Result<ComputedStyle, GeometryError> {
        if !self.exists(node) {
            return Err(GeometryError::Removed(node));
        }
        let Some(el) = self.element(node) else {
            return Err(GeometryError::NotAnElement(node));
        };
        if !self.is_connected(node) {
            return Err(GeometryError::Detached(node));
        }
        let declared = declared_style(el);
        let inherited_hidden = self
            .parent_element(node)
            .and_then(|p| self.computed_style(p).ok())
            .map(|style| style.visibility_hidden)
            .unwrap_or(false);
        Ok(ComputedStyle {
            display_none: declared.display_none,
            visibility_hidden: declared.visibility.unwrap_or(inherited_hidden),
            opacity: declared.opacity,
        })
    }

    fn bounding_rect(&self, node: NodeId) -> Result<Rect, GeometryError> {
        if !self.exists(node) {
            return Err(GeometryError::Removed(node));
        }
        if !self.is_connected(node) {
            return Err(GeometryError::Detached(node));
        }
        if self.element(node).is_none() {
            return Err(GeometryError::NotAnElement(node));
        }
        // Elements under `display: none` never get a box; that reads as 0x0.
        Ok(self.layout.element_box(node).unwrap_or_default())
    }

    fn client_rects(&self, node: NodeId, range: Range<usize>) -> Result<Vec<Rect>, GeometryError> {
        let Some(text) = self.text(node) else {
            return Err(GeometryError::Removed(node));
        };
        if range.start > range.end
            || range.end > text.len()
            || !text.is_char_boundary(range.start)
            || !text.is_char_boundary(range.end)
        {
            return Err(GeometryError::OutOfRange {
                node,
                start: range.start,
                end: range.end,
            });
        }
        self.layout.range_rects(node, text, range)
    }

    fn element_at(&self, point: Point) -> Option<NodeId> {
        self.layout.element_at(self, point)
    }

    fn text_between(&self, from: Point, to: Point) -> String {
        self.layout.text_between(self, from, to)
    }
}

struct DeclaredStyle {
    display_none: bool,
    visibility: Option<bool>,
    opacity: f32,
}

fn declared_style(el: &Element) -> DeclaredStyle {
    let mut style = DeclaredStyle {
        display_none: el.attr("hidden").is_some(),
        visibility: None,
        opacity: 1.0,
    };
    let Some(inline) = el.attr("style") else {
        return style;
    };
    for decl in inline.split(';') {
        let Some((prop, value)) = decl.split_once(':') else {
            continue;
        };
        let value = value
            .trim()
            .trim_end_matches("!important")
            .trim()
            .to_ascii_lowercase();
        match prop.trim().to_ascii_lowercase().as_str() {
            "display" => style.display_none = value == "none",
            "visibility" => style.visibility = Some(matches!(value.as_str(), "hidden" | "collapse")),
            "opacity" => {
                let parsed = match value.strip_suffix('%') {
                    Some(pct) => pct.trim().parse::<f32>().map(|v| v / 100.0),
                    None => value.parse::<f32>(),
                };
                if let Ok(v) = parsed {
                    style.opacity = v.clamp(0.0, 1.0);
                }
            }
            _ => {}
        }
    }
    style
}

#[cfg(test)]
mod tests {
    use super::{ContentTree, Document, Element, GeometryError, Mutation};
    use crate::page::parse_html;

    #[test]
    fn append_to_connected_parent_notifies_subscribers() {
        let mut doc = parse_html("<p>one</p>");
        let rx = doc.subscribe();
        let body = doc.body();
        let div = doc.create_element(Element::new("div"));
        let text = doc.create_text("two");
        assert!(doc.append_child(div, text));
        assert!(rx.try_recv().is_err(), "detached parent must stay quiet");
        assert!(doc.append_child(body, div));
        assert_eq!(rx.try_recv().ok(), Some(Mutation::SubtreeInserted(div)));
    }

    #[test]
    fn removed_nodes_stop_resolving() {
        let mut doc = parse_html("<p>one</p>");
        let p = doc.first_element_by_tag("p").expect("paragraph");
        let text = doc.children(p)[0];
        doc.remove(p);
        assert!(!doc.set_text(text, "x".to_string()));
        assert_eq!(doc.computed_style(p), Err(GeometryError::Removed(p)));
    }

    #[test]
    fn freed_slots_are_reused_without_reviving_old_ids() {
        let mut doc = parse_html("<p>one</p>");
        let body = doc.body();
        let size = doc.arena_len();
        for round in 0..20 {
            let p = doc.first_element_by_tag("p").expect("paragraph");
            let old_text = doc.children(p)[0];
            doc.remove(p);
            let fresh = doc.create_element(Element::new("p"));
            let text = doc.create_text(&format!("round {round}"));
            assert!(doc.append_child(fresh, text));
            assert!(doc.append_child(body, fresh));
            assert!(doc.text(old_text).is_none());
            assert!(!doc.set_text(old_text, "stale".to_string()));
        }
        assert_eq!(doc.arena_len(), size);
        assert_eq!(doc.rendered_text(body), "round 19");
    }

    #[test]
    fn visibility_is_inherited_and_overridable() {
        let doc = parse_html(
            r#"<div style="visibility: hidden"><p>a</p><p style="visibility:visible">b</p></div>"#,
        );
        let ps: Vec<_> = doc
            .preorder(doc.body())
            .into_iter()
            .filter(|id| doc.element(*id).map(|e| e.tag == "p").unwrap_or(false))
            .collect();
        assert!(doc.computed_style(ps[0]).expect("style").visibility_hidden);
        assert!(!doc.computed_style(ps[1]).expect("style").visibility_hidden);
    }

    #[test]
    fn inline_style_parses_display_and_opacity() {
        let doc = parse_html(
            r#"<span style="display:none">a</span><span style="opacity: 0">b</span><span hidden>c</span>"#,
        );
        let spans: Vec<_> = doc
            .preorder(doc.body())
            .into_iter()
            .filter(|id| doc.element(*id).map(|e| e.tag == "span").unwrap_or(false))
            .collect();
        assert!(doc.computed_style(spans[0]).expect("style").display_none);
        assert_eq!(doc.computed_style(spans[1]).expect("style").opacity, 0.0);
        assert!(doc.computed_style(spans[2]).expect("style").display_none);
    }

    #[test]
    fn rendered_text_collapses_whitespace_and_skips_hidden() {
        let doc = parse_html(
            "<div><p>Hello\n   <em>big</em>  world</p><p hidden>secret</p><script>x()</script><p>bye</p></div>",
        );
        let div = doc.first_element_by_tag("div").expect("div");
        assert_eq!(doc.rendered_text(div), "Hello big world\nbye");
    }

    #[test]
    fn import_copies_subtree_detached() {
        let source = parse_html("<ul><li>a</li><li>b</li></ul>");
        let ul = source.first_element_by_tag("ul").expect("list");
        let mut doc = parse_html("<p>x</p>");
        let copy = doc.import(&source, ul).expect("copy");
        assert!(!doc.is_connected(copy));
        assert_eq!(doc.outer_html(copy), "<ul><li>a</li><li>b</li></ul>");
    }
}
