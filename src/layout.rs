use crate::dom::{ContentTree, GeometryError, NodeId};
use std::collections::HashMap;
use std::ops::Range;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const TAB_STOP: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Point {
    pub y: usize,
    pub x: usize,
}

impl Point {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn has_area(&self) -> bool {
        self.width > 0 || self.height > 0
    }

    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x && point.x < self.right() && point.y >= self.y && point.y < self.bottom()
    }

    pub fn union(&self, other: &Rect) -> Rect {
        if !self.has_area() {
            return *other;
        }
        if !other.has_area() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// A slice of a text node placed contiguously on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub node: NodeId,
    pub bytes: Range<usize>,
    pub line: usize,
    pub x: usize,
    pub width: usize,
}

/// Generated content that is not part of any text node (bullets, rules).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub owner: NodeId,
    pub text: String,
    pub line: usize,
    pub x: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece {
    Run(usize),
    Marker(usize),
}

#[derive(Debug, Default)]
pub struct Layout {
    width: usize,
    height: usize,
    runs: Vec<Run>,
    markers: Vec<Marker>,
    text_runs: HashMap<NodeId, Vec<usize>>,
    boxes: HashMap<NodeId, Rect>,
    boxed: Vec<NodeId>,
}

pub fn is_block(tag: &str) -> bool {
    matches!(
        tag,
        "html"
            | "body"
            | "div"
            | "p"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "ul"
            | "ol"
            | "li"
            | "blockquote"
            | "pre"
            | "table"
            | "thead"
            | "tbody"
            | "tfoot"
            | "tr"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "nav"
            | "main"
            | "aside"
            | "figure"
            | "figcaption"
            | "hr"
            | "dl"
            | "dt"
            | "dd"
            | "form"
            | "fieldset"
            | "address"
            | "details"
            | "summary"
    )
}

/// Lists get a margin unless they are nested in another list.
fn has_margin<T: ContentTree + ?Sized>(tree: &T, node: NodeId, tag: &str) -> bool {
    if matches!(tag, "ul" | "ol") {
        let mut current = tree.parent(node);
        while let Some(id) = current {
            if tree
                .element(id)
                .map(|el| matches!(el.tag.as_str(), "li" | "ul" | "ol"))
                .unwrap_or(false)
            {
                return false;
            }
            current = tree.parent(id);
        }
        return true;
    }
    matches!(
        tag,
        "p" | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "pre"
            | "blockquote"
            | "table"
            | "hr"
            | "dl"
            | "figure"
    )
}

fn never_rendered(tag: &str) -> bool {
    matches!(
        tag,
        "head" | "title" | "meta" | "link" | "script" | "style" | "noscript" | "template" | "iframe"
    )
}

struct Flow<'a, T: ContentTree + ?Sized> {
    tree: &'a T,
    width: usize,
    line: usize,
    x: usize,
    indent: usize,
    pending_space: bool,
    line_has_content: bool,
    last_content_line: Option<usize>,
    pre: usize,
    out: Layout,
}

impl<'a, T: ContentTree + ?Sized> Flow<'a, T> {
    fn break_line(&mut self) {
        if self.line_has_content {
            self.hard_break();
        } else {
            self.x = self.indent;
            self.pending_space = false;
        }
    }

    fn hard_break(&mut self) {
        self.line += 1;
        self.x = self.indent;
        self.line_has_content = false;
        self.pending_space = false;
    }

    fn gap(&mut self) {
        self.break_line();
        if let Some(last) = self.last_content_line {
            if self.line == last + 1 {
                self.line += 1;
            }
        }
    }

    fn mark_content(&mut self) {
        self.line_has_content = true;
        self.last_content_line = Some(self.line);
    }

    fn push_run(&mut self, node: NodeId, bytes: Range<usize>, width: usize) {
        let idx = self.out.runs.len();
        self.out.runs.push(Run {
            node,
            bytes,
            line: self.line,
            x: self.x,
            width,
        });
        self.out.text_runs.entry(node).or_default().push(idx);
        self.x += width;
        self.mark_content();
    }

    fn push_marker(&mut self, owner: NodeId, text: String) {
        let width = UnicodeWidthStr::width(text.as_str());
        self.out.markers.push(Marker {
            owner,
            text,
            line: self.line,
            x: self.x,
        });
        self.x += width;
        self.mark_content();
    }

    fn avail(&self) -> usize {
        self.width.saturating_sub(self.indent).max(1)
    }

    fn layout_node(&mut self, node: NodeId) {
        let tree = self.tree;
        if let Some(text) = tree.text(node) {
            if self.pre > 0 {
                self.layout_pre_text(node, text);
            } else {
                self.layout_text(node, text);
            }
            return;
        }

        let Some(el) = tree.element(node) else {
            for child in tree.children(node) {
                self.layout_node(*child);
            }
            return;
        };
        let tag = el.tag.clone();
        if never_rendered(&tag) {
            return;
        }
        if tree
            .computed_style(node)
            .map(|style| style.display_none)
            .unwrap_or(false)
        {
            return;
        }

        let first_run = self.out.runs.len();
        let first_marker = self.out.markers.len();
        let start = Point::new(self.x, self.line);
        let saved_indent = self.indent;
        let block = is_block(&tag);
        let margin = has_margin(tree, node, &tag);

        if margin {
            self.gap();
        } else if block {
            self.break_line();
        }
        self.out.boxed.push(node);

        match tag.as_str() {
            "br" => self.hard_break(),
            "hr" => {
                let rule = "─".repeat(self.avail());
                self.push_marker(node, rule);
            }
            "ul" | "ol" | "blockquote" | "dd" => {
                self.indent = (self.indent + 2).min(self.width / 2);
                self.x = self.indent;
            }
            "li" => {
                let marker = self.list_marker(node);
                self.push_marker(node, marker);
                self.indent = self.x.min(self.width / 2);
            }
            "td" | "th" => {
                if self.x > self.indent {
                    self.x += 2;
                }
                self.pending_space = false;
            }
            "pre" => self.pre += 1,
            _ => {}
        }

        for child in tree.children(node) {
            self.layout_node(*child);
        }

        if tag == "pre" {
            self.pre -= 1;
        }
        self.indent = saved_indent;
        if margin || block {
            self.break_line();
        }

        let mut rect = Rect::default();
        for run in &self.out.runs[first_run..] {
            rect = rect.union(&Rect::new(run.x, run.line, run.width, 1));
        }
        for marker in &self.out.markers[first_marker..] {
            let width = UnicodeWidthStr::width(marker.text.as_str());
            rect = rect.union(&Rect::new(marker.x, marker.line, width, 1));
        }
        if !rect.has_area() {
            rect = Rect::new(start.x, start.y, 0, 0);
        }
        self.out.boxes.insert(node, rect);
    }

    fn list_marker(&self, item: NodeId) -> String {
        let Some(list) = self.tree.parent(item) else {
            return "• ".to_string();
        };
        let ordered = self
            .tree
            .element(list)
            .map(|el| el.tag == "ol")
            .unwrap_or(false);
        if !ordered {
            return "• ".to_string();
        }
        let start = self
            .tree
            .element(list)
            .and_then(|el| el.attr("start"))
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(1);
        let position = self
            .tree
            .children(list)
            .iter()
            .filter(|c| self.tree.element(**c).map(|e| e.tag == "li").unwrap_or(false))
            .position(|c| *c == item)
            .unwrap_or(0);
        format!("{}. ", start + position)
    }

    fn layout_text(&mut self, node: NodeId, text: &str) {
        let mut word_start: Option<usize> = None;
        for (idx, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(start) = word_start.take() {
                    self.place_word(node, start, &text[start..idx]);
                }
                self.pending_space = true;
            } else if word_start.is_none() {
                word_start = Some(idx);
            }
        }
        if let Some(start) = word_start {
            self.place_word(node, start, &text[start..]);
        }
    }

    fn place_word(&mut self, node: NodeId, start: usize, word: &str) {
        let width = UnicodeWidthStr::width(word);
        let mut space = usize::from(self.pending_space && self.x > self.indent);
        if self.x + space + width > self.width && self.x > self.indent {
            self.hard_break();
            space = 0;
        }
        self.x += space;
        self.pending_space = false;

        if width <= self.width.saturating_sub(self.x) {
            self.push_run(node, start..start + word.len(), width);
            return;
        }

        // Longer than a whole line: split on character boundaries.
        let mut piece_start = 0usize;
        let mut piece_width = 0usize;
        for (idx, ch) in word.char_indices() {
            let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
            if self.x + piece_width + ch_width > self.width && idx > piece_start {
                self.push_run(node, start + piece_start..start + idx, piece_width);
                self.hard_break();
                piece_start = idx;
                piece_width = 0;
            }
            piece_width += ch_width;
        }
        if piece_start < word.len() {
            self.push_run(node, start + piece_start..start + word.len(), piece_width);
        }
    }

    fn layout_pre_text(&mut self, node: NodeId, text: &str) {
        let mut piece_start: Option<usize> = None;
        let mut piece_width = 0usize;
        for (idx, ch) in text.char_indices() {
            match ch {
                '\n' | '\t' | '\r' => {
                    if let Some(start) = piece_start.take() {
                        self.push_run(node, start..idx, piece_width);
                    }
                    piece_width = 0;
                    match ch {
                        '\n' => self.hard_break(),
                        '\t' => {
                            let column = self.x - self.indent;
                            self.x += TAB_STOP - column % TAB_STOP;
                        }
                        _ => {}
                    }
                }
                _ => {
                    let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
                    if self.x + piece_width + ch_width > self.width && self.x + piece_width > self.indent {
                        if let Some(start) = piece_start.take() {
                            self.push_run(node, start..idx, piece_width);
                        }
                        self.hard_break();
                        piece_width = 0;
                    }
                    if piece_start.is_none() {
                        piece_start = Some(idx);
                    }
                    piece_width += ch_width;
                }
            }
        }
        if let Some(start) = piece_start {
            self.push_run(node, start..text.len(), piece_width);
        }
    }
}

impl Layout {
    pub fn compute<T: ContentTree + ?Sized>(tree: &T, width: usize) -> Layout {
        let width = width.max(1);
        let mut flow = Flow {
            tree,
            width,
            line: 0,
            x: 0,
            indent: 0,
            pending_space: false,
            line_has_content: false,
            last_content_line: None,
            pre: 0,
            out: Layout {
                width,
                ..Layout::default()
            },
        };
        flow.layout_node(tree.root());
        let mut out = flow.out;
        out.height = out
            .runs
            .iter()
            .map(|r| r.line + 1)
            .chain(out.markers.iter().map(|m| m.line + 1))
            .max()
            .unwrap_or(0);
        out
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn element_box(&self, node: NodeId) -> Option<Rect> {
        self.boxes.get(&node).copied()
    }

    /// One rect per visual line the byte range touches.
    pub fn range_rects(
        &self,
        node: NodeId,
        text: &str,
        range: Range<usize>,
    ) -> Result<Vec<Rect>, GeometryError> {
        let Some(indices) = self.text_runs.get(&node) else {
            return Err(GeometryError::NoBox(node));
        };
        let mut per_line: Vec<(usize, usize, usize)> = Vec::new();
        for run in indices.iter().filter_map(|idx| self.runs.get(*idx)) {
            let start = range.start.max(run.bytes.start);
            let end = range.end.min(run.bytes.end);
            if start >= end || run.bytes.end > text.len() {
                continue;
            }
            let Some(lead) = text.get(run.bytes.start..start) else {
                continue;
            };
            let Some(covered) = text.get(start..end) else {
                continue;
            };
            let left = run.x + UnicodeWidthStr::width(lead);
            let right = left + UnicodeWidthStr::width(covered);
            match per_line.iter_mut().find(|(line, _, _)| *line == run.line) {
                Some(entry) => {
                    entry.1 = entry.1.min(left);
                    entry.2 = entry.2.max(right);
                }
                None => per_line.push((run.line, left, right)),
            }
        }
        per_line.sort_by_key(|(line, _, _)| *line);
        Ok(per_line
            .into_iter()
            .map(|(line, left, right)| Rect::new(left, line, right - left, 1))
            .collect())
    }

    /// Deepest laid-out element whose box contains `point`.
    pub fn element_at<T: ContentTree + ?Sized>(&self, tree: &T, point: Point) -> Option<NodeId> {
        let mut hit = None;
        for node in &self.boxed {
            if tree.element(*node).is_none() {
                continue;
            }
            if self.boxes.get(node).map(|r| r.contains(point)).unwrap_or(false) {
                hit = Some(*node);
            }
        }
        hit
    }

    /// Text covered by the reading-order span between two points, inclusive.
    pub fn text_between<T: ContentTree + ?Sized>(&self, tree: &T, from: Point, to: Point) -> String {
        let (start, end) = if from <= to { (from, to) } else { (to, from) };
        let mut out = String::new();
        let mut last: Option<(usize, usize)> = None;
        for run in &self.runs {
            if run.line < start.y || run.line > end.y {
                continue;
            }
            let Some(text) = tree.text(run.node).and_then(|t| t.get(run.bytes.clone())) else {
                continue;
            };
            let mut column = run.x;
            let mut taken = String::new();
            let mut taken_from = None;
            for ch in text.chars() {
                let pos = Point::new(column, run.line);
                if pos >= start && pos <= end {
                    taken_from.get_or_insert(column);
                    taken.push(ch);
                }
                column += UnicodeWidthChar::width(ch).unwrap_or(0);
            }
            let Some(left) = taken_from else {
                continue;
            };
            if let Some((line, right)) = last {
                if line != run.line {
                    out.push('\n');
                } else if left > right {
                    out.push(' ');
                }
            }
            out.push_str(&taken);
            last = Some((run.line, left + UnicodeWidthStr::width(taken.as_str())));
        }
        out
    }

    /// Runs and markers bucketed per line, left to right.
    pub fn lines(&self) -> Vec<Vec<Piece>> {
        let mut lines: Vec<Vec<(usize, Piece)>> = vec![Vec::new(); self.height];
        for (idx, run) in self.runs.iter().enumerate() {
            if let Some(line) = lines.get_mut(run.line) {
                line.push((run.x, Piece::Run(idx)));
            }
        }
        for (idx, marker) in self.markers.iter().enumerate() {
            if let Some(line) = lines.get_mut(marker.line) {
                line.push((marker.x, Piece::Marker(idx)));
            }
        }
        lines
            .into_iter()
            .map(|mut line| {
                line.sort_by_key(|(x, _)| *x);
                line.into_iter().map(|(_, piece)| piece).collect()
            })
            .collect()
    }
}

/// Whether the text of `node` is actually drawn (not `visibility: hidden`
/// and not under a fully transparent ancestor).
pub fn is_painted<T: ContentTree + ?Sized>(tree: &T, node: NodeId) -> bool {
    let mut current = tree.parent_element(node);
    let mut nearest = true;
    while let Some(id) = current {
        let Ok(style) = tree.computed_style(id) else {
            return true;
        };
        if nearest && style.visibility_hidden {
            return false;
        }
        if style.opacity <= 0.0 {
            return false;
        }
        nearest = false;
        current = tree.parent_element(id);
    }
    true
}

/// Page text as plain lines, the way the terminal view draws it.
pub fn plain_lines<T: ContentTree + ?Sized>(tree: &T, layout: &Layout) -> Vec<String> {
    layout
        .lines()
        .into_iter()
        .map(|pieces| {
            let mut line = String::new();
            let mut column = 0usize;
            for piece in pieces {
                let (x, text, width) = match piece {
                    Piece::Run(idx) => {
                        let run = &layout.runs[idx];
                        let text = tree
                            .text(run.node)
                            .and_then(|t| t.get(run.bytes.clone()))
                            .unwrap_or_default();
                        let text = if is_painted(tree, run.node) {
                            text.to_string()
                        } else {
                            " ".repeat(run.width)
                        };
                        (run.x, text, run.width)
                    }
                    Piece::Marker(idx) => {
                        let marker = &layout.markers[idx];
                        let width = UnicodeWidthStr::width(marker.text.as_str());
                        (marker.x, marker.text.clone(), width)
                    }
                };
                if x > column {
                    line.push_str(&" ".repeat(x - column));
                    column = x;
                }
                line.push_str(&text);
                column += width;
            }
            line.trim_end().to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Point, Rect, plain_lines};
    use crate::dom::ContentTree;
    use crate::page::parse_html_with_width;

    #[test]
    fn paragraphs_are_separated_by_blank_lines() {
        let doc = parse_html_with_width("<h1>Title</h1><p>Hello world</p><p>Bye</p>", 40);
        let lines = plain_lines(&doc, doc.layout());
        assert_eq!(lines, vec!["Title", "", "Hello world", "", "Bye"]);
    }

    #[test]
    fn words_wrap_at_width() {
        let doc = parse_html_with_width("<p>alpha beta gamma</p>", 11);
        let lines = plain_lines(&doc, doc.layout());
        assert_eq!(lines, vec!["alpha beta", "gamma"]);
    }

    #[test]
    fn wrapped_range_yields_one_rect_per_line() {
        let doc = parse_html_with_width("<p>alpha beta gamma</p>", 11);
        let p = doc.first_element_by_tag("p").expect("p");
        let text = doc.children(p)[0];
        let rects = doc.client_rects(text, 6..16).expect("rects");
        assert_eq!(rects, vec![Rect::new(6, 0, 4, 1), Rect::new(0, 1, 5, 1)]);
    }

    #[test]
    fn list_items_get_markers_and_indent() {
        let doc = parse_html_with_width("<ol><li>one</li><li>two</li></ol><ul><li>x</li></ul>", 40);
        let lines = plain_lines(&doc, doc.layout());
        assert_eq!(lines, vec!["  1. one", "  2. two", "", "  • x"]);
    }

    #[test]
    fn lists_are_spaced_from_headings_but_not_when_nested() {
        let doc = parse_html_with_width(
            "<h1>Title</h1><ul><li>one<ul><li>inner</li></ul></li></ul>",
            40,
        );
        let lines = plain_lines(&doc, doc.layout());
        assert_eq!(lines, vec!["Title", "", "  • one", "      • inner"]);
    }

    #[test]
    fn hidden_elements_have_empty_boxes() {
        let doc = parse_html_with_width(r#"<p>shown</p><p style="display:none">gone</p>"#, 40);
        let hidden = doc
            .preorder(doc.body())
            .into_iter()
            .filter(|id| doc.element(*id).map(|e| e.tag == "p").unwrap_or(false))
            .nth(1)
            .expect("second p");
        let rect = doc.bounding_rect(hidden).expect("rect");
        assert!(!rect.has_area());
    }

    #[test]
    fn element_at_finds_deepest_element() {
        let doc = parse_html_with_width("<div><p>Hello <b>bold</b></p></div>", 40);
        let b = doc.first_element_by_tag("b").expect("b");
        let p = doc.first_element_by_tag("p").expect("p");
        assert_eq!(doc.element_at(Point::new(7, 0)), Some(b));
        assert_eq!(doc.element_at(Point::new(1, 0)), Some(p));
        assert_eq!(doc.element_at(Point::new(30, 5)), None);
    }

    #[test]
    fn text_between_follows_reading_order() {
        let doc = parse_html_with_width("<p>alpha beta gamma</p>", 11);
        assert_eq!(doc.text_between(Point::new(6, 0), Point::new(2, 1)), "beta\ngam");
        assert_eq!(doc.text_between(Point::new(2, 1), Point::new(6, 0)), "beta\ngam");
    }

    #[test]
    fn preformatted_text_keeps_lines() {
        let doc = parse_html_with_width("<pre>a  b\n\tc</pre>", 40);
        let lines = plain_lines(&doc, doc.layout());
        assert_eq!(lines, vec!["a  b", "    c"]);
    }
}
