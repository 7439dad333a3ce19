use crate::dom::{ContentTree, NodeId};
use cssparser::serialize_identifier;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("unexpected `{found}` at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("expected a name at offset {0}")]
    MissingName(usize),
    #[error("invalid :nth-of-type argument `{0}`")]
    BadNth(String),
    #[error("unsupported pseudo-class `:{0}`")]
    UnsupportedPseudo(String),
    #[error("selector ends with a combinator")]
    DanglingCombinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    nth_of_type: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    /// Relation to the previous step; ignored on the first one.
    combinator: Combinator,
    compound: Compound,
}

/// The subset of CSS selectors that scope paths are written in: type, `#id`,
/// `.class`, `:nth-of-type(n)`, joined by descendant or `>` combinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    steps: Vec<Step>,
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        SelectorParser::new(input).parse()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, step) in self.steps.iter().enumerate() {
            if idx > 0 {
                match step.combinator {
                    Combinator::Child => f.write_str(" > ")?,
                    Combinator::Descendant => f.write_str(" ")?,
                }
            }
            let c = &step.compound;
            match &c.tag {
                Some(tag) => f.write_str(tag)?,
                None if c.id.is_none() && c.classes.is_empty() => f.write_str("*")?,
                None => {}
            }
            if let Some(id) = &c.id {
                f.write_str("#")?;
                serialize_identifier(id, f)?;
            }
            for class in &c.classes {
                f.write_str(".")?;
                serialize_identifier(class, f)?;
            }
            if let Some(n) = c.nth_of_type {
                write!(f, ":nth-of-type({n})")?;
            }
        }
        Ok(())
    }
}

struct SelectorParser<'a> {
    chars: Vec<(usize, char)>,
    pos: usize,
    input: &'a str,
}

impl<'a> SelectorParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().collect(),
            pos: 0,
            input,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len())
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn parse(mut self) -> Result<Selector, SelectorError> {
        let mut steps = Vec::new();
        self.skip_ws();
        if self.peek().is_none() {
            return Err(SelectorError::Empty);
        }
        let mut combinator = Combinator::Descendant;
        loop {
            let compound = self.compound()?;
            steps.push(Step {
                combinator,
                compound,
            });
            let had_ws = self.skip_ws();
            match self.peek() {
                None => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.peek().is_none() {
                        return Err(SelectorError::DanglingCombinator);
                    }
                    combinator = Combinator::Child;
                }
                Some(_) if had_ws => combinator = Combinator::Descendant,
                Some(found) => {
                    return Err(SelectorError::Unexpected {
                        found,
                        offset: self.offset(),
                    });
                }
            }
        }
        Ok(Selector { steps })
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let mut compound = Compound::default();
        let start = self.pos;
        match self.peek() {
            Some('*') => self.pos += 1,
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some(':') => {
                    self.pos += 1;
                    let name = self.ident()?.to_ascii_lowercase();
                    match name.as_str() {
                        "nth-of-type" => compound.nth_of_type = Some(self.nth_argument()?),
                        "first-of-type" => compound.nth_of_type = Some(1),
                        _ => return Err(SelectorError::UnsupportedPseudo(name)),
                    }
                }
                _ => break,
            }
        }
        if self.pos == start {
            return match self.peek() {
                Some(found) => Err(SelectorError::Unexpected {
                    found,
                    offset: self.offset(),
                }),
                None => Err(SelectorError::DanglingCombinator),
            };
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.pos += 1;
                match self.peek() {
                    Some(h) if h.is_ascii_hexdigit() => out.push(self.hex_escape()),
                    Some(escaped) => {
                        out.push(escaped);
                        self.pos += 1;
                    }
                    None => break,
                }
            } else if is_ident_char(c) {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(SelectorError::MissingName(self.offset()));
        }
        Ok(out)
    }

    /// Up to six hex digits and one optional trailing whitespace, as in
    /// `\31 abc`.
    fn hex_escape(&mut self) -> char {
        let mut code = 0u32;
        let mut digits = 0;
        while digits < 6 {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    code = code * 16 + d;
                    digits += 1;
                    self.pos += 1;
                }
                None => break,
            }
        }
        if self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
        char::from_u32(code)
            .filter(|c| *c != '\0')
            .unwrap_or('\u{FFFD}')
    }

    fn nth_argument(&mut self) -> Result<usize, SelectorError> {
        if self.peek() != Some('(') {
            return Err(SelectorError::BadNth(String::new()));
        }
        self.pos += 1;
        let mut raw = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == ')' {
                return raw
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or(SelectorError::BadNth(raw));
            }
            raw.push(c);
        }
        Err(SelectorError::BadNth(raw))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}

fn escape_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len());
    match serialize_identifier(ident, &mut out) {
        Ok(()) => out,
        Err(_) => ident.to_string(),
    }
}

fn nth_of_type<T: ContentTree + ?Sized>(tree: &T, node: NodeId, tag: &str) -> usize {
    let Some(parent) = tree.parent(node) else {
        return 1;
    };
    let mut nth = 1;
    for sibling in tree.children(parent) {
        if *sibling == node {
            break;
        }
        if tree.element(*sibling).map(|e| e.tag == tag).unwrap_or(false) {
            nth += 1;
        }
    }
    nth
}

impl Compound {
    fn matches<T: ContentTree + ?Sized>(&self, tree: &T, node: NodeId) -> bool {
        let Some(el) = tree.element(node) else {
            return false;
        };
        if let Some(tag) = &self.tag {
            if el.tag != *tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| el.has_class(c)) {
            return false;
        }
        if let Some(n) = self.nth_of_type {
            if nth_of_type(tree, node, &el.tag) != n {
                return false;
            }
        }
        true
    }
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        input.parse()
    }

    /// Matches against the whole document, like `Element.matches`.
    pub fn matches<T: ContentTree + ?Sized>(&self, tree: &T, node: NodeId) -> bool {
        self.matches_step(tree, node, self.steps.len() - 1)
    }

    fn matches_step<T: ContentTree + ?Sized>(&self, tree: &T, node: NodeId, idx: usize) -> bool {
        let step = &self.steps[idx];
        if !step.compound.matches(tree, node) {
            return false;
        }
        if idx == 0 {
            return true;
        }
        match step.combinator {
            Combinator::Child => tree
                .parent_element(node)
                .map(|p| self.matches_step(tree, p, idx - 1))
                .unwrap_or(false),
            Combinator::Descendant => {
                let mut current = tree.parent_element(node);
                while let Some(ancestor) = current {
                    if self.matches_step(tree, ancestor, idx - 1) {
                        return true;
                    }
                    current = tree.parent_element(ancestor);
                }
                false
            }
        }
    }

    /// First strict descendant of `root` in document order, like
    /// `querySelector`.
    pub fn query_first<T: ContentTree + ?Sized>(&self, tree: &T, root: NodeId) -> Option<NodeId> {
        tree.preorder(root)
            .into_iter()
            .skip(1)
            .find(|node| self.matches(tree, *node))
    }

    /// `root` itself when it matches, otherwise its first matching descendant.
    pub fn resolve<T: ContentTree + ?Sized>(&self, tree: &T, root: NodeId) -> Option<NodeId> {
        if self.matches(tree, root) {
            Some(root)
        } else {
            self.query_first(tree, root)
        }
    }
}

/// Structural path from the outermost element down to `node`. Stops early at
/// the nearest ancestor-or-self carrying an id; otherwise uses
/// `:nth-of-type` wherever a same-tag sibling precedes the element.
pub fn scope_path<T: ContentTree + ?Sized>(tree: &T, node: NodeId) -> Option<String> {
    tree.element(node)?;
    let mut path: Vec<String> = Vec::new();
    let mut current = Some(node);
    while let Some(id) = current {
        let Some(el) = tree.element(id) else {
            break;
        };
        let mut part = el.tag.clone();
        if let Some(el_id) = el.id() {
            part.push('#');
            part.push_str(&escape_ident(el_id));
            path.push(part);
            break;
        }
        let nth = nth_of_type(tree, id, &el.tag);
        if nth != 1 {
            part.push_str(&format!(":nth-of-type({nth})"));
        }
        path.push(part);
        current = tree.parent(id);
    }
    path.reverse();
    Some(path.join(" > "))
}

#[cfg(test)]
mod tests {
    use super::{Selector, SelectorError, scope_path};
    use crate::dom::ContentTree;
    use crate::page::parse_html;

    fn paragraphs(doc: &crate::dom::Document) -> Vec<crate::dom::NodeId> {
        doc.preorder(doc.body())
            .into_iter()
            .filter(|id| doc.element(*id).map(|e| e.tag == "p").unwrap_or(false))
            .collect()
    }

    #[test]
    fn scope_path_uses_positions_from_the_root() {
        let doc = parse_html("<p>a</p><div><p>b</p><p>c</p></div>");
        let ps = paragraphs(&doc);
        assert_eq!(scope_path(&doc, ps[0]).as_deref(), Some("html > body > p"));
        assert_eq!(
            scope_path(&doc, ps[2]).as_deref(),
            Some("html > body > div > p:nth-of-type(2)")
        );
    }

    #[test]
    fn scope_path_stops_at_nearest_id() {
        let doc = parse_html(r#"<main id="content:main"><section><p>x</p></section></main>"#);
        let p = paragraphs(&doc)[0];
        let path = scope_path(&doc, p).expect("path");
        assert_eq!(path, r"main#content\:main > section > p");
        let selector = Selector::parse(&path).expect("parse");
        assert_eq!(selector.query_first(&doc, doc.root()), Some(p));
    }

    #[test]
    fn ids_with_leading_digits_are_escaped_as_css() {
        let doc = parse_html(r#"<div id="1abc"><p>x</p></div>"#);
        let p = paragraphs(&doc)[0];
        let path = scope_path(&doc, p).expect("path");
        assert_eq!(path, r"div#\31 abc > p");
        let selector = Selector::parse(&path).expect("parse");
        assert_eq!(selector.to_string(), path);
        assert_eq!(selector.query_first(&doc, doc.root()), Some(p));
    }

    #[test]
    fn computed_paths_resolve_back_to_their_element() {
        let doc = parse_html(
            "<ul><li>1</li><li>2</li></ul><ul><li>3</li><li><p>4</p><p>5</p></li></ul>",
        );
        for node in doc.preorder(doc.body()) {
            if doc.element(node).is_none() {
                continue;
            }
            let path = scope_path(&doc, node).expect("path");
            let selector = Selector::parse(&path).expect("parse");
            assert_eq!(selector.query_first(&doc, doc.root()), Some(node), "{path}");
        }
    }

    #[test]
    fn descendant_and_class_selectors_match() {
        let doc = parse_html(r#"<div class="a b"><span><p>x</p></span></div><p>y</p>"#);
        let ps = paragraphs(&doc);
        let sel = Selector::parse("div.b p").expect("parse");
        assert!(sel.matches(&doc, ps[0]));
        assert!(!sel.matches(&doc, ps[1]));
        let child = Selector::parse("div > p").expect("parse");
        assert!(!child.matches(&doc, ps[0]));
    }

    #[test]
    fn resolve_prefers_the_root_itself() {
        let doc = parse_html("<div><div>inner</div></div>");
        let outer = doc.first_element_by_tag("div").expect("div");
        let sel = Selector::parse("div").expect("parse");
        assert_eq!(sel.resolve(&doc, outer), Some(outer));
        assert_ne!(sel.query_first(&doc, outer), Some(outer));
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        assert_eq!(Selector::parse("   "), Err(SelectorError::Empty));
        assert_eq!(Selector::parse("p >"), Err(SelectorError::DanglingCombinator));
        assert!(matches!(Selector::parse("p:hover"), Err(SelectorError::UnsupportedPseudo(_))));
        assert!(matches!(Selector::parse("p:nth-of-type(0)"), Err(SelectorError::BadNth(_))));
        assert!(matches!(Selector::parse("p[x]"), Err(SelectorError::Unexpected { .. })));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let sel = Selector::parse("html  >  body div#a\\.b.c:nth-of-type(3)").expect("parse");
        assert_eq!(sel.to_string(), "html > body div#a\\.b.c:nth-of-type(3)");
    }
}
