use crate::dom::{ContentTree, Mutation, NodeId};
use crate::filter::is_eligible;
use crate::locate::{LiteralFinder, candidate_text_nodes};
use crate::rules::Rule;
use crate::selector::Selector;
use std::sync::mpsc::Receiver;
use tracing::{debug, info};

/// Runs one rule under `root`. Returns the number of text nodes rewritten.
///
/// Only eligibility is checked here: rules also cover text that is not
/// visible yet, and no geometry is queried.
pub fn apply_rule<T: ContentTree + ?Sized>(tree: &mut T, rule: &Rule, root: NodeId) -> usize {
    let selector = match Selector::parse(&rule.selector) {
        Ok(selector) => selector,
        Err(err) => {
            debug!(selector = %rule.selector, %err, "skipping rule with invalid selector");
            return 0;
        }
    };
    let Some(target) = selector.resolve(&*tree, root) else {
        return 0;
    };
    let Some(finder) = LiteralFinder::new(&rule.original) else {
        return 0;
    };

    let nodes = candidate_text_nodes(&*tree, target, |t, parent| is_eligible(t, parent));
    let mut changed = 0;
    for node in nodes {
        let Some(text) = tree.text(node) else {
            continue;
        };
        if !finder.is_match(text) {
            continue;
        }
        let new = finder.replace_all(text, &rule.replacement).into_owned();
        if tree.set_text(node, new) {
            changed += 1;
        }
    }
    changed
}

/// Runs every rule of `site` under `root`, in stored order.
pub fn apply_all<T: ContentTree + ?Sized>(
    tree: &mut T,
    rules: &[Rule],
    site: &str,
    root: NodeId,
) -> usize {
    rules
        .iter()
        .filter(|rule| rule.site == site)
        .map(|rule| apply_rule(&mut *tree, rule, root))
        .sum()
}

/// Drains pending mutations and runs the site's rules on each inserted
/// element that is still attached.
pub fn process_mutations<T: ContentTree + ?Sized>(
    rx: &Receiver<Mutation>,
    tree: &mut T,
    rules: &[Rule],
    site: &str,
) -> usize {
    let mut roots: Vec<NodeId> = Vec::new();
    for mutation in rx.try_iter() {
        match mutation {
            Mutation::SubtreeInserted(node) => {
                if !roots.contains(&node) {
                    roots.push(node);
                }
            }
        }
    }
    if roots.is_empty() {
        return 0;
    }

    let mut changed = 0;
    for root in &roots {
        if tree.element(*root).is_none() || !tree.is_connected(*root) {
            continue;
        }
        changed += apply_all(&mut *tree, rules, site, *root);
    }
    info!(roots = roots.len(), changed, "processed inserted content");
    changed
}

#[cfg(test)]
mod tests {
    use super::{apply_all, process_mutations};
    use crate::dom::{ContentTree, Element};
    use crate::page::parse_html;
    use crate::rules::Rule;

    #[test]
    fn rule_scoped_to_first_paragraph_leaves_the_second_alone() {
        let mut doc = parse_html("<p>Hello</p><p>Hello</p>");
        let rules = vec![Rule::new("Hello", "Hi", "s", "html > body > p")];
        let body = doc.body();
        assert_eq!(apply_all(&mut doc, &rules, "s", body), 1);
        assert_eq!(doc.rendered_text(body), "Hi\nHello");
    }

    #[test]
    fn other_sites_and_broken_selectors_are_ignored() {
        let mut doc = parse_html("<p>Hello</p>");
        let rules = vec![
            Rule::new("Hello", "Hi", "other", "p"),
            Rule::new("Hello", "Hey", "s", "p[oops"),
            Rule::new("Hello", "Yo", "s", "article"),
        ];
        let body = doc.body();
        assert_eq!(apply_all(&mut doc, &rules, "s", body), 0);
        assert_eq!(doc.rendered_text(body), "Hello");
    }

    #[test]
    fn hidden_text_is_still_rewritten_but_scripts_are_not() {
        let mut doc = parse_html(
            r#"<div><span style="display:none">secret Hello</span><script>Hello()</script></div>"#,
        );
        let rules = vec![Rule::new("hello", "Hi", "s", "div")];
        let body = doc.body();
        assert_eq!(apply_all(&mut doc, &rules, "s", body), 1);
        let span = doc.first_element_by_tag("span").expect("span");
        let script = doc.first_element_by_tag("script").expect("script");
        assert_eq!(doc.text(doc.children(span)[0]), Some("secret Hi"));
        assert_eq!(doc.text(doc.children(script)[0]), Some("Hello()"));
    }

    #[test]
    fn applying_twice_changes_nothing_more() {
        let mut doc = parse_html("<p>Hello world</p>");
        let rules = vec![Rule::new("Hello", "Hi", "s", "p")];
        let body = doc.body();
        assert_eq!(apply_all(&mut doc, &rules, "s", body), 1);
        let once = doc.rendered_text(body);
        assert_eq!(apply_all(&mut doc, &rules, "s", body), 0);
        assert_eq!(doc.rendered_text(body), once);
    }

    #[test]
    fn inserted_subtrees_are_converted_on_drain() {
        let mut doc = parse_html("<p>static</p>");
        let rx = doc.subscribe();
        let rules = vec![Rule::new("Hello", "Hi", "s", "p")];

        let div = doc.create_element(Element::new("div"));
        let p = doc.create_element(Element::new("p"));
        let text = doc.create_text("Hello there");
        doc.append_child(p, text);
        doc.append_child(div, p);
        let body = doc.body();
        doc.append_child(body, div);

        assert_eq!(process_mutations(&rx, &mut doc, &rules, "s"), 1);
        assert_eq!(doc.text(text), Some("Hi there"));
        assert_eq!(process_mutations(&rx, &mut doc, &rules, "s"), 0);
    }

    #[test]
    fn detached_and_text_roots_are_skipped() {
        let mut doc = parse_html("<p>x</p>");
        let rx = doc.subscribe();
        let rules = vec![Rule::new("Hello", "Hi", "s", "p")];
        let body = doc.body();
        let text = doc.create_text("Hello");
        doc.append_child(body, text);
        let p = doc.create_element(Element::new("p"));
        let inner = doc.create_text("Hello");
        doc.append_child(p, inner);
        doc.append_child(body, p);
        doc.remove(p);
        assert_eq!(process_mutations(&rx, &mut doc, &rules, "s"), 0);
        assert_eq!(doc.text(text), Some("Hello"));
    }
}
