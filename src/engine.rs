use crate::autoapply;
use crate::dom::{ContentTree, Document, Mutation};
use crate::message::{Request, Response};
use crate::picker::{PanelButton, Picker, PickerEvent, PickerOutcome};
use crate::replace::{ApplyOutcome, Replacer};
use crate::rules::{Rule, RuleStore, Storage};
use anyhow::Result;
use std::sync::mpsc::Receiver;
use tracing::{debug, info};

/// Everything that acts on one displayed page: its rules, the undo
/// snapshot, live previews and the picker session.
pub struct Engine {
    site: String,
    store: RuleStore,
    replacer: Replacer,
    picker: Picker,
    mutations: Option<Receiver<Mutation>>,
    auto_apply: bool,
}

impl Engine {
    pub fn new(site: &str, storage: Box<dyn Storage>) -> Self {
        Self {
            site: site.to_string(),
            store: RuleStore::new(storage),
            replacer: Replacer::new(),
            picker: Picker::new(),
            mutations: None,
            auto_apply: true,
        }
    }

    pub fn with_auto_apply(mut self, enabled: bool) -> Self {
        self.auto_apply = enabled;
        self
    }

    /// Loads the rules, subscribes to the document and runs the site's rules
    /// over the whole body once. Returns how many text nodes changed.
    pub fn init(&mut self, doc: &mut Document) -> Result<usize> {
        self.store.load()?;
        self.mutations = Some(doc.subscribe());
        let changed = self.apply_all(doc);
        info!(site = %self.site, changed, "engine ready");
        Ok(changed)
    }

    pub fn picker(&self) -> &Picker {
        &self.picker
    }

    pub fn picker_mut(&mut self) -> &mut Picker {
        &mut self.picker
    }

    pub fn previews(&self) -> &[crate::layout::Rect] {
        self.replacer.previews()
    }

    /// The site's rules with their global indices.
    pub fn site_rules(&self) -> Vec<(usize, &Rule)> {
        self.store.for_site(&self.site).collect()
    }

    /// Re-reads storage and re-runs the rules over the body.
    pub fn refresh(&mut self, doc: &mut Document) -> Result<usize> {
        self.store.load()?;
        if let Some(panel) = self.picker.panel_mut() {
            let still_there = panel
                .selected_rule
                .map(|idx| idx < self.store.rules().len())
                .unwrap_or(true);
            if !still_there {
                panel.selected_rule = None;
            }
        }
        Ok(self.apply_all(doc))
    }

    pub fn apply_all(&mut self, doc: &mut Document) -> usize {
        if !self.auto_apply {
            return 0;
        }
        let body = doc.body();
        let changed = autoapply::apply_all(doc, self.store.rules(), &self.site, body);
        if changed > 0 {
            doc.ensure_layout();
        }
        changed
    }

    /// Runs the rules on content inserted since the last call.
    pub fn process_mutations(&mut self, doc: &mut Document) -> usize {
        let Some(rx) = self.mutations.as_ref() else {
            return 0;
        };
        if !self.auto_apply {
            // Keep the queue from growing.
            rx.try_iter().for_each(drop);
            return 0;
        }
        let changed = autoapply::process_mutations(rx, doc, self.store.rules(), &self.site);
        if changed > 0 {
            doc.ensure_layout();
        }
        changed
    }

    pub fn preview(&mut self, doc: &mut Document, token: &str, scope: Option<&str>) -> usize {
        doc.ensure_layout();
        self.replacer.preview(doc, token, scope)
    }

    /// Replaces on the page and records the rule, even when nothing matched
    /// yet, so later content is covered too.
    pub fn apply(
        &mut self,
        doc: &mut Document,
        token: &str,
        scope: Option<&str>,
        replacement: &str,
    ) -> Result<Option<ApplyOutcome>> {
        doc.ensure_layout();
        let Some(outcome) = self.replacer.apply(doc, token, scope, replacement) else {
            return Ok(None);
        };
        doc.ensure_layout();
        let rule = Rule::new(token, replacement.trim(), &self.site, scope.unwrap_or_default());
        self.store.upsert(rule)?;
        Ok(Some(outcome))
    }

    pub fn undo(&mut self, doc: &mut Document) -> usize {
        let restored = self.replacer.undo(doc);
        if restored > 0 {
            doc.ensure_layout();
        }
        restored
    }

    /// Deletes by global index. Text already replaced on the page stays.
    pub fn remove_rule(&mut self, index: usize) -> Result<Option<Rule>> {
        let removed = self.store.remove(index)?;
        if let Some(rule) = &removed {
            info!(index, original = %rule.original, "rule deleted");
        }
        Ok(removed)
    }

    pub fn start_selection(&mut self) -> bool {
        self.picker.start()
    }

    pub fn stop_selection(&mut self) {
        self.picker.stop();
        self.replacer.clear_previews();
    }

    pub fn handle_picker_event(&mut self, doc: &Document, event: PickerEvent) -> PickerOutcome {
        let outcome = self.picker.handle(doc, event);
        if outcome == PickerOutcome::Exited {
            self.replacer.clear_previews();
        }
        outcome
    }

    /// Runs a panel control. Returns a short status for the user.
    pub fn panel_action(&mut self, doc: &mut Document, button: PanelButton) -> Result<String> {
        let Some(panel) = self.picker.panel().cloned() else {
            return Ok(String::new());
        };
        let scope = Some(panel.scope.as_str());
        let status = match button {
            PanelButton::Preview => {
                let found = self.preview(doc, &panel.token, scope);
                format!("{found} match(es) for \"{}\"", panel.token)
            }
            PanelButton::Apply => match self.apply(doc, &panel.token, scope, &panel.input)? {
                Some(outcome) => format!(
                    "Replaced {} occurrence(s) of \"{}\"; rule saved",
                    outcome.matches, panel.token
                ),
                None => "Type a replacement first".to_string(),
            },
            PanelButton::Undo if !self.replacer.has_snapshot() => "Nothing to undo".to_string(),
            PanelButton::Undo => {
                let restored = self.undo(doc);
                format!("Restored {restored} node(s)")
            }
            PanelButton::Done => {
                self.replacer.clear_previews();
                self.picker.done();
                "Pick another element".to_string()
            }
        };
        debug!(?button, %status, "panel action");
        Ok(status)
    }

    pub fn handle_request(&mut self, doc: &mut Document, request: Request) -> Response {
        debug!(?request, "request");
        match request {
            Request::StartSelection => {
                self.start_selection();
                Response::ok()
            }
            Request::RefreshReplacements => match self.refresh(doc) {
                Ok(_) => Response::ok(),
                Err(err) => Response::failed(format!("{err:#}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Engine;
    use crate::dom::{ContentTree, Document, Element};
    use crate::layout::Point;
    use crate::message::{Request, Response};
    use crate::page::parse_html;
    use crate::picker::{PanelButton, PickerEvent, PickerOutcome, PickerState};
    use crate::rules::{MemoryStorage, Rule, Storage};

    fn boot(doc: &mut Document, storage: &MemoryStorage) -> Engine {
        let mut engine = Engine::new("example.com", Box::new(storage.clone()));
        engine.init(doc).expect("init");
        engine
    }

    #[test]
    fn apply_replaces_and_stores_one_rule() {
        let storage = MemoryStorage::default();
        let mut doc = parse_html("<p>Hello world</p>");
        let mut engine = boot(&mut doc, &storage);
        let outcome = engine
            .apply(&mut doc, "Hello", Some("html > body > p"), "Hi")
            .expect("apply")
            .expect("outcome");
        assert_eq!(outcome.matches, 1);
        assert_eq!(doc.rendered_text(doc.body()), "Hi world");
        assert_eq!(
            storage.snapshot(),
            vec![Rule::new("Hello", "Hi", "example.com", "html > body > p")]
        );
    }

    #[test]
    fn repeated_applies_keep_one_rule_with_the_last_replacement() {
        let storage = MemoryStorage::default();
        let mut doc = parse_html("<p>Hello</p>");
        let mut engine = boot(&mut doc, &storage);
        for replacement in ["A", "B", "C"] {
            engine
                .apply(&mut doc, "Hello", Some("p"), replacement)
                .expect("apply");
            engine.undo(&mut doc);
        }
        assert_eq!(storage.snapshot(), vec![Rule::new("Hello", "C", "example.com", "p")]);
    }

    #[test]
    fn rule_is_saved_even_without_matches() {
        let storage = MemoryStorage::default();
        let mut doc = parse_html("<p>nothing here</p>");
        let mut engine = boot(&mut doc, &storage);
        let outcome = engine
            .apply(&mut doc, "Hello", Some("p"), "Hi")
            .expect("apply")
            .expect("outcome");
        assert_eq!(outcome.matches, 0);
        assert_eq!(storage.snapshot().len(), 1);
    }

    #[test]
    fn deleted_rule_is_gone_for_a_fresh_engine() {
        let storage = MemoryStorage::default();
        storage
            .save(&[
                Rule::new("Hello", "Hi", "example.com", "p"),
                Rule::new("world", "earth", "example.com", "p"),
            ])
            .expect("seed");
        let mut doc = parse_html("<p>Hello world</p>");
        let mut engine = boot(&mut doc, &storage);
        assert_eq!(doc.rendered_text(doc.body()), "Hi earth");

        let removed = engine.remove_rule(0).expect("remove").expect("rule");
        assert_eq!(removed.original, "Hello");
        assert_eq!(storage.snapshot().len(), 1);
        assert!(engine.remove_rule(5).expect("remove").is_none());

        let mut fresh_doc = parse_html("<p>Hello world</p>");
        let fresh = boot(&mut fresh_doc, &storage);
        assert_eq!(fresh.site_rules().len(), 1);
        assert_eq!(fresh_doc.rendered_text(fresh_doc.body()), "Hello earth");
    }

    #[test]
    fn inserted_content_is_converted_after_init() {
        let storage = MemoryStorage::default();
        storage
            .save(&[Rule::new("Hello", "Hi", "example.com", "p")])
            .expect("seed");
        let mut doc = parse_html("<div></div>");
        let mut engine = boot(&mut doc, &storage);
        let p = doc.create_element(Element::new("p"));
        let text = doc.create_text("Hello again");
        doc.append_child(p, text);
        let body = doc.body();
        doc.append_child(body, p);
        assert_eq!(engine.process_mutations(&mut doc), 1);
        assert_eq!(doc.text(text), Some("Hi again"));
    }

    #[test]
    fn rules_of_other_sites_do_not_apply() {
        let storage = MemoryStorage::default();
        storage
            .save(&[Rule::new("Hello", "Hi", "elsewhere.org", "p")])
            .expect("seed");
        let mut doc = parse_html("<p>Hello</p>");
        let engine = boot(&mut doc, &storage);
        assert!(engine.site_rules().is_empty());
        assert_eq!(doc.rendered_text(doc.body()), "Hello");
    }

    #[test]
    fn requests_start_selection_and_refresh() {
        let storage = MemoryStorage::default();
        let mut doc = parse_html("<p>Hello</p>");
        let mut engine = boot(&mut doc, &storage);
        assert_eq!(engine.handle_request(&mut doc, Request::StartSelection), Response::ok());
        assert_eq!(engine.picker().state(), PickerState::Selecting);

        storage
            .save(&[Rule::new("Hello", "Hi", "example.com", "p")])
            .expect("external write");
        assert_eq!(
            engine.handle_request(&mut doc, Request::RefreshReplacements),
            Response::ok()
        );
        assert_eq!(doc.rendered_text(doc.body()), "Hi");
    }

    #[test]
    fn panel_flow_previews_applies_and_undoes() {
        let storage = MemoryStorage::default();
        let mut doc = parse_html("<p>Hello world</p><p>Hello there</p>");
        let mut engine = boot(&mut doc, &storage);
        engine.start_selection();
        engine.handle_picker_event(&doc, PickerEvent::PointerDown(Point::new(0, 0)));
        engine.handle_picker_event(&doc, PickerEvent::PointerDrag(Point::new(4, 0)));
        let outcome = engine.handle_picker_event(&doc, PickerEvent::Click(Point::new(4, 0)));
        assert_eq!(outcome, PickerOutcome::Opened);
        let panel = engine.picker_mut().panel_mut().expect("panel");
        assert_eq!((panel.token.as_str(), panel.scope.as_str()), ("Hello", "html > body > p"));
        panel.input = "Hi".to_string();

        engine.panel_action(&mut doc, PanelButton::Preview).expect("preview");
        assert_eq!(engine.previews().len(), 1);
        engine.panel_action(&mut doc, PanelButton::Apply).expect("apply");
        assert!(engine.previews().is_empty());
        assert_eq!(doc.rendered_text(doc.body()), "Hi world\nHello there");
        engine.panel_action(&mut doc, PanelButton::Undo).expect("undo");
        assert_eq!(doc.rendered_text(doc.body()), "Hello world\nHello there");

        engine.panel_action(&mut doc, PanelButton::Done).expect("done");
        assert_eq!(engine.picker().state(), PickerState::Selecting);
        engine.handle_picker_event(&doc, PickerEvent::Escape);
        assert_eq!(engine.picker().state(), PickerState::Idle);
    }
}
