use crate::dom::{ContentTree, NodeId};
use crate::filter::{is_eligible, is_visible};
use crate::layout::{Point, Rect};
use crate::selector::scope_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerState {
    Idle,
    Selecting,
    PanelOpen,
}

/// Rule-creation panel opened on a picked element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panel {
    pub token: String,
    pub scope: String,
    pub input: String,
    /// Highlighted row in the saved-rules list, as a global rule index.
    pub selected_rule: Option<usize>,
}

impl Panel {
    fn new(token: String, scope: String) -> Self {
        Self {
            token,
            scope,
            input: String::new(),
            selected_rule: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelButton {
    Preview,
    Apply,
    Undo,
    Done,
}

impl PanelButton {
    pub const ALL: [PanelButton; 4] = [
        PanelButton::Preview,
        PanelButton::Apply,
        PanelButton::Undo,
        PanelButton::Done,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PanelButton::Preview => "Preview",
            PanelButton::Apply => "Apply",
            PanelButton::Undo => "Undo",
            PanelButton::Done => "Done",
        }
    }
}

/// Pointer and key input in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerEvent {
    PointerMove(Point),
    PointerDown(Point),
    PointerDrag(Point),
    Click(Point),
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerOutcome {
    /// Not for the picker; the page handles it.
    Passthrough,
    Consumed,
    Opened,
    /// Landed on the panel; the caller resolves which control.
    InPanel,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Drag {
    from: Point,
    to: Point,
}

#[derive(Debug)]
pub struct Picker {
    state: PickerState,
    hovered: Option<NodeId>,
    highlight: Option<Rect>,
    panel: Option<Panel>,
    panel_area: Option<Rect>,
    drag: Option<Drag>,
}

impl Default for Picker {
    fn default() -> Self {
        Self::new()
    }
}

impl Picker {
    pub fn new() -> Self {
        Self {
            state: PickerState::Idle,
            hovered: None,
            highlight: None,
            panel: None,
            panel_area: None,
            drag: None,
        }
    }

    pub fn state(&self) -> PickerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != PickerState::Idle
    }

    pub fn hovered(&self) -> Option<NodeId> {
        self.hovered
    }

    pub fn highlight(&self) -> Option<Rect> {
        self.highlight
    }

    pub fn panel(&self) -> Option<&Panel> {
        self.panel.as_ref()
    }

    pub fn panel_mut(&mut self) -> Option<&mut Panel> {
        self.panel.as_mut()
    }

    /// Where the panel is drawn, in document coordinates. Clicks there never
    /// pick a target.
    pub fn set_panel_area(&mut self, area: Option<Rect>) {
        self.panel_area = area;
    }

    /// Current drag span, normalised to reading order.
    pub fn drag_span(&self) -> Option<(Point, Point)> {
        self.drag
            .filter(|d| d.from != d.to)
            .map(|d| if d.from <= d.to { (d.from, d.to) } else { (d.to, d.from) })
    }

    pub fn start(&mut self) -> bool {
        if self.state != PickerState::Idle {
            return false;
        }
        self.state = PickerState::Selecting;
        true
    }

    pub fn stop(&mut self) {
        self.state = PickerState::Idle;
        self.hovered = None;
        self.highlight = None;
        self.panel = None;
        self.panel_area = None;
        self.drag = None;
    }

    /// Closes the panel and goes back to picking.
    pub fn done(&mut self) {
        if self.state == PickerState::Idle {
            return;
        }
        self.state = PickerState::Selecting;
        self.panel = None;
        self.panel_area = None;
        self.drag = None;
    }

    pub fn handle<T: ContentTree + ?Sized>(&mut self, tree: &T, event: PickerEvent) -> PickerOutcome {
        if self.state == PickerState::Idle {
            return PickerOutcome::Passthrough;
        }
        match event {
            PickerEvent::Escape => {
                self.stop();
                PickerOutcome::Exited
            }
            PickerEvent::PointerMove(point) => {
                if self.state == PickerState::Selecting {
                    self.track_hover(tree, point);
                }
                PickerOutcome::Consumed
            }
            PickerEvent::PointerDown(point) => {
                if self.in_panel(point) {
                    return PickerOutcome::InPanel;
                }
                self.drag = Some(Drag {
                    from: point,
                    to: point,
                });
                PickerOutcome::Consumed
            }
            PickerEvent::PointerDrag(point) => {
                if let Some(drag) = self.drag.as_mut() {
                    drag.to = point;
                }
                PickerOutcome::Consumed
            }
            PickerEvent::Click(point) => {
                if self.in_panel(point) {
                    self.drag = None;
                    return PickerOutcome::InPanel;
                }
                self.pick(tree, point)
            }
        }
    }

    fn in_panel(&self, point: Point) -> bool {
        self.state == PickerState::PanelOpen
            && self.panel_area.map(|area| area.contains(point)).unwrap_or(false)
    }

    fn track_hover<T: ContentTree + ?Sized>(&mut self, tree: &T, point: Point) {
        match tree.element_at(point) {
            Some(el) if is_eligible(tree, el) && is_visible(tree, el) => {
                self.hovered = Some(el);
                self.highlight = tree.bounding_rect(el).ok();
            }
            _ => {
                self.hovered = None;
                self.highlight = None;
            }
        }
    }

    fn pick<T: ContentTree + ?Sized>(&mut self, tree: &T, point: Point) -> PickerOutcome {
        let selected = self
            .drag_span()
            .map(|(from, to)| tree.text_between(from, to).trim().to_string())
            .unwrap_or_default();
        self.drag = None;

        let Some(el) = tree
            .element_at(point)
            .filter(|el| is_eligible(tree, *el) && is_visible(tree, *el))
        else {
            return PickerOutcome::Consumed;
        };
        let token = if selected.is_empty() {
            tree.rendered_text(el).trim().to_string()
        } else {
            selected
        };
        if token.is_empty() {
            return PickerOutcome::Consumed;
        }
        let Some(scope) = scope_path(tree, el) else {
            return PickerOutcome::Consumed;
        };

        self.panel = Some(Panel::new(token, scope));
        self.state = PickerState::PanelOpen;
        self.hovered = None;
        self.highlight = None;
        PickerOutcome::Opened
    }
}

#[cfg(test)]
mod tests {
    use super::{Picker, PickerEvent, PickerOutcome, PickerState};
    use crate::dom::ContentTree;
    use crate::layout::{Point, Rect};
    use crate::page::parse_html_with_width;

    #[test]
    fn idle_picker_lets_everything_through() {
        let doc = parse_html_with_width("<p>Hello</p>", 40);
        let mut picker = Picker::new();
        let outcome = picker.handle(&doc, PickerEvent::Click(Point::new(0, 0)));
        assert_eq!(outcome, PickerOutcome::Passthrough);
        assert_eq!(picker.state(), PickerState::Idle);
    }

    #[test]
    fn hover_tracks_the_element_box() {
        let doc = parse_html_with_width("<p>Hello world</p>", 40);
        let mut picker = Picker::new();
        picker.start();
        picker.handle(&doc, PickerEvent::PointerMove(Point::new(2, 0)));
        let p = doc.first_element_by_tag("p").expect("p");
        assert_eq!(picker.hovered(), Some(p));
        assert_eq!(picker.highlight(), doc.bounding_rect(p).ok());
        picker.handle(&doc, PickerEvent::PointerMove(Point::new(0, 30)));
        assert_eq!(picker.highlight(), None);
    }

    #[test]
    fn click_opens_panel_with_element_text() {
        let doc = parse_html_with_width("<p>First</p><p>  Hello world  </p>", 40);
        let mut picker = Picker::new();
        picker.start();
        let outcome = picker.handle(&doc, PickerEvent::Click(Point::new(1, 2)));
        assert_eq!(outcome, PickerOutcome::Opened);
        assert_eq!(picker.state(), PickerState::PanelOpen);
        let panel = picker.panel().expect("panel");
        assert_eq!(panel.token, "Hello world");
        assert_eq!(panel.scope, "html > body > p:nth-of-type(2)");
        assert_eq!(picker.highlight(), None);
    }

    #[test]
    fn drag_selection_wins_over_element_text() {
        let doc = parse_html_with_width("<p>Hello world</p>", 40);
        let mut picker = Picker::new();
        picker.start();
        picker.handle(&doc, PickerEvent::PointerDown(Point::new(6, 0)));
        picker.handle(&doc, PickerEvent::PointerDrag(Point::new(10, 0)));
        picker.handle(&doc, PickerEvent::Click(Point::new(10, 0)));
        assert_eq!(picker.panel().expect("panel").token, "world");
    }

    #[test]
    fn clicks_inside_the_panel_are_not_targets() {
        let doc = parse_html_with_width("<p>Hello</p><p>Other</p>", 40);
        let mut picker = Picker::new();
        picker.start();
        picker.handle(&doc, PickerEvent::Click(Point::new(0, 0)));
        picker.set_panel_area(Some(Rect::new(0, 2, 10, 3)));
        let outcome = picker.handle(&doc, PickerEvent::Click(Point::new(1, 2)));
        assert_eq!(outcome, PickerOutcome::InPanel);
        assert_eq!(picker.panel().expect("panel").token, "Hello");
    }

    #[test]
    fn empty_target_keeps_selecting() {
        let doc = parse_html_with_width("<p>Hello</p>", 40);
        let mut picker = Picker::new();
        picker.start();
        picker.handle(&doc, PickerEvent::Click(Point::new(0, 20)));
        assert_eq!(picker.state(), PickerState::Selecting);
    }

    #[test]
    fn editable_regions_cannot_be_picked() {
        let doc = parse_html_with_width(
            "<div contenteditable>Hello</div><div contenteditable><b>Bold</b></div>",
            40,
        );
        let mut picker = Picker::new();
        picker.start();
        let outcome = picker.handle(&doc, PickerEvent::Click(Point::new(1, 0)));
        assert_eq!(outcome, PickerOutcome::Consumed);
        assert_eq!(picker.state(), PickerState::Selecting);
        assert!(picker.panel().is_none());
        picker.handle(&doc, PickerEvent::Click(Point::new(1, 1)));
        assert!(picker.panel().is_none());
    }

    #[test]
    fn done_returns_to_selecting_and_escape_to_idle() {
        let doc = parse_html_with_width("<p>Hello</p>", 40);
        let mut picker = Picker::new();
        picker.start();
        picker.handle(&doc, PickerEvent::Click(Point::new(0, 0)));
        picker.done();
        assert_eq!(picker.state(), PickerState::Selecting);
        assert!(picker.panel().is_none());
        picker.handle(&doc, PickerEvent::Click(Point::new(0, 0)));
        assert_eq!(picker.handle(&doc, PickerEvent::Escape), PickerOutcome::Exited);
        assert_eq!(picker.state(), PickerState::Idle);
        assert!(picker.panel().is_none());
    }
}
