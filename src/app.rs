use crate::config::Config;
use crate::dom::{ContentTree, Document, NodeId};
use crate::engine::Engine;
use crate::layout::{Piece, Point, Rect as DocRect, is_painted};
use crate::message::Request;
use crate::page::Page;
use crate::picker::{PanelButton, PickerEvent, PickerOutcome, PickerState};
use crate::rules::{self, FileStorage};
use anyhow::Result;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyModifiers,
    MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode};
use crossterm::{ExecutableCommand, execute};
use notify::{RecursiveMode, Watcher};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Clear, List, ListItem, Paragraph};
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use unicode_width::UnicodeWidthStr;

const UNWRAPPED_WIDTH: usize = 4096;

pub fn run_app(page: Page, store_path: PathBuf, config: Config) -> Result<()> {
    let mut app = App::new(page, store_path, config)?;

    let mut terminal = setup_terminal()?;
    let _guard = TerminalGuard;

    let (page_tx, page_rx) = mpsc::channel();
    let mut page_watcher = notify::recommended_watcher(move |res| {
        let _ = page_tx.send(res);
    })?;
    page_watcher.watch(&app.page.path, RecursiveMode::NonRecursive)?;

    let (store_tx, store_rx) = mpsc::channel();
    let _store_watcher = match rules::watch_storage(&app.store_path, store_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "storage watch unavailable");
            app.status = Some("Rule changes from other sessions will not be seen".to_string());
            None
        }
    };

    let tick_rate = Duration::from_millis(50);

    loop {
        let size = terminal.size()?;
        let layout = app.layout(size);
        app.ensure_rendered(layout.view.width);
        app.clamp_scroll(layout.view.height);
        app.sync_panel_area(&layout);

        terminal.draw(|f| ui(f, &mut app, &layout))?;

        if event::poll(tick_rate)? {
            match event::read()? {
                Event::Key(key) => {
                    if app.handle_key(key, layout.view.height) {
                        break;
                    }
                }
                Event::Mouse(mouse) => app.handle_mouse(mouse, &layout),
                _ => {}
            }
        }

        while let Ok(msg) = page_rx.try_recv() {
            if let Ok(event) = msg {
                app.on_page_event(event);
            }
        }
        while let Ok(msg) = store_rx.try_recv() {
            if let Ok(event) = msg {
                app.on_store_event(event);
            }
        }

        app.handle_pending_reloads();
        app.drain_mutations();
    }

    Ok(())
}

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = stdout.execute(DisableMouseCapture);
        let _ = stdout.execute(LeaveAlternateScreen);
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

/// Debounced reload request.
#[derive(Default)]
struct FsReload {
    pending: bool,
    deadline: Option<Instant>,
}

impl FsReload {
    fn request(&mut self, delay: Duration) {
        self.pending = true;
        self.deadline = Some(Instant::now() + delay);
    }

    fn take_due(&mut self) -> bool {
        if !self.pending {
            return false;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() < deadline {
                return false;
            }
        }
        self.pending = false;
        self.deadline = None;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PanelHit {
    Button(PanelButton),
    DeleteRule(usize),
}

struct LayoutInfo {
    status: Rect,
    rules: Option<Rect>,
    page: Rect,
    view: Rect,
    panel: Option<Rect>,
}

struct App {
    page: Page,
    engine: Engine,
    store_path: PathBuf,
    config: Config,
    lines: Vec<Line<'static>>,
    lines_dirty: bool,
    scroll: usize,
    last_width: u16,
    show_rules: bool,
    status: Option<String>,
    page_reload: FsReload,
    store_reload: FsReload,
    suppress_store_until: Option<Instant>,
}

impl App {
    fn new(mut page: Page, store_path: PathBuf, config: Config) -> Result<Self> {
        let storage = FileStorage::new(&store_path);
        let mut engine =
            Engine::new(&page.site, Box::new(storage)).with_auto_apply(config.auto_apply);
        let changed = engine.init(&mut page.document)?;
        let show_rules = config.show_rules;
        let status = if changed > 0 {
            format!("Applied saved rules to {changed} text node(s)")
        } else {
            "Press s to pick text".to_string()
        };
        info!(page = %page.path.display(), site = %page.site, "viewer started");

        Ok(Self {
            page,
            engine,
            store_path,
            config,
            lines: Vec::new(),
            lines_dirty: true,
            scroll: 0,
            last_width: 0,
            show_rules,
            status: Some(status),
            page_reload: FsReload::default(),
            store_reload: FsReload::default(),
            suppress_store_until: None,
        })
    }

    fn layout(&self, size: Rect) -> LayoutInfo {
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(size);
        let main = vertical[0];
        let status = vertical[1];

        let (page, rules) = if self.show_rules {
            let rules_width = self.config.rules_width.min(main.width.saturating_sub(20));
            let horiz = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Min(20), Constraint::Length(rules_width)])
                .split(main);
            (horiz[0], Some(horiz[1]))
        } else {
            (main, None)
        };

        let view = Rect::new(
            page.x.saturating_add(1),
            page.y.saturating_add(1),
            page.width.saturating_sub(2).max(1),
            page.height.saturating_sub(2).max(1),
        );

        let panel = (self.engine.picker().state() == PickerState::PanelOpen)
            .then(|| centered_rect(70, 60, main));

        LayoutInfo {
            status,
            rules,
            page,
            view,
            panel,
        }
    }

    fn doc_width(&self, view_width: u16) -> usize {
        if self.config.wrap {
            view_width.min(self.config.max_width.max(20)) as usize
        } else {
            UNWRAPPED_WIDTH
        }
    }

    fn ensure_rendered(&mut self, view_width: u16) {
        if view_width == 0 {
            return;
        }
        if self.last_width != view_width || self.page.document.needs_reflow() {
            self.last_width = view_width;
            let width = self.doc_width(view_width);
            self.page.document.reflow(width);
            self.lines_dirty = true;
        }
        if self.lines_dirty {
            self.lines = page_lines(&self.page.document, self.config.accent());
            self.lines_dirty = false;
        }
    }

    fn clamp_scroll(&mut self, height: u16) {
        let max_scroll = self.lines.len().saturating_sub(height as usize);
        if self.scroll > max_scroll {
            self.scroll = max_scroll;
        }
    }

    fn scroll_by(&mut self, delta: isize) {
        self.scroll = if delta < 0 {
            self.scroll.saturating_sub(delta.unsigned_abs())
        } else {
            self.scroll.saturating_add(delta as usize)
        };
    }

    /// Tells the picker where the panel sits in document coordinates.
    fn sync_panel_area(&mut self, layout: &LayoutInfo) {
        let area = layout.panel.map(|panel| {
            let x = panel.x.saturating_sub(layout.view.x) as usize;
            let y = panel.y.saturating_sub(layout.view.y) as usize + self.scroll;
            DocRect::new(x, y, panel.width as usize, panel.height as usize)
        });
        self.engine.picker_mut().set_panel_area(area);
    }

    fn to_doc_point(&self, view: Rect, column: u16, row: u16) -> Option<Point> {
        if column < view.x || row < view.y || column >= view.right() || row >= view.bottom() {
            return None;
        }
        Some(Point::new(
            (column - view.x) as usize,
            (row - view.y) as usize + self.scroll,
        ))
    }

    fn mark_changed(&mut self) {
        self.page.document.ensure_layout();
        self.lines_dirty = true;
    }

    fn handle_key(&mut self, key: KeyEvent, content_height: u16) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return true;
        }
        match self.engine.picker().state() {
            PickerState::PanelOpen => self.handle_panel_key(key),
            PickerState::Selecting => self.handle_selecting_key(key, content_height),
            PickerState::Idle => self.handle_idle_key(key, content_height),
        }
    }

    fn handle_idle_key(&mut self, key: KeyEvent, content_height: u16) -> bool {
        match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('s') => self.request(Request::StartSelection),
            KeyCode::Char('r') => self.request(Request::RefreshReplacements),
            KeyCode::Char('u') => self.run_panel_free_undo(),
            KeyCode::Char('t') => self.show_rules = !self.show_rules,
            _ => self.handle_scroll_key(key, content_height),
        }
        false
    }

    fn handle_selecting_key(&mut self, key: KeyEvent, content_height: u16) -> bool {
        match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('s') => {
                self.engine.stop_selection();
                self.status = Some("Selection mode off".to_string());
            }
            KeyCode::Esc => {
                self.engine
                    .handle_picker_event(&self.page.document, PickerEvent::Escape);
                self.status = Some("Selection mode off".to_string());
            }
            _ => self.handle_scroll_key(key, content_height),
        }
        false
    }

    fn handle_scroll_key(&mut self, key: KeyEvent, content_height: u16) {
        let page = content_height.max(1) as isize;
        match key.code {
            KeyCode::Char('j') | KeyCode::Down => self.scroll_by(1),
            KeyCode::Char('k') | KeyCode::Up => self.scroll_by(-1),
            KeyCode::PageDown | KeyCode::Char(' ') => self.scroll_by(page),
            KeyCode::PageUp => self.scroll_by(-page),
            KeyCode::Char('g') | KeyCode::Home => self.scroll = 0,
            KeyCode::Char('G') | KeyCode::End => self.scroll = self.lines.len(),
            _ => {}
        }
    }

    fn handle_panel_key(&mut self, key: KeyEvent) -> bool {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => {
                self.engine
                    .handle_picker_event(&self.page.document, PickerEvent::Escape);
                self.status = Some("Selection mode off".to_string());
            }
            KeyCode::Enter => self.panel_action(PanelButton::Apply),
            KeyCode::Tab => self.panel_action(PanelButton::Done),
            KeyCode::Char('p') if ctrl => self.panel_action(PanelButton::Preview),
            KeyCode::Char('z') if ctrl => self.panel_action(PanelButton::Undo),
            KeyCode::Up => self.move_rule_selection(-1),
            KeyCode::Down => self.move_rule_selection(1),
            KeyCode::Delete => {
                let selected = self
                    .engine
                    .picker()
                    .panel()
                    .and_then(|panel| panel.selected_rule);
                if let Some(index) = selected {
                    self.delete_rule(index);
                }
            }
            KeyCode::Backspace => {
                if let Some(panel) = self.engine.picker_mut().panel_mut() {
                    panel.input.pop();
                }
            }
            KeyCode::Char(c) if !ctrl => {
                if let Some(panel) = self.engine.picker_mut().panel_mut() {
                    panel.input.push(c);
                }
            }
            _ => {}
        }
        false
    }

    fn move_rule_selection(&mut self, delta: isize) {
        let indices: Vec<usize> = self.engine.site_rules().iter().map(|(i, _)| *i).collect();
        let Some(panel) = self.engine.picker_mut().panel_mut() else {
            return;
        };
        if indices.is_empty() {
            panel.selected_rule = None;
            return;
        }
        let pos = panel
            .selected_rule
            .and_then(|current| indices.iter().position(|i| *i == current));
        let next = match (pos, delta < 0) {
            (None, true) => indices.len() - 1,
            (None, false) => 0,
            (Some(p), true) => p.saturating_sub(1),
            (Some(p), false) => (p + 1).min(indices.len() - 1),
        };
        panel.selected_rule = Some(indices[next]);
    }

    fn handle_mouse(&mut self, mouse: MouseEvent, layout: &LayoutInfo) {
        match mouse.kind {
            MouseEventKind::ScrollDown => {
                self.scroll_by(3);
                return;
            }
            MouseEventKind::ScrollUp => {
                self.scroll_by(-3);
                return;
            }
            _ => {}
        }
        if !self.engine.picker().is_active() {
            return;
        }

        if let Some(panel) = layout.panel {
            let inside = mouse.column >= panel.x
                && mouse.column < panel.right()
                && mouse.row >= panel.y
                && mouse.row < panel.bottom();
            if inside {
                if mouse.kind == MouseEventKind::Up(MouseButton::Left) {
                    let hit = self
                        .panel_hits(panel)
                        .into_iter()
                        .find(|(area, _)| {
                            mouse.column >= area.x
                                && mouse.column < area.right()
                                && mouse.row == area.y
                        })
                        .map(|(_, hit)| hit);
                    match hit {
                        Some(PanelHit::Button(button)) => self.panel_action(button),
                        Some(PanelHit::DeleteRule(index)) => self.delete_rule(index),
                        None => {}
                    }
                }
                return;
            }
        }

        let Some(point) = self.to_doc_point(layout.view, mouse.column, mouse.row) else {
            return;
        };
        let event = match mouse.kind {
            MouseEventKind::Moved => PickerEvent::PointerMove(point),
            MouseEventKind::Down(MouseButton::Left) => PickerEvent::PointerDown(point),
            MouseEventKind::Drag(MouseButton::Left) => PickerEvent::PointerDrag(point),
            MouseEventKind::Up(MouseButton::Left) => PickerEvent::Click(point),
            _ => return,
        };
        if self.engine.handle_picker_event(&self.page.document, event) == PickerOutcome::Opened {
            self.status = Some("Type a replacement, Enter to apply".to_string());
        }
    }

    fn request(&mut self, request: Request) {
        let response = self.engine.handle_request(&mut self.page.document, request);
        self.status = Some(match (request, response.error) {
            (_, Some(error)) => format!("Request failed: {error}"),
            (Request::StartSelection, None) => {
                "Hover and click text to replace (Esc to stop)".to_string()
            }
            (Request::RefreshReplacements, None) => "Rules refreshed".to_string(),
        });
        self.mark_changed();
    }

    fn panel_action(&mut self, button: PanelButton) {
        match self.engine.panel_action(&mut self.page.document, button) {
            Ok(status) => self.status = Some(status),
            Err(err) => self.status = Some(format!("Failed to save rule: {err:#}")),
        }
        if button == PanelButton::Apply {
            self.suppress_store_until = Some(Instant::now() + Duration::from_millis(300));
        }
        self.mark_changed();
    }

    fn run_panel_free_undo(&mut self) {
        let restored = self.engine.undo(&mut self.page.document);
        self.status = Some(match restored {
            0 => "Nothing to undo".to_string(),
            n => format!("Restored {n} node(s)"),
        });
        self.mark_changed();
    }

    fn delete_rule(&mut self, index: usize) {
        self.suppress_store_until = Some(Instant::now() + Duration::from_millis(300));
        match self.engine.remove_rule(index) {
            Ok(Some(rule)) => {
                self.status = Some(format!("Deleted \"{}\" → \"{}\"", rule.original, rule.replacement));
                if let Some(panel) = self.engine.picker_mut().panel_mut() {
                    panel.selected_rule = None;
                }
            }
            Ok(None) => self.status = Some("Rule no longer exists".to_string()),
            Err(err) => self.status = Some(format!("Failed to delete rule: {err:#}")),
        }
    }

    fn on_page_event(&mut self, _event: notify::Event) {
        self.page_reload
            .request(Duration::from_millis(self.config.reload_debounce_ms));
    }

    fn on_store_event(&mut self, event: notify::Event) {
        if !rules::touches(&event, &self.store_path) {
            return;
        }
        if let Some(until) = self.suppress_store_until {
            if Instant::now() < until {
                return;
            }
            self.suppress_store_until = None;
        }
        self.store_reload
            .request(Duration::from_millis(self.config.reload_debounce_ms));
    }

    fn handle_pending_reloads(&mut self) {
        if self.page_reload.take_due() {
            self.reload_page();
        }
        if self.store_reload.take_due() {
            self.request(Request::RefreshReplacements);
        }
    }

    fn reload_page(&mut self) {
        match self.page.reload() {
            Ok(summary) => {
                let changed = self.engine.process_mutations(&mut self.page.document);
                info!(
                    kept = summary.kept,
                    removed = summary.removed,
                    inserted = summary.inserted,
                    changed,
                    "page reloaded"
                );
                self.status = Some(format!(
                    "Reloaded: {} block(s) replaced, {changed} text node(s) rewritten",
                    summary.inserted
                ));
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "page reload failed");
                self.status = Some(format!("Failed to reload: {err:#}"));
            }
        }
        self.mark_changed();
    }

    fn drain_mutations(&mut self) {
        if self.engine.process_mutations(&mut self.page.document) > 0 {
            self.mark_changed();
        }
    }

    /// Clickable controls inside the panel, one row each, in screen cells.
    fn panel_hits(&self, panel: Rect) -> Vec<(Rect, PanelHit)> {
        let inner = inner_rect(panel);
        let mut hits = Vec::new();
        let buttons_row = inner.y + PANEL_BUTTON_ROW;
        let mut x = inner.x;
        for button in PanelButton::ALL {
            let width = button.label().width() as u16 + 2;
            if x + width > inner.right() {
                break;
            }
            hits.push((Rect::new(x, buttons_row, width, 1), PanelHit::Button(button)));
            x += width + 1;
        }
        let first_rule_row = inner.y + PANEL_RULES_ROW;
        for (row, (index, _)) in self.engine.site_rules().iter().enumerate() {
            let y = first_rule_row + row as u16;
            if y >= inner.bottom() {
                break;
            }
            let delete = Rect::new(inner.right().saturating_sub(3), y, 3, 1);
            hits.push((delete, PanelHit::DeleteRule(*index)));
        }
        hits
    }

    fn panel_text(&self, width: u16) -> Text<'static> {
        let accent = self.config.accent();
        let muted = Style::default().fg(Color::DarkGray);
        let Some(panel) = self.engine.picker().panel() else {
            return Text::default();
        };
        let mut lines = vec![
            Line::from(vec![
                Span::styled("Selected: ", muted),
                Span::styled(panel.token.clone(), Style::default().add_modifier(Modifier::BOLD)),
            ]),
            Line::from(vec![
                Span::styled("Scope: ", muted),
                Span::raw(panel.scope.clone()),
            ]),
            Line::default(),
            Line::from(vec![
                Span::styled("Replace with: ", muted),
                Span::styled(
                    format!("{}▏", panel.input),
                    Style::default().fg(accent),
                ),
            ]),
            Line::default(),
        ];

        let mut buttons = Vec::new();
        for (i, button) in PanelButton::ALL.iter().enumerate() {
            if i > 0 {
                buttons.push(Span::raw(" "));
            }
            let style = match button {
                PanelButton::Apply => Style::default().fg(Color::Black).bg(accent),
                PanelButton::Preview => Style::default().fg(Color::Black).bg(self.config.preview()),
                PanelButton::Undo => Style::default().fg(Color::White).bg(Color::Red),
                PanelButton::Done => Style::default().fg(Color::Black).bg(Color::Gray),
            };
            buttons.push(Span::styled(format!("[{}]", button.label()), style));
        }
        lines.push(Line::from(buttons));
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            "Saved replacements:",
            Style::default().add_modifier(Modifier::BOLD),
        )));

        let rules = self.engine.site_rules();
        if rules.is_empty() {
            lines.push(Line::from(Span::styled("None yet.", muted)));
        }
        for (index, rule) in rules {
            let label = format!("\"{}\" → \"{}\"", rule.original, rule.replacement);
            let room = (width as usize).saturating_sub(4);
            let label = truncate_to_width(&label, room);
            let pad = room.saturating_sub(label.width());
            let selected = panel.selected_rule == Some(index);
            let row_style = if selected {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            lines.push(Line::from(vec![
                Span::styled(label, row_style),
                Span::raw(" ".repeat(pad + 1)),
                Span::styled("[x]", Style::default().fg(Color::Red)),
            ]));
        }
        Text::from(lines)
    }

    fn status_line(&self) -> Line<'static> {
        let accent = self.config.accent();
        let muted = Style::default().fg(Color::DarkGray);
        let mut parts = vec![Span::styled(
            "retext",
            Style::default().fg(accent).add_modifier(Modifier::BOLD),
        )];
        parts.push(Span::styled(" | ", muted));
        let mode = match self.engine.picker().state() {
            PickerState::Idle => "view",
            PickerState::Selecting => "pick",
            PickerState::PanelOpen => "replace",
        };
        parts.push(Span::styled(mode, Style::default().fg(accent)));
        if let Some(tag) = self
            .engine
            .picker()
            .hovered()
            .and_then(|node| self.page.document.element(node))
            .map(|el| el.tag.clone())
        {
            parts.push(Span::styled(format!(" <{tag}>"), muted));
        }
        parts.push(Span::styled(" | ", muted));
        let site = if self.page.site.is_empty() {
            "(local)".to_string()
        } else {
            self.page.site.clone()
        };
        parts.push(Span::styled(format!("site: {site}"), muted));
        parts.push(Span::styled(" | ", muted));
        parts.push(Span::styled(
            format!("rules: {}", self.engine.site_rules().len()),
            muted,
        ));
        if let Some(msg) = &self.status {
            parts.push(Span::styled(" | ", muted));
            parts.push(Span::styled(msg.clone(), Style::default().fg(accent)));
        }
        Line::from(parts)
    }
}

const PANEL_BUTTON_ROW: u16 = 5;
const PANEL_RULES_ROW: u16 = 8;

fn ui(f: &mut ratatui::Frame, app: &mut App, layout: &LayoutInfo) {
    let accent = app.config.accent();
    let border = Style::default().fg(Color::DarkGray);

    f.render_widget(Paragraph::new(app.status_line()), layout.status);

    let file_name = app
        .page
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("retext");
    let page_block = Block::bordered()
        .title(format!(" {file_name} "))
        .border_type(BorderType::Rounded)
        .border_style(if app.engine.picker().is_active() {
            Style::default().fg(accent)
        } else {
            border
        });
    let paragraph = Paragraph::new(Text::from(app.lines.clone()))
        .block(page_block)
        .scroll((app.scroll.min(u16::MAX as usize) as u16, 0));
    f.render_widget(paragraph, layout.page);

    for rect in app.engine.previews() {
        paint(f, layout.view, app.scroll, *rect, Style::default().fg(Color::Black).bg(app.config.preview()));
    }
    if let Some(rect) = app.engine.picker().highlight() {
        paint(f, layout.view, app.scroll, rect, Style::default().bg(app.config.highlight()).fg(Color::Black));
    }
    if let Some((from, to)) = app.engine.picker().drag_span() {
        for y in from.y..=to.y {
            let start = if y == from.y { from.x } else { 0 };
            let end = if y == to.y { to.x + 1 } else { layout.view.width as usize };
            if end > start {
                let rect = DocRect::new(start, y, end - start, 1);
                paint(f, layout.view, app.scroll, rect, Style::default().add_modifier(Modifier::REVERSED));
            }
        }
    }

    if let Some(rules_area) = layout.rules {
        let items: Vec<ListItem> = app
            .engine
            .site_rules()
            .iter()
            .map(|(index, rule)| {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{index:>2} "), Style::default().fg(Color::DarkGray)),
                    Span::raw(format!("{} → {}", rule.original, rule.replacement)),
                ]))
            })
            .collect();
        let list = List::new(items).block(
            Block::bordered()
                .title(" Rules ")
                .border_type(BorderType::Rounded)
                .border_style(border),
        );
        f.render_widget(list, rules_area);
    }

    if let Some(panel) = layout.panel {
        f.render_widget(Clear, panel);
        let text = app.panel_text(inner_rect(panel).width);
        let block = Block::bordered()
            .title(" Replace Text ")
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(accent));
        f.render_widget(Paragraph::new(text).block(block), panel);
    }
}

/// Paints a document-space rectangle onto the visible part of the page.
fn paint(f: &mut ratatui::Frame, view: Rect, scroll: usize, rect: DocRect, style: Style) {
    let buffer = f.buffer_mut();
    for y in rect.y..rect.bottom() {
        if y < scroll || y - scroll >= view.height as usize {
            continue;
        }
        let row = view.y + (y - scroll) as u16;
        for x in rect.x..rect.right() {
            if x >= view.width as usize {
                break;
            }
            let column = view.x + x as u16;
            buffer.get_mut(column, row).set_style(style);
        }
    }
}

fn inner_rect(r: Rect) -> Rect {
    Rect::new(
        r.x.saturating_add(1),
        r.y.saturating_add(1),
        r.width.saturating_sub(2),
        r.height.saturating_sub(2),
    )
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn truncate_to_width(text: &str, max: usize) -> String {
    if text.width() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > max {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

/// Styled terminal lines for the current layout.
fn page_lines(doc: &Document, accent: Color) -> Vec<Line<'static>> {
    let layout = doc.layout();
    layout
        .lines()
        .into_iter()
        .map(|pieces| {
            let mut spans = Vec::new();
            let mut column = 0usize;
            for piece in pieces {
                let (x, text, width, style) = match piece {
                    Piece::Run(idx) => {
                        let run = &layout.runs()[idx];
                        let text = doc
                            .text(run.node)
                            .and_then(|t| t.get(run.bytes.clone()))
                            .unwrap_or_default();
                        let text = if is_painted(doc, run.node) {
                            text.to_string()
                        } else {
                            " ".repeat(run.width)
                        };
                        (run.x, text, run.width, run_style(doc, run.node, accent))
                    }
                    Piece::Marker(idx) => {
                        let marker = &layout.markers()[idx];
                        let width = marker.text.width();
                        let style = Style::default().fg(Color::DarkGray);
                        (marker.x, marker.text.clone(), width, style)
                    }
                };
                if x > column {
                    spans.push(Span::raw(" ".repeat(x - column)));
                    column = x;
                }
                spans.push(Span::styled(text, style));
                column += width;
            }
            Line::from(spans)
        })
        .collect()
}

fn run_style(doc: &Document, node: NodeId, accent: Color) -> Style {
    let mut style = Style::default();
    let mut current = doc.parent_element(node);
    while let Some(id) = current {
        if let Some(el) = doc.element(id) {
            match el.tag.as_str() {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    if style.fg.is_none() {
                        style = style.fg(accent);
                    }
                    style = style.add_modifier(Modifier::BOLD);
                }
                "strong" | "b" | "th" | "dt" => style = style.add_modifier(Modifier::BOLD),
                "em" | "i" | "cite" | "blockquote" => style = style.add_modifier(Modifier::ITALIC),
                "a" => {
                    if style.fg.is_none() {
                        style = style.fg(Color::Blue);
                    }
                    style = style.add_modifier(Modifier::UNDERLINED);
                }
                "code" | "pre" | "kbd" | "samp" => {
                    if style.fg.is_none() {
                        style = style.fg(Color::LightYellow);
                    }
                }
                "del" | "s" | "strike" => style = style.add_modifier(Modifier::CROSSED_OUT),
                "mark" => style = style.add_modifier(Modifier::REVERSED),
                _ => {}
            }
        }
        current = doc.parent_element(id);
    }
    style
}

#[cfg(test)]
mod tests {
    use super::{FsReload, page_lines, truncate_to_width};
    use crate::page::parse_html_with_width;
    use ratatui::style::{Color, Modifier};
    use std::time::Duration;

    #[test]
    fn debounce_waits_for_the_deadline() {
        let mut reload = FsReload::default();
        assert!(!reload.take_due());
        reload.request(Duration::from_secs(60));
        assert!(!reload.take_due());
        reload.request(Duration::ZERO);
        assert!(reload.take_due());
        assert!(!reload.take_due());
    }

    #[test]
    fn page_lines_style_headings_and_keep_columns() {
        let doc = parse_html_with_width("<h1>Title</h1><ul><li>one</li></ul>", 40);
        let lines = page_lines(&doc, Color::Green);
        let title = &lines[0].spans[0];
        assert_eq!(title.content, "Title");
        assert_eq!(title.style.fg, Some(Color::Green));
        assert!(title.style.add_modifier.contains(Modifier::BOLD));
        let item: String = lines[2].spans.iter().map(|s| s.content.as_ref()).collect();
        assert_eq!(item.trim_end(), "  • one");
    }

    #[test]
    fn long_labels_are_truncated() {
        assert_eq!(truncate_to_width("abcdef", 10), "abcdef");
        assert_eq!(truncate_to_width("abcdef", 4), "abc…");
    }
}
