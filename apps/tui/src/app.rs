//! Dashboard state and event loop.

use std::io;
use std::time::Duration;

use color_eyre::eyre::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use dnacommit_storage::Storage;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph, Tabs};

use crate::screens::{Screen, ScreenId};
use crate::snapshot::Snapshot;
use crate::widgets::status_bar;

/// What a key press asks the event loop to do.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    None,
    Refresh,
}

/// Application state.
pub(crate) struct App {
    /// Currently active screen tab.
    pub active_tab: usize,
    pub screens: Vec<Screen>,
    pub should_quit: bool,
    /// Status message shown in bottom bar.
    pub status: String,
    pub show_help: bool,
    pub snapshot: Snapshot,
}

impl App {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        Self {
            active_tab: 0,
            screens: ScreenId::ALL.iter().map(|s| Screen::new(*s)).collect(),
            should_quit: false,
            status: "Read-only. r refresh, ? help, q quit".to_string(),
            show_help: false,
            snapshot,
        }
    }

    fn current_screen(&self) -> &Screen {
        &self.screens[self.active_tab]
    }

    fn select(&mut self, tab: usize) {
        self.active_tab = tab % self.screens.len();
        self.status = self.screens[self.active_tab].id.to_string();
    }

    fn replace_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
        for screen in &mut self.screens {
            screen.clamp(&self.snapshot);
        }
        self.status = match self.snapshot.loaded_at {
            Some(at) => format!("Refreshed at {}", at.with_timezone(&chrono::Local).format("%H:%M:%S")),
            None => "Refreshed".to_string(),
        };
    }

    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> Action {
        match code {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                return Action::None;
            }
            KeyCode::Char('q') => {
                self.should_quit = true;
                return Action::None;
            }
            KeyCode::Char('?') => {
                self.show_help = !self.show_help;
                return Action::None;
            }
            _ if self.show_help => {
                self.show_help = false;
                return Action::None;
            }
            KeyCode::Char('r') => return Action::Refresh,
            KeyCode::Char(c @ '1'..='3') => {
                self.select((c as usize) - ('1' as usize));
                return Action::None;
            }
            KeyCode::Tab => {
                self.select(self.active_tab + 1);
                return Action::None;
            }
            KeyCode::BackTab => {
                self.select(self.active_tab + self.screens.len() - 1);
                return Action::None;
            }
            _ => {}
        }

        let snapshot = &self.snapshot;
        self.screens[self.active_tab].handle_key(code, snapshot);
        Action::None
    }
}

/// Entry point: sets up terminal, runs event loop, restores terminal.
pub(crate) async fn run(store: Storage) -> Result<()> {
    let snapshot = Snapshot::load(&store).await?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &store, App::new(snapshot)).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, store: &Storage, mut app: App) -> Result<()> {
    loop {
        terminal.draw(|f| draw(f, &app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && app.handle_key(key.code, key.modifiers) == Action::Refresh
                {
                    match Snapshot::load(store).await {
                        Ok(snapshot) => app.replace_snapshot(snapshot),
                        Err(e) => app.status = format!("Refresh failed: {e}"),
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn draw(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Tab bar
            Constraint::Min(1),    // Content
            Constraint::Length(1), // Status bar
        ])
        .split(f.area());

    let tab_titles: Vec<Line> = app
        .screens
        .iter()
        .enumerate()
        .map(|(i, s)| Line::from(format!("{} {}", i + 1, s.id)))
        .collect();

    let tabs = Tabs::new(tab_titles)
        .block(Block::default().borders(Borders::ALL).title(" DNA-commit "))
        .select(app.active_tab)
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .divider(" │ ");

    f.render_widget(tabs, chunks[0]);

    app.current_screen().draw(f, chunks[1], &app.snapshot);

    f.render_widget(status_bar(&app.status), chunks[2]);

    if app.show_help {
        draw_help_overlay(f);
    }
}

fn draw_help_overlay(f: &mut Frame) {
    let area = centered_rect(60, 50, f.area());

    let help_text = vec![
        Line::from("Keybindings").style(Style::default().add_modifier(Modifier::BOLD)),
        Line::from(""),
        Line::from("  1-3          Switch to screen"),
        Line::from("  Tab/S-Tab    Next/previous screen"),
        Line::from("  ↑/↓ j/k      Move through lists"),
        Line::from("  r            Reload from the database"),
        Line::from("  ?            Toggle this help"),
        Line::from("  q / Ctrl-C   Quit"),
        Line::from(""),
        Line::from("Approvals, rollbacks and strategy changes are made with the dnacommit CLI."),
    ];

    let help = Paragraph::new(help_text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Help (any key closes) ")
                .style(Style::default().bg(Color::DarkGray)),
        )
        .style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(ratatui::widgets::Clear, area);
    f.render_widget(help, area);
}

/// Create a centered rectangle with percentage width and height.
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

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;

    fn rendered(app: &App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|f| draw(f, app)).unwrap();
        let buffer = terminal.backend().buffer();
        buffer.content().iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn tabs_cycle_and_wrap() {
        let mut app = App::new(Snapshot::default());
        app.handle_key(KeyCode::BackTab, KeyModifiers::NONE);
        assert_eq!(app.active_tab, 2);
        app.handle_key(KeyCode::Tab, KeyModifiers::NONE);
        assert_eq!(app.active_tab, 0);
        app.handle_key(KeyCode::Char('2'), KeyModifiers::NONE);
        assert_eq!(app.current_screen().id, ScreenId::Runs);
    }

    #[test]
    fn r_requests_refresh_and_q_quits() {
        let mut app = App::new(Snapshot::default());
        assert_eq!(app.handle_key(KeyCode::Char('r'), KeyModifiers::NONE), Action::Refresh);
        assert!(!app.should_quit);
        app.handle_key(KeyCode::Char('q'), KeyModifiers::NONE);
        assert!(app.should_quit);
    }

    #[test]
    fn help_swallows_next_key() {
        let mut app = App::new(Snapshot::default());
        app.handle_key(KeyCode::Char('?'), KeyModifiers::NONE);
        assert!(app.show_help);
        assert_eq!(app.handle_key(KeyCode::Char('r'), KeyModifiers::NONE), Action::None);
        assert!(!app.show_help);
    }

    #[test]
    fn empty_snapshot_renders_every_tab() {
        let mut app = App::new(Snapshot::default());
        assert!(rendered(&app).contains("Nothing awaits approval."));
        app.select(1);
        assert!(rendered(&app).contains("No runs recorded yet."));
        app.select(2);
        assert!(rendered(&app).contains("No deltas."));
    }
}
