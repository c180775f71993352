//! TUI screen definitions.
//!
//! Each screen corresponds to a tab in the dashboard and renders one part
//! of the current [`Snapshot`].

mod overview;
mod runs;
mod strategy;

use std::fmt;

use crossterm::event::KeyCode;
use ratatui::prelude::*;

use crate::snapshot::Snapshot;
use crate::widgets::step;

/// Screen identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScreenId {
    Overview,
    Runs,
    Strategy,
}

impl ScreenId {
    pub(crate) const ALL: [ScreenId; 3] = [Self::Overview, Self::Runs, Self::Strategy];
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overview => write!(f, "Overview"),
            Self::Runs => write!(f, "Runs"),
            Self::Strategy => write!(f, "Strategy"),
        }
    }
}

/// Per-screen cursor state.
pub(crate) struct Screen {
    pub id: ScreenId,
    selected: usize,
}

impl Screen {
    pub(crate) fn new(id: ScreenId) -> Self {
        Self { id, selected: 0 }
    }

    fn rows(&self, snapshot: &Snapshot) -> usize {
        match self.id {
            ScreenId::Overview => snapshot.pending.len(),
            ScreenId::Runs => snapshot.runs.len(),
            ScreenId::Strategy => snapshot.deltas.len(),
        }
    }

    /// Keep the cursor valid after a refresh shrank the list.
    pub(crate) fn clamp(&mut self, snapshot: &Snapshot) {
        self.selected = self.selected.min(self.rows(snapshot).saturating_sub(1));
    }

    pub(crate) fn draw(&self, f: &mut Frame, area: Rect, snapshot: &Snapshot) {
        match self.id {
            ScreenId::Overview => overview::draw(f, area, snapshot, self.selected),
            ScreenId::Runs => runs::draw(f, area, snapshot, self.selected),
            ScreenId::Strategy => strategy::draw(f, area, snapshot, self.selected),
        }
    }

    pub(crate) fn handle_key(&mut self, code: KeyCode, snapshot: &Snapshot) {
        let rows = self.rows(snapshot);
        match code {
            KeyCode::Up | KeyCode::Char('k') => self.selected = step(self.selected, rows, false),
            KeyCode::Down | KeyCode::Char('j') => self.selected = step(self.selected, rows, true),
            _ => {}
        }
    }
}
