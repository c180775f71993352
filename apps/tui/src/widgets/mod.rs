//! Reusable TUI widgets.

use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph};

/// Bottom status bar.
pub(crate) fn status_bar(msg: &str) -> Paragraph<'_> {
    Paragraph::new(format!(" {msg}")).style(Style::default().bg(Color::DarkGray).fg(Color::White))
}

/// Bordered block with a padded title.
pub(crate) fn panel(title: String) -> Block<'static> {
    Block::default().borders(Borders::ALL).title(format!(" {title} "))
}

/// Highlight style for the selected row of a list.
pub(crate) fn row_style(selected: bool) -> Style {
    if selected {
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    }
}

/// Move a list cursor up or down within `len` rows.
pub(crate) fn step(selected: usize, len: usize, down: bool) -> usize {
    match (down, len) {
        (_, 0) => 0,
        (true, _) => (selected + 1).min(len - 1),
        (false, _) => selected.saturating_sub(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_stays_in_bounds() {
        assert_eq!(step(0, 0, true), 0);
        assert_eq!(step(0, 3, false), 0);
        assert_eq!(step(2, 3, true), 2);
        assert_eq!(step(1, 3, true), 2);
    }
}
