//! "Overview" screen: lifecycle counts and items awaiting manual approval.

use dnacommit_shared::{Severity, Status};
use ratatui::prelude::*;
use ratatui::widgets::{List, ListItem, Paragraph, Wrap};

use crate::snapshot::Snapshot;
use crate::widgets::{panel, row_style};

fn status_color(status: Status) -> Color {
    match status {
        Status::Committed => Color::Green,
        Status::EvaluatedRejected | Status::ReviewFailed => Color::Yellow,
        Status::RolledBack => Color::Magenta,
        Status::Deleted => Color::DarkGray,
        _ => Color::White,
    }
}

pub(crate) fn draw(f: &mut Frame, area: Rect, snapshot: &Snapshot, selected: usize) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .margin(1)
        .constraints([Constraint::Length(34), Constraint::Min(1)])
        .split(area);

    let mut lines: Vec<Line> = Status::ALL
        .iter()
        .map(|&status| {
            Line::from(vec![
                Span::raw(format!("{status:<20}")),
                Span::styled(
                    format!("{:>8}", snapshot.count(status)),
                    Style::default().fg(status_color(status)),
                ),
            ])
        })
        .collect();
    lines.push(Line::from(""));
    lines.push(Line::from(format!("{:<20}{:>8}", "total", snapshot.total())).bold());
    f.render_widget(
        Paragraph::new(lines).block(panel("Lifecycle".into())),
        columns[0],
    );

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(columns[1]);

    if snapshot.pending.is_empty() {
        let empty = Paragraph::new("Nothing awaits approval.")
            .alignment(Alignment::Center)
            .block(panel("Pending approval".into()));
        f.render_widget(empty, right[0]);
        return;
    }

    let items: Vec<ListItem> = snapshot
        .pending
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let prefix = if i == selected { "▸ " } else { "  " };
            ListItem::new(format!("{prefix}{}  {}", item.id, item.payload.title))
                .style(row_style(i == selected))
        })
        .collect();
    let list = List::new(items).block(panel(format!("Pending approval ({})", snapshot.pending.len())));
    f.render_widget(list, right[0]);

    let Some(item) = snapshot.pending.get(selected) else {
        return;
    };
    let mut detail = vec![Line::from(item.payload.locator.clone())];
    if let Some(notes) = &item.review_notes {
        detail.push(Line::from(format!("confidence {:.2}", notes.confidence)));
        detail.push(Line::from(notes.summary.clone()));
        for finding in &notes.findings {
            let style = match finding.severity {
                Severity::Critical => Style::default().fg(Color::Red).bold(),
                Severity::Major => Style::default().fg(Color::Yellow),
                _ => Style::default(),
            };
            detail.push(Line::styled(
                format!("[{:?}] {}", finding.severity, finding.description),
                style,
            ));
        }
    }
    detail.push(Line::from(""));
    detail.push(Line::from(format!("dnacommit approve {}", item.id)).italic());
    f.render_widget(
        Paragraph::new(detail)
            .wrap(Wrap { trim: false })
            .block(panel("Review".into())),
        right[1],
    );
}
