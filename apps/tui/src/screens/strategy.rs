//! "Strategy" screen: active parameters and proposed/applied deltas.

use dnacommit_shared::{DeltaStatus, KeywordChange};
use ratatui::prelude::*;
use ratatui::widgets::{List, ListItem, Paragraph, Wrap};

use crate::snapshot::Snapshot;
use crate::widgets::{panel, row_style};

fn status_color(status: DeltaStatus) -> Color {
    match status {
        DeltaStatus::Proposed => Color::Cyan,
        DeltaStatus::Applied => Color::Green,
        DeltaStatus::Dismissed => Color::DarkGray,
    }
}

pub(crate) fn draw(f: &mut Frame, area: Rect, snapshot: &Snapshot, selected: usize) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Length(5), Constraint::Min(1)])
        .split(area);

    let active = match &snapshot.strategy {
        Some(params) => vec![
            Line::from(format!(
                "version {}  threshold {:.2}",
                params.version, params.acceptance_threshold
            )),
            Line::from(format!("keywords: {}", params.keywords.join(", "))),
            Line::from(format!("topics:   {}", params.repo_topics.join(", "))),
        ],
        None => vec![Line::from("No strategy saved yet; the configured seed applies.")],
    };
    f.render_widget(
        Paragraph::new(active)
            .wrap(Wrap { trim: true })
            .block(panel("Active strategy".into())),
        rows[0],
    );

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(rows[1]);

    if snapshot.deltas.is_empty() {
        let empty = Paragraph::new("No deltas.\n\nPropose one with `dnacommit strategy propose`.")
            .alignment(Alignment::Center)
            .block(panel("Deltas".into()));
        f.render_widget(empty, columns[0]);
        return;
    }

    let items: Vec<ListItem> = snapshot
        .deltas
        .iter()
        .enumerate()
        .map(|(i, delta)| {
            let prefix = if i == selected { "▸ " } else { "  " };
            ListItem::new(Line::from(vec![
                Span::raw(format!("{prefix}{} ", delta.created_at.format("%m-%d %H:%M"))),
                Span::styled(
                    format!("{:<9}", delta.status.as_str()),
                    Style::default().fg(status_color(delta.status)),
                ),
            ]))
            .style(row_style(i == selected))
        })
        .collect();
    f.render_widget(
        List::new(items).block(panel(format!("Deltas ({})", snapshot.deltas.len()))),
        columns[0],
    );

    let Some(delta) = snapshot.deltas.get(selected) else {
        return;
    };
    let mut detail = vec![Line::from(delta.id.to_string())];
    if let Some(rate) = delta.acceptance_rate {
        detail.push(Line::from(format!(
            "acceptance {:.0}% over {} runs",
            rate * 100.0,
            delta.window_runs
        )));
    }
    if let Some(change) = &delta.threshold_change {
        detail.push(Line::from(format!("threshold {:.2} → {:.2}", change.from, change.to)));
    }
    for change in &delta.keyword_changes {
        detail.push(match change {
            KeywordChange::Add(k) => Line::styled(format!("+ {k}"), Style::default().fg(Color::Green)),
            KeywordChange::Remove(k) => Line::styled(format!("- {k}"), Style::default().fg(Color::Red)),
        });
    }
    if !delta.rejection_reasons.is_empty() {
        detail.push(Line::from(""));
        for (reason, n) in &delta.rejection_reasons {
            detail.push(Line::from(format!("{n:>4} × {reason}")));
        }
    }
    detail.push(Line::from(""));
    detail.extend(delta.rationale.iter().map(|r| Line::from(r.clone()).italic()));
    f.render_widget(
        Paragraph::new(detail)
            .wrap(Wrap { trim: false })
            .block(panel("Delta".into())),
        columns[1],
    );
}
