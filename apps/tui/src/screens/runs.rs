//! "Runs" screen: recent run records and per-stage counts.

use dnacommit_shared::{RunOutcome, RunRecord};
use ratatui::prelude::*;
use ratatui::widgets::{List, ListItem, Paragraph};

use crate::snapshot::Snapshot;
use crate::widgets::{panel, row_style};

fn outcome_span(outcome: &RunOutcome) -> Span<'static> {
    match outcome {
        RunOutcome::Running => Span::styled("running", Style::default().fg(Color::Cyan)),
        RunOutcome::Completed => Span::styled("completed", Style::default().fg(Color::Green)),
        RunOutcome::TimedOut => Span::styled("timed out", Style::default().fg(Color::Yellow)),
        RunOutcome::Aborted { .. } => Span::styled("aborted", Style::default().fg(Color::Red)),
    }
}

fn run_line(run: &RunRecord, selected: bool) -> ListItem<'static> {
    let prefix = if selected { "▸ " } else { "  " };
    let line = Line::from(vec![
        Span::raw(format!(
            "{prefix}{}  {:<9}",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.mode
        )),
        outcome_span(&run.outcome),
    ]);
    ListItem::new(line).style(row_style(selected))
}

pub(crate) fn draw(f: &mut Frame, area: Rect, snapshot: &Snapshot, selected: usize) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Percentage(55), Constraint::Min(1)])
        .split(area);

    if snapshot.runs.is_empty() {
        let empty = Paragraph::new("No runs recorded yet.\n\nStart one with `dnacommit run`.")
            .alignment(Alignment::Center)
            .block(panel("Runs".into()));
        f.render_widget(empty, rows[0]);
        return;
    }

    let items: Vec<ListItem> = snapshot
        .runs
        .iter()
        .enumerate()
        .map(|(i, run)| run_line(run, i == selected))
        .collect();
    f.render_widget(
        List::new(items).block(panel(format!("Recent runs ({})", snapshot.runs.len()))),
        rows[0],
    );

    let Some(run) = snapshot.runs.get(selected) else {
        return;
    };
    let mut detail = vec![Line::from(format!("run {}", run.run_id))];
    if let RunOutcome::Aborted { reason } = &run.outcome {
        detail.push(Line::styled(reason.clone(), Style::default().fg(Color::Red)));
    }
    if let Some(ended) = run.ended_at {
        let secs = (ended - run.started_at).num_seconds();
        detail.push(Line::from(format!("took {secs}s")));
    }
    detail.push(Line::from(""));
    detail.push(Line::from(format!(
        "{:<10}{:>9}{:>9}{:>9}{:>9}",
        "stage", "accepted", "rejected", "retried", "errored"
    )));
    for (stage, counts) in &run.stage_results {
        detail.push(Line::from(format!(
            "{:<10}{:>9}{:>9}{:>9}{:>9}",
            stage.as_str(),
            counts.accepted,
            counts.rejected,
            counts.retried,
            counts.errored
        )));
    }
    f.render_widget(Paragraph::new(detail).block(panel("Stages".into())), rows[1]);
}
