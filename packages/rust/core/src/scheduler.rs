//! Scheduler Loop.
//!
//! [`next_trigger`] is a pure function of the policy and the current time;
//! [`run_forever`] just sleeps until that instant and runs the cycle. Missed
//! triggers are never replayed: after downtime the loop waits for the next
//! one.

use std::future::Future;

use chrono::{DateTime, Duration, TimeZone};
use tracing::{error, info, warn};

use dnacommit_shared::{DnaCommitError, Result, RunMode, SchedulePolicy, Stage};

use crate::orchestrator::{Orchestrator, ProgressReporter};

/// One scheduled firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing<Tz: TimeZone> {
    pub at: DateTime<Tz>,
    /// Runs to execute, in order.
    pub modes: Vec<RunMode>,
}

fn modes_for(stages: &[Stage]) -> Vec<RunMode> {
    let mut ordered: Vec<Stage> = stages.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered.into_iter().map(RunMode::from).collect()
}

/// The first trigger strictly after `now`.
///
/// Times that do not exist locally (DST gaps) move to the following day.
pub fn next_trigger<Tz: TimeZone>(policy: &SchedulePolicy, now: &DateTime<Tz>) -> Option<Firing<Tz>> {
    let slots: Vec<(chrono::NaiveTime, Vec<RunMode>)> = match policy {
        SchedulePolicy::Full { at } => vec![(*at, vec![RunMode::Full])],
        SchedulePolicy::Split { triggers } => triggers
            .iter()
            .map(|t| (t.at, modes_for(&t.stages)))
            .collect(),
    };

    let tz = now.timezone();
    let today = now.date_naive();
    let mut best: Option<Firing<Tz>> = None;
    for (time, modes) in slots {
        // Two days ahead covers a DST gap on the first candidate day.
        let next = (0..3).find_map(|offset| {
            let day = today + Duration::days(offset);
            tz.from_local_datetime(&day.and_time(time))
                .earliest()
                .filter(|at| at > now)
        });
        let Some(at) = next else {
            continue;
        };
        best = match best {
            Some(current) if current.at < at => Some(current),
            Some(mut current) if current.at == at => {
                for mode in modes {
                    if !current.modes.contains(&mode) {
                        current.modes.push(mode);
                    }
                }
                current.modes.sort_by_key(|m| m.stages().first().copied());
                Some(current)
            }
            _ => Some(Firing { at, modes }),
        };
    }
    best
}

/// Trigger runs per `policy` until `shutdown` resolves.
///
/// A failed run is logged and the loop carries on to the next trigger.
pub async fn run_forever<F>(
    orchestrator: &Orchestrator,
    policy: &SchedulePolicy,
    progress: &dyn ProgressReporter,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut last_fired: Option<DateTime<chrono::Local>> = None;

    loop {
        let mut now = chrono::Local::now();
        if let Some(last) = last_fired {
            // Never fire the same slot twice if the wall clock stepped back.
            now = now.max(last);
        }
        let firing = next_trigger(policy, &now)
            .ok_or_else(|| DnaCommitError::config("schedule has no triggers"))?;
        let wait = (firing.at.clone() - chrono::Local::now())
            .to_std()
            .unwrap_or_default();
        info!(next = %firing.at, modes = ?firing.modes, "waiting for next trigger");

        tokio::select! {
            _ = &mut shutdown => {
                info!("scheduler stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        last_fired = Some(firing.at.clone());
        for mode in firing.modes {
            match orchestrator.run_cycle(mode, progress).await {
                Ok(summary) => info!(
                    %mode,
                    transitions = summary.transition_count(),
                    outcome = ?summary.run.outcome,
                    "scheduled run finished"
                ),
                Err(e) if e.is_infrastructure() => {
                    error!(%mode, error = %e, "scheduled run aborted");
                }
                Err(e) => warn!(%mode, error = %e, "scheduled run failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};
    use dnacommit_shared::Trigger;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn split() -> SchedulePolicy {
        SchedulePolicy::Split {
            triggers: vec![
                Trigger {
                    at: at(6, 0),
                    stages: vec![Stage::Evaluate, Stage::Collect],
                },
                Trigger {
                    at: at(18, 0),
                    stages: vec![Stage::Generate, Stage::Review, Stage::Commit],
                },
                Trigger {
                    at: at(2, 0),
                    stages: vec![Stage::Cleanup],
                },
            ],
        }
    }

    #[test]
    fn full_policy_fires_daily() {
        let policy = SchedulePolicy::Full { at: at(3, 0) };
        let before = next_trigger(&policy, &utc("2026-03-10T01:00:00Z")).unwrap();
        assert_eq!(before.at, utc("2026-03-10T03:00:00Z"));
        assert_eq!(before.modes, vec![RunMode::Full]);

        let after = next_trigger(&policy, &utc("2026-03-10T03:00:00Z")).unwrap();
        assert_eq!(after.at, utc("2026-03-11T03:00:00Z"));
    }

    #[test]
    fn split_picks_nearest_group_in_stage_order() {
        let f = next_trigger(&split(), &utc("2026-03-10T05:59:00Z")).unwrap();
        assert_eq!(f.at, utc("2026-03-10T06:00:00Z"));
        assert_eq!(f.modes, vec![RunMode::Collect, RunMode::Evaluate]);

        let f = next_trigger(&split(), &utc("2026-03-10T19:00:00Z")).unwrap();
        assert_eq!(f.at, utc("2026-03-11T02:00:00Z"));
        assert_eq!(f.modes, vec![RunMode::Cleanup]);
    }

    #[test]
    fn missed_triggers_are_not_backfilled() {
        // Process was down over the 06:00 and 18:00 slots.
        let f = next_trigger(&split(), &utc("2026-03-10T23:30:00Z")).unwrap();
        assert_eq!(f.at, utc("2026-03-11T02:00:00Z"));
        assert_eq!(f.modes, vec![RunMode::Cleanup]);
    }

    #[test]
    fn coinciding_triggers_merge_in_stage_order() {
        let policy = SchedulePolicy::Split {
            triggers: vec![
                Trigger {
                    at: at(6, 0),
                    stages: vec![Stage::Commit],
                },
                Trigger {
                    at: at(6, 0),
                    stages: vec![Stage::Collect, Stage::Commit],
                },
            ],
        };
        let f = next_trigger(&policy, &utc("2026-03-10T05:00:00Z")).unwrap();
        assert_eq!(f.at, utc("2026-03-10T06:00:00Z"));
        assert_eq!(f.modes, vec![RunMode::Collect, RunMode::Commit]);
    }

    #[test]
    fn empty_split_has_no_trigger() {
        let policy = SchedulePolicy::Split { triggers: vec![] };
        assert!(next_trigger(&policy, &Utc::now()).is_none());
    }
}
