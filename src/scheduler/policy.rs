//! Schedule defaults and adaptive re-crawl timing

use crate::config::{CrawlDefaults, SchedulerConfig};
use crate::state::{CrawlFrequency, ObservedChangeFrequency};
use crate::storage::{NewSchedule, ScheduleRecord};
use chrono::{DateTime, Duration, Utc};

/// Weight of the newest score in the running average
pub const SCORE_EMA_ALPHA: f64 = 0.3;

/// Running average at or above which a site counts as changing frequently
const FREQUENT_AVERAGE: f64 = 0.3;

/// Running average at or above which a site counts as changing occasionally
const OCCASIONAL_AVERAGE: f64 = 0.1;

/// Frequency and priority for a newly tracked project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultSchedule {
    pub frequency: CrawlFrequency,
    pub priority: u8,
}

/// Picks the default schedule for a project by market-cap rank
///
/// | Rank | Frequency | Priority |
/// |------|-----------|----------|
/// | 1-100 | weekly | 8 |
/// | 101-1000 | biweekly | 5 |
/// | above 1000 or unranked | monthly | 3 |
pub fn default_schedule_for_rank(rank: Option<u32>) -> DefaultSchedule {
    match rank {
        Some(r) if r <= 100 => DefaultSchedule {
            frequency: CrawlFrequency::Weekly,
            priority: 8,
        },
        Some(r) if r <= 1000 => DefaultSchedule {
            frequency: CrawlFrequency::Biweekly,
            priority: 5,
        },
        _ => DefaultSchedule {
            frequency: CrawlFrequency::Monthly,
            priority: 3,
        },
    }
}

/// Builds the default schedule row for a link
///
/// `next_run_at` is the first time the link becomes due.
pub fn new_default_schedule(
    link_id: i64,
    project_id: i64,
    rank: Option<u32>,
    scheduler: &SchedulerConfig,
    crawl: &CrawlDefaults,
    next_run_at: DateTime<Utc>,
) -> NewSchedule {
    let defaults = default_schedule_for_rank(rank);
    NewSchedule {
        link_id,
        project_id,
        frequency: defaults.frequency,
        priority: defaults.priority,
        min_market_cap: scheduler.min_market_cap,
        max_depth: crawl.max_depth,
        max_pages: crawl.max_pages,
        next_run_at: Some(next_run_at),
    }
}

/// What a finished run tells the schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunObservation {
    /// The new snapshot was compared with the previous one
    Compared {
        change_score: Option<f64>,
        significant: bool,
    },
    /// A snapshot exists but nothing was compared (first version, or the
    /// comparison did not run)
    Uncompared,
    /// Every retry failed; the schedule moves on one nominal interval
    RetriesExhausted,
}

/// Adapts a schedule's timing to the change behavior it observes
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    no_change_threshold: u32,
    backoff_growth: f64,
    max_backoff: f64,
}

impl AdaptivePolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            no_change_threshold: config.no_change_threshold,
            backoff_growth: config.backoff_growth.max(1.0),
            max_backoff: config.max_backoff_multiplier.max(1.0),
        }
    }

    /// Updates the adaptive fields of `schedule` after a run at `now`
    pub fn apply(&self, schedule: &mut ScheduleRecord, observation: RunObservation, now: DateTime<Utc>) {
        schedule.last_run_at = Some(now);

        match observation {
            RunObservation::Compared {
                change_score,
                significant,
            } => {
                let score = change_score.unwrap_or(1.0);
                schedule.average_change_score = Some(match schedule.average_change_score {
                    Some(avg) => SCORE_EMA_ALPHA * score + (1.0 - SCORE_EMA_ALPHA) * avg,
                    None => score,
                });

                if significant {
                    schedule.consecutive_no_change = 0;
                    schedule.last_significant_change = Some(now);
                    schedule.backoff_multiplier =
                        (schedule.backoff_multiplier / self.backoff_growth).max(1.0);
                } else {
                    schedule.consecutive_no_change += 1;
                    if schedule.consecutive_no_change >= self.no_change_threshold {
                        schedule.backoff_multiplier =
                            (schedule.backoff_multiplier * self.backoff_growth).min(self.max_backoff);
                    }
                }
                schedule.observed_change = self.label(schedule);
                schedule.next_run_at = next_run(schedule.frequency, schedule.backoff_multiplier, now);
            }
            RunObservation::Uncompared => {
                schedule.next_run_at = next_run(schedule.frequency, schedule.backoff_multiplier, now);
            }
            RunObservation::RetriesExhausted => {
                schedule.next_run_at = next_run(schedule.frequency, 1.0, now);
            }
        }
    }

    fn label(&self, schedule: &ScheduleRecord) -> Option<ObservedChangeFrequency> {
        if schedule.consecutive_no_change >= self.no_change_threshold {
            return Some(ObservedChangeFrequency::Static);
        }
        let average = schedule.average_change_score?;
        Some(if average >= FREQUENT_AVERAGE {
            ObservedChangeFrequency::Frequent
        } else if average >= OCCASIONAL_AVERAGE {
            ObservedChangeFrequency::Occasional
        } else {
            ObservedChangeFrequency::Rare
        })
    }
}

/// `now + base_interval(frequency) × backoff`; `None` for on-demand schedules
pub fn next_run(frequency: CrawlFrequency, backoff: f64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let base = frequency.base_interval()?;
    let seconds = (base.num_seconds() as f64 * backoff.max(1.0)).round() as i64;
    Some(now + Duration::seconds(seconds))
}
