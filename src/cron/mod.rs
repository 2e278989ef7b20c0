//! Hand-rolled 5-field cron matcher and tick loop. This is deliberately
//! not built on a cron-expression crate: the fired-set dedup and the
//! "evaluate every field independently against the current instant"
//! matching rule are specific enough that a general-purpose library
//! would only get in the way.

use crate::constants::CRON_FIRED_SET_CAP;
use crate::error::{DispatchError, Result};
use std::collections::VecDeque;

/// Parse one cron field (`*`, `a-b`, `*/k`, or a comma list of any of
/// those) into the set of values it allows, bounded by `(min, max)`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(DispatchError::InvalidSchedule(format!(
                "empty field component in {field:?}"
            )));
        }
        if let Some(step_str) = part.strip_prefix("*/") {
            let step: u32 = step_str
                .parse()
                .map_err(|_| DispatchError::InvalidSchedule(format!("bad step in {part:?}")))?;
            if step == 0 {
                return Err(DispatchError::InvalidSchedule("step of 0".to_string()));
            }
            let mut v = min;
            while v <= max {
                values.push(v);
                v += step;
            }
        } else if part == "*" {
            values.extend(min..=max);
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .parse()
                .map_err(|_| DispatchError::InvalidSchedule(format!("bad range in {part:?}")))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| DispatchError::InvalidSchedule(format!("bad range in {part:?}")))?;
            if lo > hi || lo < min || hi > max {
                return Err(DispatchError::InvalidSchedule(format!(
                    "range {part:?} out of bounds {min}-{max}"
                )));
            }
            values.extend(lo..=hi);
        } else {
            let v: u32 = part
                .parse()
                .map_err(|_| DispatchError::InvalidSchedule(format!("bad value {part:?}")))?;
            if v < min || v > max {
                return Err(DispatchError::InvalidSchedule(format!(
                    "value {v} out of bounds {min}-{max}"
                )));
            }
            values.push(v);
        }
    }
    Ok(values)
}

/// Does `expr` (5 space-separated fields: minute hour dom month dow) match
/// the given instant? `dow` is 0..6 with 0 = Sunday, matching `chrono`'s
/// `Weekday::num_days_from_sunday`.
pub fn should_run(expr: &str, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
    use chrono::{Datelike, Timelike};

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(DispatchError::InvalidSchedule(format!(
            "expected 5 fields, got {}: {expr:?}",
            fields.len()
        )));
    }

    let minutes = parse_field(fields[0], 0, 59)?;
    let hours = parse_field(fields[1], 0, 23)?;
    let doms = parse_field(fields[2], 1, 31)?;
    let months = parse_field(fields[3], 1, 12)?;
    let dows = parse_field(fields[4], 0, 6)?;

    Ok(minutes.contains(&now.minute())
        && hours.contains(&now.hour())
        && doms.contains(&now.day())
        && months.contains(&now.month())
        && dows.contains(&now.weekday().num_days_from_sunday()))
}

/// Bounds the cron tick loop's per-minute dedup set so memory can't grow
/// without limit across a long-running process.
pub struct FiredSet {
    keys: VecDeque<String>,
}

impl Default for FiredSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FiredSet {
    pub fn new() -> Self {
        Self {
            keys: VecDeque::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn insert(&mut self, key: String) {
        if self.contains(&key) {
            return;
        }
        if self.keys.len() >= CRON_FIRED_SET_CAP {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
    }
}

pub fn minute_key(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%d-%H-%M").to_string()
}

/// One schedule as seen by the evaluator, independent of whether it came
/// from the config file or the `ScheduleStore`.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    pub schedule: String,
    pub repo: Option<String>,
    pub prompt: String,
    /// Owning user, for user-created schedules. `None` for config-defined
    /// schedules, which run as the system rather than any one user.
    pub user_id: Option<String>,
}

/// Evaluate all `triggers` against `now`, returning the ones that match.
/// Callers are expected to skip the whole tick if `minute_key(now)` is
/// already in the fired set, then record it after firing.
pub fn due_triggers(
    triggers: &[CronTrigger],
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<CronTrigger>> {
    let mut due = Vec::new();
    for trigger in triggers {
        if should_run(&trigger.schedule, now)? {
            due.push(trigger.clone());
        }
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn every_minute_matches_anything() {
        assert!(should_run("* * * * *", at(2026, 7, 26, 3, 17)).unwrap());
    }

    #[test]
    fn exact_time_matches_only_that_minute() {
        assert!(should_run("30 9 * * *", at(2026, 7, 26, 9, 30)).unwrap());
        assert!(!should_run("30 9 * * *", at(2026, 7, 26, 9, 31)).unwrap());
    }

    #[test]
    fn step_field_matches_multiples() {
        assert!(should_run("*/15 * * * *", at(2026, 7, 26, 0, 45)).unwrap());
        assert!(!should_run("*/15 * * * *", at(2026, 7, 26, 0, 46)).unwrap());
    }

    #[test]
    fn range_and_list_fields() {
        assert!(should_run("0 9-17 * * 1-5", at(2026, 7, 27, 12, 0)).unwrap());
        assert!(should_run("0 0 1,15 * *", at(2026, 7, 15, 0, 0)).unwrap());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(should_run("* * * *", at(2026, 7, 26, 0, 0)).is_err());
        assert!(should_run("60 * * * *", at(2026, 7, 26, 0, 0)).is_err());
    }

    #[test]
    fn fired_set_caps_at_five_and_drops_oldest() {
        let mut set = FiredSet::new();
        for i in 0..7 {
            set.insert(format!("key-{i}"));
        }
        assert!(!set.contains("key-0"));
        assert!(!set.contains("key-1"));
        assert!(set.contains("key-6"));
    }

    #[test]
    fn due_triggers_filters_by_match() {
        let triggers = vec![
            CronTrigger {
                schedule: "0 9 * * *".into(),
                repo: Some("a".into()),
                prompt: "p1".into(),
                user_id: None,
            },
            CronTrigger {
                schedule: "0 10 * * *".into(),
                repo: Some("b".into()),
                prompt: "p2".into(),
                user_id: None,
            },
        ];
        let due = due_triggers(&triggers, at(2026, 7, 26, 9, 0)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].prompt, "p1");
    }
}
