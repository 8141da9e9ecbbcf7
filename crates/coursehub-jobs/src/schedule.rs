//! Cron expressions for recurring jobs.
//!
//! Expressions use the classic 5 fields (`minute hour day-of-month month
//! day-of-week`) and are evaluated in UTC. Parsing is delegated to the
//! `cron` crate, which expects a leading seconds field, so one is added.

use crate::error::{JobError, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(JobError::InvalidSchedule(format!(
                "'{}' has {} fields, expected 5",
                expression, fields
            )));
        }

        let schedule = cron::Schedule::from_str(&format!("0 {}", expression))
            .map_err(|e| JobError::InvalidSchedule(format!("'{}': {}", expression, e)))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_midnight() {
        let s = CronSchedule::parse("0 0 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 15, 30, 0).unwrap();
        let next = s.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn every_five_minutes() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 15, 31, 10).unwrap();
        assert_eq!(
            s.next_after(from).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 10, 15, 35, 0).unwrap()
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(
            CronSchedule::parse("0 0 * *"),
            Err(JobError::InvalidSchedule(_))
        ));
        assert!(CronSchedule::parse("0 0 0 * * *").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(CronSchedule::parse("a b c d e").is_err());
    }

    #[test]
    fn keeps_expression() {
        let s = CronSchedule::parse("  0 0 * * * ").unwrap();
        assert_eq!(s.expression(), "0 0 * * *");
    }
}
