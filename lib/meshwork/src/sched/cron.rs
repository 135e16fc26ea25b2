//! Five-field cron expressions for timer triggers.
//!
//! Supported syntax per field: `*`, single values, lists (`1,5`), ranges
//! (`1-5`) and steps (`*/15`, `10-50/10`). Fields are minute, hour,
//! day-of-month, month, day-of-week (0 = Sunday).

use chrono::{Datelike, Timelike};

#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

#[derive(Debug, PartialEq)]
pub struct CronError(pub String);

impl CronExpr {
    pub fn parse(expression: &str) -> Result<CronExpr, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        if fields.len() != 5 {
            return Err(CronError(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        Ok(CronExpr {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the expression matches the given local time, at minute
    /// granularity.
    pub fn matches<T: Timelike + Datelike>(&self, time: &T) -> bool {
        self.minutes.contains(&time.minute())
            && self.hours.contains(&time.hour())
            && self.days_of_month.contains(&time.day())
            && self.months.contains(&time.month())
            && self
                .days_of_week
                .contains(&(time.weekday().num_days_from_sunday()))
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, CronError> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.find('/') {
            Some(slash) => {
                let step: u32 = part[slash + 1..]
                    .parse()
                    .map_err(|_| CronError(format!("bad step in {:?}", part)))?;

                if step == 0 {
                    return Err(CronError(format!("zero step in {:?}", part)));
                }

                (&part[..slash], step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some(dash) = range.find('-') {
            let start: u32 = range[..dash]
                .parse()
                .map_err(|_| CronError(format!("bad range in {:?}", part)))?;
            let end: u32 = range[dash + 1..]
                .parse()
                .map_err(|_| CronError(format!("bad range in {:?}", part)))?;
            (start, end)
        } else {
            let value: u32 = range
                .parse()
                .map_err(|_| CronError(format!("bad value in {:?}", part)))?;
            (value, value)
        };

        if start < min || end > max || start > end {
            return Err(CronError(format!(
                "{:?} outside {}..={}",
                part, min, max
            )));
        }

        let mut value = start;
        while value <= end {
            if !values.contains(&value) {
                values.push(value);
            }
            value += step;
        }
    }

    values.sort_unstable();
    Ok(values)
}
