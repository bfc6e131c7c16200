use crate::types::{format_timestamp, FireError, FireResult};
use chrono::{DateTime, Duration, Utc};

/// Finite, restartable series `start, start + step, ...` bounded by `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampSeries {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
}

impl TimestampSeries {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step_minutes: u32) -> FireResult<Self> {
        if step_minutes == 0 {
            return Err(FireError::InvalidConfig("step_minutes must be positive".to_string()));
        }
        if start > end {
            return Err(FireError::InvalidConfig(format!(
                "start {} is after end {}",
                format_timestamp(&start),
                format_timestamp(&end)
            )));
        }
        Ok(Self {
            start,
            end,
            step: Duration::minutes(i64::from(step_minutes)),
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Number of instants in the series
    pub fn len(&self) -> usize {
        let span = (self.end - self.start).num_seconds();
        (span / self.step.num_seconds()) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Fresh iterator from `start`
    pub fn iter(&self) -> TimestampIter {
        TimestampIter {
            next: Some(self.start),
            end: self.end,
            step: self.step,
        }
    }

    /// ISO-8601 (`...Z`) rendering of every instant
    pub fn to_iso_strings(&self) -> Vec<String> {
        self.iter().map(|t| format_timestamp(&t)).collect()
    }
}

impl IntoIterator for &TimestampSeries {
    type Item = DateTime<Utc>;
    type IntoIter = TimestampIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct TimestampIter {
    next: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    step: Duration,
}

impl Iterator for TimestampIter {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        if current > self.end {
            self.next = None;
            return None;
        }
        self.next = current.checked_add_signed(self.step);
        Some(current)
    }
}
