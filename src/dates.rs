//! Date-range resolution for incremental fetches.

use chrono::{Days, NaiveDate, Utc};

use crate::error::DateRangeError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive calendar-date window bounding which runs a fetch considers.
///
/// Always fully specified by the time it reaches the fetcher: `start <= end`
/// holds for every constructed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Resolve optional CLI date strings into a concrete range.
    ///
    /// - both absent: defaults to `[yesterday, today]`
    /// - both present: parsed as `YYYY-MM-DD`, rejected if unparseable or
    ///   `start > end`
    /// - exactly one present: rejected
    pub fn resolve(start: Option<&str>, end: Option<&str>) -> Result<Self, DateRangeError> {
        Self::resolve_with_today(start, end, Utc::now().date_naive())
    }

    /// Same as [`DateRange::resolve`] with an injected "today" so the
    /// defaulting rule is testable without wall-clock coupling.
    pub fn resolve_with_today(
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, DateRangeError> {
        match (start, end) {
            (None, None) => Ok(Self {
                start: today - Days::new(1),
                end: today,
            }),
            (Some(start), Some(end)) => {
                let start = parse_date(start)?;
                let end = parse_date(end)?;
                if start > end {
                    return Err(DateRangeError::InvalidRange(format!(
                        "start date {start} is after end date {end}"
                    )));
                }
                Ok(Self { start, end })
            }
            _ => Err(DateRangeError::MissingArgument),
        }
    }

    /// Whether a calendar date falls inside the range (inclusive).
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, DateRangeError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| DateRangeError::InvalidRange(format!("cannot parse date '{s}': {e}")))
}
