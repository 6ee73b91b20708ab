//! Native filter builders.
//!
//! The remote store speaks an OData-like filter dialect: `Column op datetime'…'` clauses joined with `and`.

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::traits::FilterBuilder;

pub const TIME_LOGGED_COLUMN: &str = "TimeLogged";
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

fn datetime_literal(instant: DateTime<Utc>) -> String {
    format!("datetime'{}'", instant.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn range_clause(column: &str, start: DateTime<Utc>, end: DateTime<Utc>, property_filter: Option<&str>) -> String {
    let mut filter = format!(
        "{column} ge {} and {column} lt {}",
        datetime_literal(start),
        datetime_literal(end)
    );

    if let Some(extra) = property_filter.map(str::trim).filter(|f| !f.is_empty()) {
        filter.push_str(" and (");
        filter.push_str(extra);
        filter.push(')');
    }

    filter
}

/// Filters on the time the event occurred. This is what the cache uses unless told otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggedTimeFilterBuilder;

impl FilterBuilder for LoggedTimeFilterBuilder {
    fn build(&self, start: DateTime<Utc>, end: DateTime<Utc>, property_filter: Option<&str>) -> String {
        range_clause(TIME_LOGGED_COLUMN, start, end, property_filter)
    }
}

/// Filters on the time the store last touched a row.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampFilterBuilder;

impl FilterBuilder for TimestampFilterBuilder {
    fn build(&self, start: DateTime<Utc>, end: DateTime<Utc>, property_filter: Option<&str>) -> String {
        range_clause(TIMESTAMP_COLUMN, start, end, property_filter)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn logged_time_filter() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        assert_eq!(
            LoggedTimeFilterBuilder.build(start, end, None),
            "TimeLogged ge datetime'2024-03-01T10:00:00.000Z' and TimeLogged lt datetime'2024-03-01T11:00:00.000Z'"
        );
    }

    #[test]
    fn property_filter_is_appended() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let filter = TimestampFilterBuilder.build(start, end, Some("EventType eq 'NodeDown'"));
        assert!(filter.starts_with("Timestamp ge datetime'2024-03-01T10:00:00.000Z'"));
        assert!(filter.ends_with(" and (EventType eq 'NodeDown')"));

        // Blank clauses are ignored.
        assert!(!TimestampFilterBuilder.build(start, end, Some("  ")).contains('('));
    }
}
