use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, UtcOffset};

pub(crate) fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub(crate) fn format_offset(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

pub(crate) fn format_utc(value: OffsetDateTime) -> String {
    format_offset(value.to_offset(UtcOffset::UTC))
}

/// Whole days left until `until`, rounded up; zero once `until` has passed.
pub(crate) fn days_until(now: OffsetDateTime, until: OffsetDateTime) -> i64 {
    let remaining = until - now;
    if remaining <= Duration::ZERO {
        return 0;
    }

    let day = Duration::DAY.whole_seconds();
    let seconds = remaining.whole_seconds() + i64::from(remaining.subsec_nanoseconds() > 0);
    (seconds + day - 1) / day
}
