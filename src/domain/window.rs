use crate::domain::error::PacingError;
use crate::domain::models::{Options, Window};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

pub fn resolve(options: &Options, now: DateTime<Utc>, tz: Tz) -> Result<Window, PacingError> {
    options.validate().map_err(PacingError::Configuration)?;

    let day_start = local_day_start(now.with_timezone(&tz).date_naive(), tz)?;
    Ok(Window {
        day_start,
        start: day_start + Duration::minutes(i64::from(options.active_from.minutes())),
        end: day_start + Duration::minutes(i64::from(options.active_to.minutes())),
    })
}

/// Local midnight as an absolute instant. Zones that skip midnight on a DST
/// change start the day at the first instant that exists.
pub fn local_day_start(date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>, PacingError> {
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        PacingError::Configuration(format!("cannot build midnight for {date}"))
    })?;

    if let Some(start) = tz.from_local_datetime(&midnight).earliest() {
        return Ok(start.with_timezone(&Utc));
    }
    (1..=120)
        .map(|minutes| midnight + Duration::minutes(minutes))
        .find_map(|candidate| tz.from_local_datetime(&candidate).earliest())
        .map(|start| start.with_timezone(&Utc))
        .ok_or_else(|| {
            PacingError::Configuration(format!("{date} has no local midnight in {}", tz.name()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::MinuteOfDay;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[test]
    fn resolve_utc_window_for_current_day() {
        let window = resolve(&Options::default(), fixed_time("2026-02-16T13:37:00Z"), Tz::UTC)
            .expect("resolve window");
        assert_eq!(window.day_start, fixed_time("2026-02-16T00:00:00Z"));
        assert_eq!(window.start, fixed_time("2026-02-16T06:00:00Z"));
        assert_eq!(window.end, fixed_time("2026-02-16T22:00:00Z"));
    }

    #[test]
    fn resolve_uses_local_calendar_day() {
        // 23:30 UTC on the 15th is already the 16th in Berlin.
        let window = resolve(
            &Options::default(),
            fixed_time("2026-02-15T23:30:00Z"),
            chrono_tz::Europe::Berlin,
        )
        .expect("resolve window");
        assert_eq!(window.day_start, fixed_time("2026-02-15T23:00:00Z"));
        assert_eq!(window.start, fixed_time("2026-02-16T05:00:00Z"));
        assert_eq!(window.end, fixed_time("2026-02-16T21:00:00Z"));
    }

    #[test]
    fn resolve_rejects_inverted_options() {
        let options = Options {
            target: 10_000,
            active_from: MinuteOfDay::parse("22:00").expect("valid time"),
            active_to: MinuteOfDay::parse("06:00").expect("valid time"),
        };
        let result = resolve(&options, fixed_time("2026-02-16T12:00:00Z"), Tz::UTC);
        assert!(matches!(result, Err(PacingError::Configuration(_))));
    }

    #[test]
    fn local_day_start_handles_midnight_gap() {
        // Santiago skips 00:00-01:00 when DST starts.
        let date = NaiveDate::from_ymd_opt(2025, 9, 7).expect("valid date");
        let start = local_day_start(date, chrono_tz::America::Santiago).expect("day start");
        assert_eq!(
            start.with_timezone(&chrono_tz::America::Santiago).date_naive(),
            date
        );
    }

    // Feature: pacer, Property 2: the window always lies inside the day containing now
    proptest! {
        #[test]
        fn property2_window_within_day_of_now(
            seconds in 0i64..(365 * 24 * 3600),
            from in 0u16..1439u16,
            span in 1u16..1439u16
        ) {
            let to = (from + span).min(1439);
            prop_assume!(from < to);
            let options = Options {
                target: 10_000,
                active_from: MinuteOfDay::from_minutes(from).expect("in range"),
                active_to: MinuteOfDay::from_minutes(to).expect("in range"),
            };
            let now = fixed_time("2026-01-01T00:00:00Z") + Duration::seconds(seconds);
            let window = resolve(&options, now, Tz::UTC).expect("resolve");

            prop_assert!(window.day_start <= now);
            prop_assert!(now < window.day_start + Duration::days(1));
            prop_assert!(window.start < window.end);
            prop_assert_eq!((window.start - window.day_start).num_minutes(), i64::from(from));
        }
    }
}
