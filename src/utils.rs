use crate::prelude::*;

pub fn now() -> DateTime {
  Utc::now().naive_utc()
}

pub fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime {
  chrono::DateTime::<Utc>::from_timestamp_millis(ms)
    .map(|date| date.naive_utc())
    .unwrap_or_default()
}

/// Accounting bucket for a moment, the UTC calendar month.
pub fn period_of(date: DateTime) -> String {
  date.format("%Y-%m").to_string()
}

pub fn delta(duration: Duration) -> TimeDelta {
  TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

pub fn format_duration(secs: i64) -> String {
  let secs = secs.max(0);
  let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);

  if hours > 0 {
    format!("{hours}h {minutes}m")
  } else if minutes > 0 {
    format!("{minutes}m {seconds}s")
  } else {
    format!("{seconds}s")
  }
}
