//! Clock-aligned time bucketing.
//!
//! Buckets align to the start of the timestamp's calendar day, so a 5 minute
//! bucket size produces boundaries at :00, :05, :10 and so on regardless of
//! when the process started. Crossing a DST or day boundary is deliberate:
//! the same wall-clock instant on two consecutive days maps to two different
//! buckets.

use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone};

/// Bucket sizes accepted by the collector, in minutes.
pub const VALID_BUCKET_MINUTES: [u32; 7] = [1, 5, 10, 15, 20, 30, 60];

/// Returns true if `minutes` is an accepted bucket size.
pub fn is_valid_bucket_minutes(minutes: u32) -> bool {
    VALID_BUCKET_MINUTES.contains(&minutes)
}

/// Returns the start of the bucket containing `ts`.
///
/// The day grid is taken from `ts`'s own time zone. On a DST-skipped
/// midnight the earlier valid instant is used; the resulting irregular
/// bucket count for that day is accepted behaviour.
pub fn bucket_start<Tz: TimeZone>(ts: DateTime<Tz>, size: Duration) -> DateTime<Tz> {
    let day_start = match ts.with_time(NaiveTime::MIN) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => ts.clone(),
    };

    let elapsed = ts.signed_duration_since(day_start.clone());
    let index = elapsed.num_seconds() / size.num_seconds();

    day_start + size * (index as i32)
}
