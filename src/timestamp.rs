//! Timestamp conversions.
//!
//! The service encodes absolute times as a pair of 64-bit words: whole seconds since
//! 1904-01-01 UTC and a binary fraction of a second. Locally, times are
//! [`SystemTime`]s, and are presented either as formatted text or as floating point
//! seconds since the EPICS epoch (1990-01-01 UTC).

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between 1904-01-01 and 1970-01-01
const SERVICE_EPOCH_TO_UNIX: u64 = 2_082_844_800;
/// Seconds between 1970-01-01 and 1990-01-01
const UNIX_TO_EPICS_EPOCH: u64 = 631_152_000;

/// An absolute time as encoded by the service
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ServiceTimestamp {
    pub seconds: i64,
    pub fraction: u64,
}

impl ServiceTimestamp {
    pub fn from_pair(pair: [u64; 2]) -> Self {
        ServiceTimestamp {
            seconds: pair[0] as i64,
            fraction: pair[1],
        }
    }

    pub fn nanoseconds(&self) -> u32 {
        (self.fraction / (u64::MAX / 1_000_000_000)).min(999_999_999) as u32
    }

    /// The local time, or `None` if it cannot be represented
    pub fn to_system_time(&self) -> Option<SystemTime> {
        let unix_seconds = self.seconds.checked_sub(SERVICE_EPOCH_TO_UNIX as i64)?;
        DateTime::<Utc>::from_timestamp(unix_seconds, self.nanoseconds()).map(SystemTime::from)
    }
}

fn to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => DateTime::from_timestamp(
            i64::try_from(after.as_secs()).ok()?,
            after.subsec_nanos(),
        ),
        Err(e) => {
            let before = e.duration();
            let mut seconds = i64::try_from(before.as_secs()).ok()?.checked_neg()?;
            let mut nanos = before.subsec_nanos();
            if nanos > 0 {
                seconds = seconds.checked_sub(1)?;
                nanos = 1_000_000_000 - nanos;
            }
            DateTime::from_timestamp(seconds, nanos)
        }
    }
}

/// Floating point seconds since 1990-01-01 UTC
pub fn epics_seconds(time: SystemTime) -> f64 {
    let epics_epoch = UNIX_EPOCH + Duration::from_secs(UNIX_TO_EPICS_EPOCH);
    match time.duration_since(epics_epoch) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// ISO 8601 text with microsecond resolution, in UTC.
///
/// `None` for times outside the range calendar dates can be given for.
pub fn format_timestamp(time: SystemTime) -> Option<String> {
    to_utc(time).map(|t| t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
}

/// Text used in reports, with a placeholder for bindings never updated
pub fn format_report_time(time: Option<SystemTime>) -> String {
    match time {
        Some(t) => to_utc(t).map_or_else(
            || "<out of range>".to_string(),
            |t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        ),
        None => "<never>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_time_conversion() {
        // 2000-01-01T00:00:00.5Z
        let ts = ServiceTimestamp::from_pair([3_029_529_600, 1u64 << 63]);
        assert_eq!(ts.nanoseconds(), 500_000_000);
        let time = ts.to_system_time().unwrap();
        assert_eq!(
            time.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            946_684_800
        );
        assert_eq!(
            format_timestamp(time).as_deref(),
            Some("2000-01-01T00:00:00.500000")
        );
    }

    #[test]
    fn epics_epoch_seconds() {
        let epoch = UNIX_EPOCH + Duration::from_secs(UNIX_TO_EPICS_EPOCH);
        assert_eq!(epics_seconds(epoch), 0.0);
        assert_eq!(epics_seconds(epoch + Duration::from_millis(1500)), 1.5);
        // 1990-01-01 in service seconds
        let ts = ServiceTimestamp::from_pair([2_713_996_800, 0]);
        assert_eq!(epics_seconds(ts.to_system_time().unwrap()), 0.0);
    }

    #[test]
    fn unrepresentable_times_are_rejected() {
        assert_eq!(ServiceTimestamp::from_pair([1u64 << 62, 0]).to_system_time(), None);
        assert_eq!(ServiceTimestamp::from_pair([1u64 << 63, 0]).to_system_time(), None);
        // All bits set reads as one second before the service epoch
        let ts = ServiceTimestamp::from_pair([u64::MAX, u64::MAX]).to_system_time();
        assert_eq!(
            ts.and_then(format_timestamp).as_deref(),
            Some("1903-12-31T23:59:59.999999")
        );
        // Before 1970 is fine
        let ts = ServiceTimestamp::from_pair([0, 0]).to_system_time().unwrap();
        assert_eq!(
            format_timestamp(ts).as_deref(),
            Some("1904-01-01T00:00:00.000000")
        );
    }

    #[test]
    fn formatting_far_times() {
        let far = UNIX_EPOCH + Duration::from_secs(1 << 60);
        assert_eq!(format_timestamp(far), None);
        assert_eq!(format_report_time(Some(far)), "<out of range>");
        let before = UNIX_EPOCH - Duration::from_millis(500);
        assert_eq!(
            format_timestamp(before).as_deref(),
            Some("1969-12-31T23:59:59.500000")
        );
    }

    #[test]
    fn report_time() {
        assert_eq!(format_report_time(None), "<never>");
        assert_eq!(
            format_report_time(Some(UNIX_EPOCH)),
            "1970-01-01 00:00:00.000000"
        );
    }
}
