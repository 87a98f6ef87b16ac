//! Bounded out-of-order tolerance per stream.
//!
//! The watermark trails the maximum event time seen by the tolerance. A record whose event time is
//! at or after the watermark is admitted and may push the maximum forward; an older record is late
//! and dropped from the sink path. There is no retraction of data already admitted.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::message::TypedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The record is older than `watermark`.
    Late { watermark: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct WatermarkState {
    stream: &'static str,
    max_event_time_seen: Option<DateTime<Utc>>,
    tolerance: TimeDelta,
}

impl WatermarkState {
    pub fn new(stream: &'static str, tolerance: Duration) -> Self {
        Self::resume(stream, tolerance, None)
    }

    /// Restores the tracker from the maximum event time persisted with the last checkpoint.
    pub fn resume(
        stream: &'static str,
        tolerance: Duration,
        max_event_time_seen: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            stream,
            max_event_time_seen,
            tolerance: TimeDelta::from_std(tolerance).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn stream(&self) -> &'static str {
        self.stream
    }

    pub fn max_event_time_seen(&self) -> Option<DateTime<Utc>> {
        self.max_event_time_seen
    }

    /// `max_event_time_seen - tolerance`, None until the first record is admitted or when the
    /// subtraction falls off the representable range.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.max_event_time_seen?.checked_sub_signed(self.tolerance)
    }

    pub fn admit(&mut self, record: &TypedRecord) -> Admission {
        self.admit_event_time(record.event_time)
    }

    pub fn admit_event_time(&mut self, event_time: DateTime<Utc>) -> Admission {
        if let Some(watermark) = self.watermark()
            && event_time < watermark
        {
            return Admission::Late { watermark };
        }
        self.max_event_time_seen = Some(match self.max_event_time_seen {
            Some(max) => max.max(event_time),
            None => event_time,
        });
        Admission::Admitted
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn minutes(m: i64) -> TimeDelta {
        TimeDelta::minutes(m)
    }

    #[test]
    fn vehicle_sequence_with_one_late_record() {
        let mut state = WatermarkState::new("vehicle_data", FIVE_MINUTES);
        let late = t0() + TimeDelta::seconds(30);
        let admissions: Vec<_> = [t0(), t0() + minutes(1), t0() + minutes(6), late]
            .into_iter()
            .map(|event_time| state.admit_event_time(event_time))
            .collect();

        assert_eq!(
            admissions,
            vec![
                Admission::Admitted,
                Admission::Admitted,
                Admission::Admitted,
                Admission::Late {
                    watermark: t0() + minutes(1)
                },
            ]
        );
        assert_eq!(state.max_event_time_seen(), Some(t0() + minutes(6)));
    }

    #[test]
    fn within_tolerance_of_the_maximum_is_admitted() {
        let mut state = WatermarkState::new("vehicle_data", FIVE_MINUTES);
        for event_time in [t0(), t0() + minutes(1), t0() + minutes(6)] {
            state.admit_event_time(event_time);
        }
        // four minutes behind the maximum, one minute ahead of the watermark
        assert_eq!(state.admit_event_time(t0() + minutes(2)), Admission::Admitted);
        assert_eq!(state.max_event_time_seen(), Some(t0() + minutes(6)));
    }

    #[test]
    fn first_record_is_always_admitted() {
        let mut state = WatermarkState::new("gps_data", FIVE_MINUTES);
        assert_eq!(state.watermark(), None);
        assert_eq!(state.admit_event_time(t0() - minutes(10_000)), Admission::Admitted);
    }

    #[test]
    fn non_decreasing_event_times_are_admitted() {
        let mut state = WatermarkState::new("traffic_data", Duration::ZERO);
        for m in [0, 0, 1, 5, 5, 90] {
            assert_eq!(state.admit_event_time(t0() + minutes(m)), Admission::Admitted);
        }
    }

    #[test]
    fn late_record_leaves_state_unchanged() {
        let mut state = WatermarkState::new("weather_data", FIVE_MINUTES);
        state.admit_event_time(t0() + minutes(30));
        let before = (state.max_event_time_seen(), state.watermark());

        assert!(matches!(state.admit_event_time(t0()), Admission::Late { .. }));
        assert_eq!((state.max_event_time_seen(), state.watermark()), before);
    }

    #[test]
    fn exactly_at_watermark_is_admitted() {
        let mut state = WatermarkState::new("emergency_data", FIVE_MINUTES);
        state.admit_event_time(t0() + minutes(5));
        assert_eq!(state.admit_event_time(t0()), Admission::Admitted);
        assert_eq!(state.max_event_time_seen(), Some(t0() + minutes(5)));
    }

    #[test]
    fn resumed_state_keeps_rejecting() {
        let mut state = WatermarkState::resume("vehicle_data", FIVE_MINUTES, Some(t0() + minutes(6)));
        assert_eq!(state.watermark(), Some(t0() + minutes(1)));
        assert!(matches!(state.admit_event_time(t0()), Admission::Late { .. }));
    }

    #[test]
    fn admits_decoded_records() {
        let mut state = WatermarkState::new("vehicle_data", FIVE_MINUTES);
        let record = TypedRecord {
            stream: "vehicle_data",
            offset: 0,
            fields: Default::default(),
            event_time: t0(),
        };
        assert_eq!(state.admit(&record), Admission::Admitted);
        assert_eq!(state.max_event_time_seen(), Some(t0()));
    }

    #[test]
    fn huge_tolerance_admits_everything() {
        let mut state = WatermarkState::new("vehicle_data", Duration::MAX);
        state.admit_event_time(t0());
        assert_eq!(state.watermark(), None);
        assert_eq!(state.admit_event_time(DateTime::<Utc>::MIN_UTC), Admission::Admitted);
    }
}
