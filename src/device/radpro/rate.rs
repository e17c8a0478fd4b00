//! Count-rate derivation from cumulative pulse counts.
//!
//! The device reports a lifetime pulse count; rates fall out of consecutive
//! deltas. Both the live CPS path and the datalog CPM path refuse to emit a
//! rate when the sampling interval looks wrong, but always advance their
//! state so one bad interval costs at most one point.

use log::warn;

/// Live counts-per-second estimator over consecutive pulse-count readings.
///
/// A reading only yields a rate when the time since the previous reading is
/// close to the configured cycle; after a stall or a burst of timeouts the
/// first reading re-seeds the state and emits nothing.
#[derive(Debug)]
pub struct CpsEstimator {
    log_cycle: f64,
    last: Option<(f64, f64)>,
}

impl CpsEstimator {
    pub fn new(log_cycle_secs: f64) -> Self {
        Self {
            log_cycle: log_cycle_secs,
            last: None,
        }
    }

    /// Feed one `(time, cumulative count)` reading; returns CPS when the
    /// elapsed interval is within 5 s of the configured cycle.
    pub fn update(&mut self, time_secs: f64, count: f64) -> Option<f64> {
        let previous = self.last.replace((time_secs, count));
        let (last_time, last_count) = previous?;

        let dt = time_secs - last_time;
        if (dt - self.log_cycle).abs() >= 5.0 {
            return None;
        }
        Some((count - last_count) / dt.max(1.0))
    }
}

/// One derived datalog point: CPM at an absolute device timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePoint {
    pub epoch_seconds: i64,
    pub cpm: f64,
}

/// Parse a `GET datalog` payload into CPM points.
///
/// The payload is `;`-separated records; record 0 is a column header and is
/// skipped. Each record is `epoch,count`. A point is emitted for a record
/// only when its interval since the previous record is positive and equal to
/// the interval before that, so rate points always come from a steady
/// logging cadence. Malformed records are logged and skipped; a header-only
/// payload (nothing new since the requested start) is an empty batch.
pub fn parse_datalog(payload: &str) -> Vec<RatePoint> {
    let mut points = Vec::new();
    let mut last: Option<(i64, i64)> = None;
    let mut last_interval: Option<i64> = None;

    for record in payload.split(';').skip(1) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }

        let Some((epoch, count)) = parse_record(record) else {
            warn!("skipping malformed datalog record \"{}\"", record);
            continue;
        };

        if let Some((last_epoch, last_count)) = last {
            let dt = epoch - last_epoch;
            if dt > 0 && last_interval == Some(dt) {
                points.push(RatePoint {
                    epoch_seconds: epoch,
                    cpm: (count - last_count) as f64 * 60.0 / dt as f64,
                });
            }
            last_interval = Some(dt);
        }
        last = Some((epoch, count));
    }

    points
}

fn parse_record(record: &str) -> Option<(i64, i64)> {
    let (epoch, count) = record.split_once(',')?;
    Some((epoch.trim().parse().ok()?, count.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cps_from_consecutive_readings() {
        let mut estimator = CpsEstimator::new(3.0);
        assert_eq!(estimator.update(0.0, 10.0), None);

        let cps = estimator.update(5.2, 14.0).expect("in-window interval");
        assert!((cps - 4.0 / 5.2).abs() < 1e-9);
    }

    #[test]
    fn cps_sub_second_interval_is_floored_to_one() {
        let mut estimator = CpsEstimator::new(1.0);
        estimator.update(0.0, 10.0);
        // dt = 0.5 would double the rate; the divisor floors at 1 s.
        assert_eq!(estimator.update(0.5, 14.0), Some(4.0));
    }

    #[test]
    fn cps_gap_emits_nothing_but_reseeds() {
        let mut estimator = CpsEstimator::new(3.0);
        estimator.update(0.0, 10.0);
        assert_eq!(estimator.update(40.0, 400.0), None);

        // The gap reading became the new baseline.
        let cps = estimator.update(43.0, 412.0).expect("back on cadence");
        assert!((cps - 4.0).abs() < 1e-9);
    }

    #[test]
    fn datalog_requires_two_equal_consecutive_intervals() {
        // Header; then intervals 60, 60, 61: only the third record has a
        // matching previous interval, and the fourth breaks the cadence.
        let payload = "time,tubePulseCount;0,100;60,160;120,220;181,300";
        let points = parse_datalog(payload);
        assert_eq!(
            points,
            vec![RatePoint {
                epoch_seconds: 120,
                cpm: 60.0
            }]
        );
    }

    #[test]
    fn datalog_skips_malformed_records() {
        let payload = "time,tubePulseCount;0,100;abc,def;60,160;120,220";
        let points = parse_datalog(payload);
        assert_eq!(
            points,
            vec![RatePoint {
                epoch_seconds: 120,
                cpm: 60.0
            }]
        );
    }

    #[test]
    fn datalog_ignores_non_positive_intervals() {
        // A clock step backwards must not produce a negative-rate point.
        let payload = "h;0,100;60,160;60,170;120,230";
        let points = parse_datalog(payload);
        assert!(points.is_empty());
    }

    #[test]
    fn header_only_datalog_yields_empty_batch() {
        // A fully synced device answers with just the header record; that is
        // an empty batch, not a parse failure.
        assert!(parse_datalog("time,tubePulseCount").is_empty());
        assert!(parse_datalog("").is_empty());
    }
}
