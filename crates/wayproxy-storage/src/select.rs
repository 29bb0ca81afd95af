//! Closest-capture selection.
//!
//! Given every capture of a URL and an optional target datetime:
//!
//! - no target: the most recent capture
//! - otherwise the closest capture not after the target, if one exists
//! - otherwise the closest capture not before the target
//!
//! Captures sharing the winning datetime resolve to the one indexed last.

use chrono::{DateTime, Utc};

/// A candidate capture as seen by the selector.
pub trait Candidate {
    /// Capture datetime.
    fn datetime(&self) -> DateTime<Utc>;
    /// Index order; later captures have larger values.
    fn sequence(&self) -> i64;
}

/// Picks the capture to serve for `target`, or `None` when there are none.
pub fn select_closest<C: Candidate>(candidates: &[C], target: Option<DateTime<Utc>>) -> Option<&C> {
    let key = |c: &&C| (c.datetime(), c.sequence());

    let Some(target) = target else {
        return candidates.iter().max_by_key(key);
    };

    let not_after = candidates
        .iter()
        .filter(|c| c.datetime() <= target)
        .max_by_key(key);

    if not_after.is_some() {
        return not_after;
    }

    candidates
        .iter()
        .filter(|c| c.datetime() > target)
        // earliest datetime wins, then latest sequence
        .min_by_key(|c| (c.datetime(), std::cmp::Reverse(c.sequence())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    struct Cap(DateTime<Utc>, i64);

    impl Candidate for Cap {
        fn datetime(&self) -> DateTime<Utc> {
            self.0
        }
        fn sequence(&self) -> i64 {
            self.1
        }
    }

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 12, 0, 0).unwrap()
    }

    fn captures() -> Vec<Cap> {
        vec![Cap(at(2013, 7, 29), 1), Cap(at(2014, 1, 27), 2), Cap(at(2015, 3, 1), 3)]
    }

    #[test]
    fn empty_is_none() {
        let none: Vec<Cap> = Vec::new();
        assert!(select_closest(&none, None).is_none());
        assert!(select_closest(&none, Some(at(2014, 1, 1))).is_none());
    }

    #[test]
    fn no_target_picks_latest() {
        let caps = captures();
        assert_eq!(select_closest(&caps, None).unwrap().1, 3);
    }

    #[test]
    fn picks_closest_not_after() {
        let caps = captures();
        assert_eq!(select_closest(&caps, Some(at(2014, 6, 1))).unwrap().1, 2);
        assert_eq!(select_closest(&caps, Some(at(2014, 1, 27))).unwrap().1, 2);
    }

    #[test]
    fn prefers_not_after_even_when_later_is_closer() {
        let caps = captures();
        // 2015-02-28 is one day before the 2015 capture but the 2014 one wins
        assert_eq!(select_closest(&caps, Some(at(2015, 2, 28))).unwrap().1, 2);
    }

    #[test]
    fn falls_back_to_closest_not_before() {
        let caps = captures();
        assert_eq!(select_closest(&caps, Some(at(2011, 12, 26))).unwrap().1, 1);
    }

    #[test]
    fn ties_prefer_latest_indexed() {
        let caps = vec![Cap(at(2014, 1, 27), 1), Cap(at(2014, 1, 27), 5), Cap(at(2016, 1, 1), 2)];
        assert_eq!(select_closest(&caps, Some(at(2015, 1, 1))).unwrap().1, 5);
        assert_eq!(select_closest(&caps, Some(at(2010, 1, 1))).unwrap().1, 5);
    }
}
