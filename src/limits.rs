//! Per-site resource limit enforcement.
//!
//! Pure functions of site state; no side effects. The worker loop consults
//! these before each page claim and after each completed page, and releases
//! the site as limit-reached (not finished) when one trips.

use crate::model::Site;

/// Which budget tripped. Logged and surfaced so operators can tell a
/// truncated crawl from a finished one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimeLimit { elapsed_secs: i64, limit_secs: u64 },
    PageLimit { brozzled: i64, limit: u64 },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeLimit {
                elapsed_secs,
                limit_secs,
            } => write!(f, "time limit reached ({elapsed_secs}s elapsed of {limit_secs}s)"),
            Self::PageLimit { brozzled, limit } => {
                write!(f, "page limit reached ({brozzled} of {limit} pages)")
            }
        }
    }
}

/// Evaluate the site's consumed resources against its configured budgets.
///
/// `now_epoch` is epoch seconds; passing it in keeps the function pure and
/// testable. A time limit of 0 trips immediately, before any page is
/// claimed.
pub fn should_stop(site: &Site, now_epoch: i64) -> Option<StopReason> {
    if let Some(limit_secs) = site.conf.time_limit {
        let elapsed_secs = (now_epoch - site.start_time).max(0);
        if elapsed_secs as u64 >= limit_secs {
            return Some(StopReason::TimeLimit {
                elapsed_secs,
                limit_secs,
            });
        }
    }

    if let Some(limit) = site.conf.max_pages {
        if site.pages_brozzled >= limit as i64 {
            return Some(StopReason::PageLimit {
                brozzled: site.pages_brozzled,
                limit,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobConf;

    fn site_with(conf: JobConf, start_time: i64, pages_brozzled: i64) -> Site {
        Site {
            id: 1,
            job_id: None,
            seed: "http://example.com/".to_string(),
            status: "ACTIVE".to_string(),
            conf,
            claimed: false,
            claimed_by: None,
            last_claimed: 0,
            start_time,
            pages_brozzled,
        }
    }

    #[test]
    fn no_limits_never_stops() {
        let site = site_with(JobConf::default(), 0, 1_000_000);
        assert_eq!(should_stop(&site, i64::MAX), None);
    }

    #[test]
    fn zero_time_limit_stops_immediately() {
        let conf = JobConf {
            time_limit: Some(0),
            ..Default::default()
        };
        let now = 1_700_000_000;
        let site = site_with(conf, now, 0);
        assert!(matches!(
            should_stop(&site, now),
            Some(StopReason::TimeLimit { .. })
        ));
    }

    #[test]
    fn time_limit_trips_only_after_elapsed() {
        let conf = JobConf {
            time_limit: Some(60),
            ..Default::default()
        };
        let start = 1_700_000_000;
        let site = site_with(conf, start, 0);
        assert_eq!(should_stop(&site, start + 59), None);
        assert!(should_stop(&site, start + 60).is_some());
    }

    #[test]
    fn page_limit_counts_brozzled_pages() {
        let conf = JobConf {
            max_pages: Some(5),
            ..Default::default()
        };
        assert_eq!(should_stop(&site_with(conf.clone(), 0, 4), 1), None);
        assert!(matches!(
            should_stop(&site_with(conf, 0, 5), 1),
            Some(StopReason::PageLimit { .. })
        ));
    }

    #[test]
    fn clock_skew_before_start_does_not_trip() {
        let conf = JobConf {
            time_limit: Some(10),
            ..Default::default()
        };
        let site = site_with(conf, 1_700_000_000, 0);
        assert_eq!(should_stop(&site, 1_699_999_000), None);
    }
}
