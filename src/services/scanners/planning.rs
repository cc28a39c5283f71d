use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use super::Scanner;
use crate::domain::errors::DomainResult;
use crate::services::event_bus::{Event, EventBus};

/// Emits `schedule:planning_due` each time the wall clock crosses a period
/// boundary (e.g. every 30 minutes on the half hour). The first poll only
/// records where the clock is.
pub struct PlanningScanner {
    bus: Arc<EventBus>,
    period_secs: i64,
    last_boundary: Mutex<Option<DateTime<Utc>>>,
}

impl PlanningScanner {
    pub fn new(bus: Arc<EventBus>, period: chrono::Duration) -> Self {
        Self {
            bus,
            period_secs: period.num_seconds().max(1),
            last_boundary: Mutex::new(None),
        }
    }

    /// Most recent boundary at or before `now`.
    pub fn boundary_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = now.timestamp();
        let floored = secs - secs.rem_euclid(self.period_secs);
        Utc.timestamp_opt(floored, 0).single().unwrap_or(now)
    }

    pub fn poll_at(&self, now: DateTime<Utc>) -> usize {
        let boundary = self.boundary_for(now);
        let mut last = self.last_boundary.lock();
        match *last {
            Some(previous) if boundary > previous => {
                *last = Some(boundary);
                drop(last);
                info!(boundary = %boundary, "Planning boundary crossed");
                self.bus.publish(Event::SchedulePlanningDue { boundary });
                1
            }
            Some(_) => 0,
            None => {
                *last = Some(boundary);
                0
            }
        }
    }
}

#[async_trait]
impl Scanner for PlanningScanner {
    fn name(&self) -> &'static str {
        "planning"
    }

    async fn poll(&self) -> DomainResult<usize> {
        Ok(self.poll_at(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventKind;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_emits_once_per_crossed_boundary() {
        let bus = Arc::new(EventBus::new());
        let scanner = PlanningScanner::new(Arc::clone(&bus), chrono::Duration::minutes(30));

        assert_eq!(scanner.poll_at(at(10, 5, 0)), 0);
        assert_eq!(scanner.poll_at(at(10, 29, 59)), 0);
        assert_eq!(scanner.poll_at(at(10, 30, 0)), 1);
        assert_eq!(scanner.poll_at(at(10, 45, 0)), 0);
        // A long gap still yields one event.
        assert_eq!(scanner.poll_at(at(12, 10, 0)), 1);

        assert_eq!(bus.published_count(EventKind::SchedulePlanningDue), 2);
    }

    #[test]
    fn test_boundary_is_floored_to_period() {
        let bus = Arc::new(EventBus::new());
        let scanner = PlanningScanner::new(bus, chrono::Duration::minutes(30));
        assert_eq!(scanner.boundary_for(at(10, 44, 13)), at(10, 30, 0));
        assert_eq!(scanner.boundary_for(at(11, 0, 0)), at(11, 0, 0));
    }
}
