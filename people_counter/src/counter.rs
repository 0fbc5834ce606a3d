//! People counting from per-frame detection counts.
use std::time::Instant;

use common::protocol::StatsMsg;

/// Tracks how many people entered the frame and how long they stayed.
///
/// A rise of the per-frame count adds the difference to the total and starts the dwell timer, a
/// drop reports the seconds elapsed since the last rise.
#[derive(Debug, Default)]
pub struct PeopleCounter {
    total: u64,
    last: u64,
    entered_at: Option<Instant>,
}

impl PeopleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Feed the count of the latest frame and get the messages to publish, in order.
    pub fn update(&mut self, current: u64, now: Instant) -> Vec<StatsMsg> {
        let mut msgs = Vec::with_capacity(2);

        if current > self.last {
            self.entered_at = Some(now);
            self.total += current - self.last;
            msgs.push(StatsMsg::Total { total: self.total });
        }

        if current < self.last {
            if let Some(entered_at) = self.entered_at {
                let duration = now.saturating_duration_since(entered_at).as_secs();
                msgs.push(StatsMsg::Duration { duration });
            }
        }

        msgs.push(StatsMsg::Count { count: current });
        self.last = current;

        msgs
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_steady_count_only_reports_count() {
        let mut counter = PeopleCounter::new();
        let now = Instant::now();

        assert_eq!(counter.update(0, now), vec![StatsMsg::Count { count: 0 }]);
        assert_eq!(counter.update(0, now), vec![StatsMsg::Count { count: 0 }]);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_person_walking_through() {
        let mut counter = PeopleCounter::new();
        let start = Instant::now();

        assert_eq!(
            counter.update(1, start),
            vec![StatsMsg::Total { total: 1 }, StatsMsg::Count { count: 1 }]
        );
        assert_eq!(
            counter.update(1, start + Duration::from_secs(5)),
            vec![StatsMsg::Count { count: 1 }]
        );
        assert_eq!(
            counter.update(0, start + Duration::from_millis(12_900)),
            vec![
                StatsMsg::Duration { duration: 12 },
                StatsMsg::Count { count: 0 }
            ]
        );
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn test_total_adds_only_increases() {
        let mut counter = PeopleCounter::new();
        let start = Instant::now();

        counter.update(2, start);
        counter.update(1, start + Duration::from_secs(1));
        let msgs = counter.update(3, start + Duration::from_secs(2));

        assert_eq!(msgs[0], StatsMsg::Total { total: 4 });
        assert_eq!(counter.total(), 4);
    }

    #[test]
    fn test_duration_measured_from_latest_increase() {
        let mut counter = PeopleCounter::new();
        let start = Instant::now();

        counter.update(1, start);
        counter.update(2, start + Duration::from_secs(10));
        let msgs = counter.update(0, start + Duration::from_secs(13));

        assert_eq!(msgs[0], StatsMsg::Duration { duration: 3 });
    }
}
