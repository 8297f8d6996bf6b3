use chrono::{DateTime, Duration, Utc};

/// Decides when the page should poll for a new version.
///
/// Due immediately when created or resumed, then once per interval. Paused
/// while the page is hidden or offline.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    interval: Duration,
    next_due: Option<DateTime<Utc>>,
    paused: bool,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
            paused: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume polling; the next tick is due right away.
    pub fn resume(&mut self) {
        self.paused = false;
        self.next_due = None;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_due.map_or(true, |due| now >= due)
    }

    pub fn mark_ran(&mut self, now: DateTime<Utc>) {
        self.next_due = Some(now + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_once_per_interval() {
        let now = Utc::now();
        let mut scheduler = PollScheduler::new(Duration::seconds(60));
        assert!(scheduler.is_due(now));

        scheduler.mark_ran(now);
        assert!(!scheduler.is_due(now + Duration::seconds(59)));
        assert!(scheduler.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn test_resume_is_immediately_due() {
        let now = Utc::now();
        let mut scheduler = PollScheduler::new(Duration::seconds(60));
        scheduler.mark_ran(now);
        scheduler.pause();
        assert!(!scheduler.is_due(now + Duration::minutes(10)));

        scheduler.resume();
        assert!(scheduler.is_due(now + Duration::seconds(1)));
    }
}
