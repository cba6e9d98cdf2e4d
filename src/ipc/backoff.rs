use std::time::Duration;

use crate::config::{ConfigError, DEFAULT_BACKOFF_MS};

/// Polling intervals the pipe client steps through between automatic queries.
///
/// The index only moves forward and sticks at the last (largest) step until
/// an explicit probe resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
    index: usize,
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Result<Self, ConfigError> {
        if steps.is_empty() {
            return Err(ConfigError::EmptyBackoff);
        }
        if let Some(index) = steps.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(ConfigError::InvalidBackoff { index: index + 1 });
        }
        Ok(Self { steps, index: 0 })
    }

    /// Interval to wait before the next automatic query.
    pub fn current(&self) -> Duration {
        self.steps[self.index]
    }

    /// Move to the next step and return it.
    pub fn advance(&mut self) -> Duration {
        if self.index + 1 < self.steps.len() {
            self.index += 1;
        }
        self.current()
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }

    pub fn is_steady(&self) -> bool {
        self.index + 1 == self.steps.len()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: DEFAULT_BACKOFF_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            index: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn test_default_schedule_steps_through_recommended_sequence() {
        let mut schedule = BackoffSchedule::default();
        let mut seen = vec![schedule.current()];
        for _ in 0..6 {
            seen.push(schedule.advance());
        }

        assert_eq!(seen, ms(&[100, 500, 1000, 2000, 5000, 5000, 5000]));
        assert!(schedule.is_steady());
    }

    #[test]
    fn test_advance_never_decreases_from_any_start() {
        let steps = ms(&[10, 10, 30, 70, 70, 200]);
        for start in 0..steps.len() {
            let mut schedule = BackoffSchedule::new(steps.clone()).unwrap();
            for _ in 0..start {
                schedule.advance();
            }

            let mut previous = schedule.current();
            for _ in 0..(steps.len() * 2) {
                let next = schedule.advance();
                assert!(next >= previous, "{next:?} < {previous:?} from start {start}");
                assert!(schedule.index() < steps.len());
                previous = next;
            }
        }
    }

    #[test]
    fn test_reset_returns_to_fastest_step_from_any_position() {
        let mut schedule = BackoffSchedule::default();
        for advanced in 0..8 {
            for _ in 0..advanced {
                schedule.advance();
            }
            schedule.reset();
            assert_eq!(schedule.index(), 0);
            assert_eq!(schedule.current(), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_new_rejects_empty_and_decreasing_schedules() {
        assert_eq!(BackoffSchedule::new(Vec::new()), Err(ConfigError::EmptyBackoff));
        assert_eq!(
            BackoffSchedule::new(ms(&[100, 500, 200])),
            Err(ConfigError::InvalidBackoff { index: 2 })
        );
    }

    #[test]
    fn test_single_step_schedule_is_always_steady() {
        let mut schedule = BackoffSchedule::new(ms(&[250])).unwrap();
        assert!(schedule.is_steady());
        assert_eq!(schedule.advance(), Duration::from_millis(250));
        assert_eq!(schedule.index(), 0);
    }
}
