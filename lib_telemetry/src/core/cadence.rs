//! Per-consumer refresh cadence and the timing rules derived from it.

use std::fmt;
use std::time::Duration;

use super::EngineError;

/// Row budget spread over one cadence; shorter cadences fetch fewer rows.
const FETCH_BUDGET_MS: u64 = 30_000;
/// Fewest rows fetched per tick.
pub const MIN_FETCH_LIMIT: usize = 5;
/// Most rows fetched per tick.
pub const MAX_FETCH_LIMIT: usize = 20;

/// A validated refresh interval of at least one millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cadence(Duration);

impl Cadence {
    /// Accepts any positive millisecond count.
    pub fn from_millis(ms: i64) -> Result<Self, EngineError> {
        if ms <= 0 {
            return Err(EngineError::InvalidCadence(ms.to_string()));
        }
        Ok(Cadence(Duration::from_millis(ms.unsigned_abs())))
    }

    /// Parses a decimal millisecond count such as `"5000"`.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let ms: i64 = text
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidCadence(text.to_string()))?;
        Self::from_millis(ms)
    }

    /// The interval as a `Duration`.
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// The interval in whole milliseconds.
    pub fn as_millis(&self) -> u64 {
        u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX)
    }

    /// Rows to request per tick: `clamp(30000 / ms, 5, 20)`.
    pub fn fetch_limit(&self) -> usize {
        let per_tick = FETCH_BUDGET_MS / self.as_millis().max(1);
        usize::try_from(per_tick)
            .unwrap_or(MAX_FETCH_LIMIT)
            .clamp(MIN_FETCH_LIMIT, MAX_FETCH_LIMIT)
    }

    /// Sleep after a tick that took `elapsed`, never below `floor`.
    pub fn next_delay(&self, elapsed: Duration, floor: Duration) -> Duration {
        self.0.saturating_sub(elapsed).max(floor)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_cadence_is_rejected() {
        assert!(matches!(Cadence::from_millis(0), Err(EngineError::InvalidCadence(_))));
        assert!(matches!(Cadence::from_millis(-250), Err(EngineError::InvalidCadence(_))));
        assert!(matches!(Cadence::parse("fast"), Err(EngineError::InvalidCadence(_))));
        assert!(matches!(Cadence::parse(""), Err(EngineError::InvalidCadence(_))));
        assert_eq!(Cadence::parse(" 1500 ").unwrap().as_millis(), 1500);
    }

    #[test]
    fn test_fetch_limit_stays_within_bounds() {
        for ms in [1_i64, 2, 7, 100, 1_000, 1_499, 1_500, 2_000, 5_000, 6_000, 6_001, 60_000, i64::MAX] {
            let limit = Cadence::from_millis(ms).unwrap().fetch_limit();
            assert!((MIN_FETCH_LIMIT..=MAX_FETCH_LIMIT).contains(&limit), "{} -> {}", ms, limit);
        }
    }

    #[test]
    fn test_fetch_limit_scales_with_cadence() {
        assert_eq!(Cadence::from_millis(1_000).unwrap().fetch_limit(), 20);
        assert_eq!(Cadence::from_millis(2_000).unwrap().fetch_limit(), 15);
        assert_eq!(Cadence::from_millis(5_000).unwrap().fetch_limit(), 6);
        assert_eq!(Cadence::from_millis(10_000).unwrap().fetch_limit(), 5);
    }

    #[test]
    fn test_next_delay_honours_floor() {
        let cadence = Cadence::from_millis(1_000).unwrap();
        let floor = Duration::from_millis(100);
        assert_eq!(cadence.next_delay(Duration::from_millis(250), floor), Duration::from_millis(750));
        assert_eq!(cadence.next_delay(Duration::from_millis(950), floor), floor);
        assert_eq!(cadence.next_delay(Duration::from_secs(3), floor), floor);
    }
}
