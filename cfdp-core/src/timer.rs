//! The countdown-timer abstraction used for the three Class 2 timers (EOF
//! positive-ACK, NAK, Check). Handlers never read wall-clock time directly;
//! they compare the caller-supplied `now` against a timer built through a
//! [`TimerCreator`], so tests can drive time forward without sleeping.

/// An opaque, monotonically increasing point in time. The unit is up to the
/// caller (milliseconds since an arbitrary epoch is the natural choice for a
/// real clock; tests often just count state-machine ticks).
pub type Timestamp = u64;

/// A single armed countdown, checked against `now` on every `state_machine`
/// call.
pub trait CountdownTimer: std::fmt::Debug {
    fn has_expired(&self, now: Timestamp) -> bool;
}

/// Builds [`CountdownTimer`]s. Injected into a handler at construction time
/// so a test can supply a virtual-clock creator instead of a real one.
pub trait TimerCreator: std::fmt::Debug {
    fn build(&self, now: Timestamp, interval_ms: u64) -> Box<dyn CountdownTimer>;
}

#[derive(Debug, Copy, Clone)]
struct FixedExpiryTimer {
    expiry: Timestamp,
}

impl CountdownTimer for FixedExpiryTimer {
    fn has_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }
}

/// The default [`TimerCreator`]: `now + interval_ms`. Used in production and
/// in tests alike, since `now` itself is caller-controlled — a test can
/// advance an artificial clock by any amount without needing a fake timer
/// implementation.
#[derive(Debug, Copy, Clone, Default)]
pub struct StdTimerCreator;

impl TimerCreator for StdTimerCreator {
    fn build(&self, now: Timestamp, interval_ms: u64) -> Box<dyn CountdownTimer> {
        Box::new(FixedExpiryTimer {
            expiry: now.saturating_add(interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_expires_after_interval() {
        let creator = StdTimerCreator;
        let timer = creator.build(1_000, 500);
        assert!(!timer.has_expired(1_499));
        assert!(timer.has_expired(1_500));
        assert!(timer.has_expired(2_000));
    }
}
