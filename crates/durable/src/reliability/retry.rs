//! Backoff between job attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shape of the delay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,
    /// `delay * 2^(attempts_made - 1)`
    Exponential,
}

/// Delay applied before a failed job is retried
///
/// # Example
///
/// ```
/// use dripline_durable::Backoff;
/// use std::time::Duration;
///
/// let backoff = Backoff::exponential(Duration::from_secs(2));
///
/// assert_eq!(backoff.delay_for_retry(1), Duration::from_secs(2));
/// assert_eq!(backoff.delay_for_retry(2), Duration::from_secs(4));
/// assert_eq!(backoff.delay_for_retry(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,

    /// Base delay
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Upper bound for a single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0). A value of 0.1 means +/-10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2))
    }
}

impl Backoff {
    /// Exponential backoff without jitter, capped at one hour
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            max_delay: Duration::from_secs(3600),
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given how many attempts already ran.
    pub fn delay_for_retry(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let base = match self.kind {
            BackoffKind::Fixed => self.delay.as_secs_f64(),
            BackoffKind::Exponential => {
                self.delay.as_secs_f64() * 2f64.powi(attempts_made as i32 - 1)
            }
        };
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
