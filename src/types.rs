use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which of the two message tables a message lives in.
///
/// General messages are free-form direct messages; listing messages are
/// always scoped to a marketplace listing and never carry media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDomain {
    General,
    Listing,
}

impl MessageDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDomain::General => "general",
            MessageDomain::Listing => "listing",
        }
    }
}

impl fmt::Display for MessageDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(MessageDomain::General),
            "listing" => Ok(MessageDomain::Listing),
            other => Err(format!("unknown message domain: {}", other)),
        }
    }
}

/// Tracks reconnect attempts for a realtime session.
///
/// The delay grows linearly with the attempt number, so attempt 1 waits
/// `base_delay`, attempt 2 waits twice that, and so on.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectSchedule {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    /// Records another failed connection and returns the delay to wait
    /// before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay * self.attempt)
    }

    /// Resets the counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_domain_round_trip() {
        for domain in [MessageDomain::General, MessageDomain::Listing] {
            let parsed: MessageDomain = domain.as_str().parse().unwrap();
            assert_eq!(parsed, domain);
        }
        assert!("direct".parse::<MessageDomain>().is_err());
    }

    #[test]
    fn test_reconnect_schedule_linear_delays() {
        let mut schedule = ReconnectSchedule::new(3, Duration::from_millis(100));
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(300)));
        assert_eq!(schedule.next_delay(), None);
        assert!(schedule.exhausted());
    }

    #[test]
    fn test_reconnect_schedule_reset() {
        let mut schedule = ReconnectSchedule::new(2, Duration::from_millis(50));
        schedule.next_delay();
        schedule.next_delay();
        assert!(schedule.exhausted());
        schedule.reset();
        assert!(!schedule.exhausted());
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(50)));
    }
}
