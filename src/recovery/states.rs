use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery state of one exchange submission through the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// A delivery attempt is executing.
    InFlight,
    /// A step failed; the redelivery policy is being consulted.
    Evaluating,
    /// A redelivery is waiting on its timer.
    Scheduled,
    /// Redelivery exhausted (or excluded); routed to the dead-letter step.
    DeadLettered,
    /// Cancelled before reaching a terminal outcome; pending redelivery
    /// was aborted.
    Cancelled,
    /// The submission completed without an outstanding fault.
    Completed,
}

impl DeliveryState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::DeadLettered | Self::Cancelled
        )
    }

    /// Check if this is a terminal failure state
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::DeadLettered | Self::Cancelled)
    }

    /// Check if a delivery attempt is currently executing
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InFlight)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => write!(f, "in_flight"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::DeadLettered => write!(f, "dead_lettered"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(Self::InFlight),
            "evaluating" => Ok(Self::Evaluating),
            "scheduled" => Ok(Self::Scheduled),
            "dead_lettered" => Ok(Self::DeadLettered),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid delivery state: {s}")),
        }
    }
}

/// Default state for a fresh submission
impl Default for DeliveryState {
    fn default() -> Self {
        Self::InFlight
    }
}
