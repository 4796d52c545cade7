//! Recording session state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Recording session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No session; `start()` is accepted.
    #[default]
    Idle,
    /// Capture is being selected and launched.
    Starting,
    /// Capture and watcher are running.
    Active,
    /// A requested stop is in progress.
    Stopping,
    /// Capture ended on its own. Transient: the session returns to `Idle`.
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Active => "ACTIVE",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "STARTING" => Some(Self::Starting),
            "ACTIVE" => Some(Self::Active),
            "STOPPING" => Some(Self::Stopping),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a recording is in progress (starting, running or stopping).
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Stopping)
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Active)
                // capture could not be launched
                | (Starting, Idle)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Idle)
                | (Failed, Idle)
        )
    }

    pub fn transition_to(&self, target: SessionState) -> Result<SessionState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for state in [
            SessionState::Idle,
            SessionState::Starting,
            SessionState::Active,
            SessionState::Stopping,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse("RECORDING"), None);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let state = SessionState::Idle
            .transition_to(SessionState::Starting)
            .and_then(|s| s.transition_to(SessionState::Active))
            .and_then(|s| s.transition_to(SessionState::Stopping))
            .and_then(|s| s.transition_to(SessionState::Idle))
            .unwrap();
        assert_eq!(state, SessionState::Idle);

        assert!(SessionState::Active.can_transition_to(SessionState::Failed));
        assert!(SessionState::Failed.can_transition_to(SessionState::Idle));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!SessionState::Idle.can_transition_to(SessionState::Active));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Active));
        assert!(!SessionState::Stopping.can_transition_to(SessionState::Failed));
        assert!(matches!(
            SessionState::Idle.transition_to(SessionState::Stopping),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_is_busy() {
        assert!(!SessionState::Idle.is_busy());
        assert!(!SessionState::Failed.is_busy());
        assert!(SessionState::Active.is_busy());
    }
}
