//! Real-time session lifecycle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State of a metered real-time session (call, chat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Admitted,
    Running,
    /// Optional add-ons disabled; mandatory services continue.
    Degraded,
    Completed,
    /// Stopped because the balance crossed the hard floor.
    Terminated,
}

impl SessionState {
    /// Allowed lifecycle edges.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotStarted, Admitted)
                | (Admitted, Running)
                | (Admitted, Completed)
                | (Running, Degraded)
                | (Running, Completed)
                | (Running, Terminated)
                | (Degraded, Completed)
                | (Degraded, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Terminated)
    }

    /// Whether the session is consuming metered services.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        assert!(SessionState::NotStarted.can_transition_to(SessionState::Admitted));
        assert!(SessionState::Running.can_transition_to(SessionState::Terminated));
        assert!(SessionState::Degraded.can_transition_to(SessionState::Completed));
        assert!(!SessionState::NotStarted.can_transition_to(SessionState::Running));
        assert!(!SessionState::Terminated.can_transition_to(SessionState::Running));
        assert!(!SessionState::Degraded.can_transition_to(SessionState::Running));
    }
}
