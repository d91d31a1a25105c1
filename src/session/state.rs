//! Session state machine

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    #[default]
    Idle,
    Launching,
    Streaming,
    AwaitingPermission,
    Compacting,
    Error,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Launching => "launching",
            SessionState::Streaming => "streaming",
            SessionState::AwaitingPermission => "awaiting-permission",
            SessionState::Compacting => "compacting",
            SessionState::Error => "error",
        }
    }

    /// A turn is in flight
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionState::Launching
                | SessionState::Streaming
                | SessionState::AwaitingPermission
                | SessionState::Compacting
        )
    }

    /// The backend owes us the next event; the user does not
    pub fn awaits_backend(self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Compacting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inputs of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Launch,
    Launched,
    PermissionRequested,
    /// No request of the live channel is pending any more
    PermissionsSettled,
    CompactionStarted,
    CompactionFinished,
    TurnCompleted,
    Interrupt,
    Fail,
}

impl Transition {
    pub fn label(self) -> &'static str {
        match self {
            Transition::Launch => "launch",
            Transition::Launched => "launched",
            Transition::PermissionRequested => "permission_requested",
            Transition::PermissionsSettled => "permissions_settled",
            Transition::CompactionStarted => "compaction_started",
            Transition::CompactionFinished => "compaction_finished",
            Transition::TurnCompleted => "turn_completed",
            Transition::Interrupt => "interrupt",
            Transition::Fail => "fail",
        }
    }
}

impl SessionState {
    /// Target state of `transition`, or an error if it is not allowed here
    pub fn next(self, transition: Transition) -> Result<SessionState> {
        use SessionState as S;
        use Transition as T;

        let next = match (self, transition) {
            (S::Idle | S::Error, T::Launch) => S::Launching,
            (S::Launching, T::Launched) => S::Streaming,
            (S::Streaming | S::AwaitingPermission | S::Compacting, T::PermissionRequested) => {
                S::AwaitingPermission
            }
            (S::AwaitingPermission, T::PermissionsSettled) => S::Streaming,
            (S::Streaming | S::AwaitingPermission, T::CompactionStarted) => S::Compacting,
            (S::Compacting, T::CompactionFinished) => S::Streaming,
            (S::Streaming | S::AwaitingPermission | S::Compacting, T::TurnCompleted) => S::Idle,
            (_, T::Interrupt) => S::Idle,
            (S::Launching | S::Streaming | S::AwaitingPermission | S::Compacting, T::Fail) => {
                S::Error
            }
            (from, action) => {
                return Err(RuntimeError::InvalidTransition {
                    from: from.label().to_string(),
                    action: action.label().to_string(),
                })
            }
        };
        Ok(next)
    }
}

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    pub transition: Transition,
}

/// Holds the current state; rejected transitions leave it untouched
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn apply(&mut self, transition: Transition) -> Result<StateChange> {
        let from = self.state;
        let to = from.next(transition)?;
        self.state = to;
        Ok(StateChange {
            from,
            to,
            transition,
        })
    }

    pub fn can_apply(&self, transition: Transition) -> bool {
        self.state.next(transition).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_turn() {
        let mut sm = StateMachine::new();
        for (t, expected) in [
            (Transition::Launch, SessionState::Launching),
            (Transition::Launched, SessionState::Streaming),
            (Transition::PermissionRequested, SessionState::AwaitingPermission),
            (Transition::PermissionsSettled, SessionState::Streaming),
            (Transition::CompactionStarted, SessionState::Compacting),
            (Transition::CompactionFinished, SessionState::Streaming),
            (Transition::TurnCompleted, SessionState::Idle),
        ] {
            assert_eq!(sm.apply(t).unwrap().to, expected);
        }
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let mut sm = StateMachine::new();
        let err = sm.apply(Transition::Launched).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidTransition { ref from, ref action } if from == "idle" && action == "launched"
        ));
        assert_eq!(sm.state(), SessionState::Idle);

        sm.apply(Transition::Launch).unwrap();
        assert!(sm.apply(Transition::Launch).is_err());
        assert!(sm.apply(Transition::TurnCompleted).is_err());
        assert_eq!(sm.state(), SessionState::Launching);
    }

    #[test]
    fn test_interrupt_from_anywhere() {
        for t in [
            vec![],
            vec![Transition::Launch],
            vec![Transition::Launch, Transition::Launched],
            vec![Transition::Launch, Transition::Launched, Transition::CompactionStarted],
            vec![Transition::Launch, Transition::Fail],
        ] {
            let mut sm = StateMachine::new();
            for step in t {
                sm.apply(step).unwrap();
            }
            assert_eq!(sm.apply(Transition::Interrupt).unwrap().to, SessionState::Idle);
        }
    }

    #[test]
    fn test_error_recovers_by_launch_only() {
        let mut sm = StateMachine::new();
        sm.apply(Transition::Launch).unwrap();
        sm.apply(Transition::Fail).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
        assert!(!sm.can_apply(Transition::Fail));
        assert!(!sm.can_apply(Transition::TurnCompleted));
        assert_eq!(sm.apply(Transition::Launch).unwrap().to, SessionState::Launching);
    }

    #[test]
    fn test_busy_flags() {
        assert!(!SessionState::Idle.is_busy());
        assert!(!SessionState::Error.is_busy());
        assert!(SessionState::AwaitingPermission.is_busy());
        assert!(!SessionState::AwaitingPermission.awaits_backend());
        assert!(SessionState::Compacting.awaits_backend());
    }

    #[test]
    fn test_state_wire_name() {
        assert_eq!(
            serde_json::to_value(SessionState::AwaitingPermission).unwrap(),
            "awaiting-permission"
        );
    }
}
