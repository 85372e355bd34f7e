use std::fmt;

/// Lifecycle of the relay's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    /// Nobody is waiting
    #[default]
    Idle,
    /// Participants are authenticated but there is no quorum yet
    Authenticating,
    Setup,
    Running,
    /// Tearing a run down; every participant is told to reconnect
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal relay transition from {from} to {to}")]
pub struct StateError {
    pub from: RelayState,
    pub to: RelayState,
}

impl RelayState {
    pub fn can_transition(&self, to: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, to),
            (Idle, Authenticating)
                | (Authenticating, Idle)
                | (Authenticating, Setup)
                | (Setup, Running)
                | (Setup, Resync)
                | (Running, Resync)
                | (Running, Idle)
                | (Resync, Idle)
        )
    }

    pub fn transition(&mut self, to: RelayState) -> Result<(), StateError> {
        if !self.can_transition(to) {
            return Err(StateError { from: *self, to });
        }
        tracing::debug!("relay state {} -> {}", self, to);
        *self = to;
        Ok(())
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Idle => "idle",
            RelayState::Authenticating => "authenticating",
            RelayState::Setup => "setup",
            RelayState::Running => "running",
            RelayState::Resync => "resync",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut state = RelayState::default();
        for next in [
            RelayState::Authenticating,
            RelayState::Setup,
            RelayState::Running,
            RelayState::Resync,
            RelayState::Idle,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, RelayState::Idle);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut state = RelayState::Idle;
        let err = state.transition(RelayState::Running).unwrap_err();
        assert_eq!(err.to_string(), "illegal relay transition from idle to running");
        assert_eq!(state, RelayState::Idle);

        let mut state = RelayState::Resync;
        assert!(state.transition(RelayState::Setup).is_err());
        let mut state = RelayState::Setup;
        assert!(state.transition(RelayState::Idle).is_err());
    }

    #[test]
    fn test_setup_failure_goes_through_resync() {
        let mut state = RelayState::Setup;
        state.transition(RelayState::Resync).unwrap();
        state.transition(RelayState::Idle).unwrap();
    }
}
