//! Protocol-wide error taxonomy.
//!
//! Every module keeps its own error enum; they all fold into
//! [`ProtocolError`], whose [`ErrorKind`] decides the single action the
//! node takes and the exit code the binary reports.

use std::fmt;

use crate::roster::ParticipantRef;

/// The action class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Short read or peer reset: remove the participant and resync.
    TransportClosed,
    /// Bad length, unknown tag or wrong cell size: close the connection and resync.
    MalformedFrame,
    /// Challenge signature did not verify: close that connection only.
    AuthRejected,
    /// The challenge could not be built or embedded: close the connection.
    AuthInternal,
    /// A proof, signature or slot lookup failed: resync.
    CryptoInvariant,
    /// A participant missed a round deadline: resync with an offender list.
    RoundTimeout,
    /// The configuration cannot run: refuse to start.
    ConfigInvalid,
    /// A queue is saturated: apply the role's backpressure policy.
    ResourceExhausted,
}

impl ErrorKind {
    /// Process exit code for a node that stops because of this kind of error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ConfigInvalid => 1,
            ErrorKind::TransportClosed
            | ErrorKind::MalformedFrame
            | ErrorKind::RoundTimeout
            | ErrorKind::ResourceExhausted => 2,
            ErrorKind::AuthRejected | ErrorKind::AuthInternal | ErrorKind::CryptoInvariant => 3,
        }
    }

    /// Whether a running relay tears its protocol down on this error.
    pub fn forces_resync(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransportClosed
                | ErrorKind::MalformedFrame
                | ErrorKind::CryptoInvariant
                | ErrorKind::RoundTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransportClosed => "transport closed",
            ErrorKind::MalformedFrame => "malformed frame",
            ErrorKind::AuthRejected => "authentication rejected",
            ErrorKind::AuthInternal => "authentication internal error",
            ErrorKind::CryptoInvariant => "cryptographic invariant",
            ErrorKind::RoundTimeout => "round timeout",
            ErrorKind::ConfigInvalid => "invalid configuration",
            ErrorKind::ResourceExhausted => "resource exhausted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("authentication failed: {0}")]
    AuthInternal(String),
    #[error("cryptographic invariant violated: {0}")]
    CryptoInvariant(String),
    #[error("round {round} timed out waiting on {}", format_offenders(.offenders))]
    RoundTimeout {
        round: u32,
        offenders: Vec<ParticipantRef>,
    },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

fn format_offenders(offenders: &[ParticipantRef]) -> String {
    offenders
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::TransportClosed(_) => ErrorKind::TransportClosed,
            ProtocolError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            ProtocolError::AuthRejected(_) => ErrorKind::AuthRejected,
            ProtocolError::AuthInternal(_) => ErrorKind::AuthInternal,
            ProtocolError::CryptoInvariant(_) => ErrorKind::CryptoInvariant,
            ProtocolError::RoundTimeout { .. } => ErrorKind::RoundTimeout,
            ProtocolError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            ProtocolError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Participants blamed for the failure, if any.
    pub fn offenders(&self) -> &[ParticipantRef] {
        match self {
            ProtocolError::RoundTimeout { offenders, .. } => offenders,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::TransportClosed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Role;

    #[test]
    fn test_exit_codes_per_kind() {
        assert_eq!(ProtocolError::ConfigInvalid("x".into()).exit_code(), 1);
        assert_eq!(ProtocolError::TransportClosed("x".into()).exit_code(), 2);
        assert_eq!(ProtocolError::MalformedFrame("x".into()).exit_code(), 2);
        assert_eq!(ProtocolError::CryptoInvariant("x".into()).exit_code(), 3);
        assert_eq!(ProtocolError::AuthRejected("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_round_timeout_lists_offenders() {
        let err = ProtocolError::RoundTimeout {
            round: 4,
            offenders: vec![ParticipantRef::new(Role::Trustee, 0)],
        };
        assert_eq!(err.kind(), ErrorKind::RoundTimeout);
        assert_eq!(err.offenders().len(), 1);
        assert_eq!(err.to_string(), "round 4 timed out waiting on trustee 0");
    }

    #[test]
    fn test_resync_policy() {
        assert!(ErrorKind::RoundTimeout.forces_resync());
        assert!(ErrorKind::CryptoInvariant.forces_resync());
        assert!(!ErrorKind::AuthRejected.forces_resync());
        assert!(!ErrorKind::ConfigInvalid.forces_resync());
    }
}
