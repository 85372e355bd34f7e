use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::error::ProtocolError;

/// Protocol role of a node other than the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Trustee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Trustee => f.write_str("trustee"),
        }
    }
}

/// A participant of one protocol run, by role and dense id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantRef {
    pub role: Role,
    pub id: u32,
}

impl ParticipantRef {
    pub fn new(role: Role, id: u32) -> Self {
        Self { role, id }
    }

    pub fn client(id: u32) -> Self {
        Self::new(Role::Client, id)
    }

    pub fn trustee(id: u32) -> Self {
        Self::new(Role::Trustee, id)
    }
}

impl fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: u32,
    pub public_key: PublicKey,
}

/// The long-term keys the relay knows at startup, keyed by roster id.
///
/// Roster ids are unique across both roles since a node announces only
/// its id when it authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub trustees: Vec<RosterEntry>,
    #[serde(default)]
    pub clients: Vec<RosterEntry>,
}

impl Roster {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut seen = HashSet::new();
        for entry in self.trustees.iter().chain(self.clients.iter()) {
            if !seen.insert(entry.id) {
                return Err(ProtocolError::ConfigInvalid(format!(
                    "roster id {} is used more than once",
                    entry.id
                )));
            }
        }
        if self.clients.is_empty() || self.trustees.is_empty() {
            return Err(ProtocolError::ConfigInvalid(
                "roster needs at least one client and one trustee".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<(Role, &PublicKey)> {
        if let Some(entry) = self.trustees.iter().find(|e| e.id == id) {
            return Some((Role::Trustee, &entry.public_key));
        }
        self.clients
            .iter()
            .find(|e| e.id == id)
            .map(|e| (Role::Client, &e.public_key))
    }
}
