/**
 * Client node: setup participation, slot lookup
 *  and one DC-net cell per downstream.
 */
pub mod client;
/**
 * Protocol configuration, loaded from TOML
 *  with PascalCase keys.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Ristretto suite, keys and Schnorr signatures
 *  - Verifiable shuffle-and-rebase of public keys
 */
pub mod crypto;
/**
 * DC-net cell layout and the per-role codecs,
 *  plain and equivocation-protected.
 */
pub mod dcnet;
pub mod error;
/**
 * Wire protocol: framing, message types,
 *  challenge-response authentication, UDP broadcast
 *  and per-connection reader/writer tasks.
 */
pub mod net;
mod node;
/**
 * Relay node: churn controller, setup schedule
 *  driver and round coordinator.
 */
pub mod relay;
pub mod roster;
/**
 * Trustee shuffle chain, signatures over its
 *  output and slot lookup.
 */
pub mod schedule;
/**
 * Multiplexing local TCP streams over the
 *  anonymous channel.
 */
pub mod socks;
/**
 * Trustee node: shuffle, signature and the
 *  paced cell stream.
 */
pub mod trustee;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub use node::{NodeHandle, NodeStatus};

pub mod prelude {
    pub use crate::build_info;
    pub use crate::client::{Client, UpstreamQueue};
    pub use crate::config::{DcNetType, PrifiConfig};
    pub use crate::crypto::{PublicKey, SecretKey, Suite};
    pub use crate::dcnet::cell::Chunk;
    pub use crate::error::{ErrorKind, ProtocolError};
    pub use crate::relay::{Relay, RelayHandle, RelayReport, RelayState};
    pub use crate::roster::{Role, Roster, RosterEntry};
    pub use crate::socks::{TcpEgress, TcpIngress};
    pub use crate::trustee::Trustee;
    pub use crate::{NodeHandle, NodeStatus};
}
