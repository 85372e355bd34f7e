//! Transport for the relay protocol
//!
//! - **framing**: length-prefixed frames and the big-endian field codec
//! - **messages**: the tagged [`Message`] sum type every node speaks
//! - **auth**: challenge-response authentication against the roster
//! - **connection**: reader and writer tasks around a TCP stream
//! - **udp**: the optional downstream broadcast

pub mod auth;
pub mod connection;
pub mod framing;
pub mod messages;
pub mod udp;

pub use auth::{authenticate_peer, authenticate_to_relay, AuthError, Authenticated};
pub use connection::{connect_with_retry, Connection, Outbound};
pub use framing::{read_message, write_message, FramingError, MAX_FRAME_SIZE};
pub use messages::{Message, MessageError, Parameters};
pub use udp::{Datagram, UdpBroadcaster, UdpReceiver};
