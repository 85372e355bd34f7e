pub mod client;
pub mod gen_id;
mod node;
pub mod relay;
pub mod sockstest;
pub mod trustee;
pub mod version;

pub use client::Client;
pub use gen_id::GenId;
pub use relay::Relay;
pub use sockstest::Sockstest;
pub use trustee::Trustee;
pub use version::Version;
