pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Client, GenId, Relay, Sockstest, Trustee, Version};
