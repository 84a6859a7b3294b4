//! Packet types exchanged between paired devices for file sharing.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::PacketType;
pub use envelope::Packet;
pub use messages::{ShareFile, ShareUpdate};
