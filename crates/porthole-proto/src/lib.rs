//! Porthole Tunnel Protocol Definitions
//!
//! This crate defines the framed message format exchanged over the single
//! relay connection between the public server and a local agent.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Frame};
pub use messages::TunnelMessage;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum metadata block size (1MB)
pub const MAX_METADATA_SIZE: u32 = 1024 * 1024;

/// Byte length of the metadata length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;
