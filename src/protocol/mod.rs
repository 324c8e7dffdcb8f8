//! Protocol module - Defines the wire protocol for bus communication
//!
//! Every frame is plain ASCII framing around an opaque body:
//! - 5 bytes: decimal length of address + body, zero-padded
//! - 5 bytes: address (destination when sending, sender when receiving)
//! - Variable length body
//!
//! There is no request identifier on the wire. A response can only be matched
//! to its request by the address it comes from, so at most one request per
//! destination may be outstanding at a time.

mod address;
mod codec;

pub use address::*;
pub use codec::*;

/// Width of the decimal length header
pub const HEADER_LEN: usize = 5;

/// Width of every participant address
pub const ADDRESS_LEN: usize = 5;

/// Largest value the length header can express
pub const MAX_FRAME_LEN: usize = 99_999;

/// Largest body that fits a single frame
pub const MAX_BODY_LEN: usize = MAX_FRAME_LEN - ADDRESS_LEN;

/// Reserved address for registration and its acknowledgment
pub const SINIT: &[u8; ADDRESS_LEN] = b"sinit";

/// Default port the bus listens on
pub const DEFAULT_BUS_PORT: u16 = 5001;
