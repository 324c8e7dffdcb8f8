//! Participant addresses
//!
//! Every bus participant is named by exactly five bytes of printable ASCII.
//! The same type is used for the destination of outbound frames and the
//! sender of inbound ones.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::{ADDRESS_LEN, SINIT};

/// Address errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address must be exactly 5 bytes, got {0}")]
    WrongLength(usize),

    #[error("Address is longer than 5 bytes: {0:?}")]
    TooLong(String),

    #[error("Address contains non-printable byte 0x{0:02x}")]
    InvalidByte(u8),
}

/// A 5-byte bus address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// The reserved system address used for registration and its acknowledgment
    pub const SINIT: Address = Address(*SINIT);

    /// Build an address from a string that must already be exactly 5 bytes.
    pub fn new(name: &str) -> Result<Self, AddressError> {
        Self::from_bytes(name.as_bytes())
    }

    /// Build an address, right-padding shorter names with spaces.
    ///
    /// Names longer than five bytes are rejected rather than truncated, since a
    /// truncated name may address a different participant.
    pub fn padded(name: &str) -> Result<Self, AddressError> {
        if name.len() > ADDRESS_LEN {
            return Err(AddressError::TooLong(name.to_string()));
        }
        Self::new(&format!("{:<width$}", name, width = ADDRESS_LEN))
    }

    /// Validate raw bytes, e.g. the sender field of an inbound frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let raw: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| AddressError::WrongLength(bytes.len()))?;

        if let Some(&bad) = raw.iter().find(|b| !(b.is_ascii_graphic() || **b == b' ')) {
            return Err(AddressError::InvalidByte(bad));
        }

        Ok(Self(raw))
    }

    /// Take the sender field of an inbound frame as is
    ///
    /// Other participants may use any five bytes as their name, so nothing is
    /// checked here beyond the length the type already guarantees.
    pub fn from_wire(raw: [u8; ADDRESS_LEN]) -> Self {
        Self(raw)
    }

    /// Generate a client address from a fresh v4 UUID
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut raw = [0u8; ADDRESS_LEN];
        raw.copy_from_slice(&id.as_bytes()[..ADDRESS_LEN]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// The address as text, replacing bytes that are not valid UTF-8
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// Whether this is the reserved registration address
    pub fn is_system(&self) -> bool {
        *self == Self::SINIT
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:?})", self.as_str())
    }
}
