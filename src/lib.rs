//! Buslink - framed messaging over a TCP service bus
//!
//! Participants register a 5-byte address with the bus and exchange
//! length-prefixed, addressed frames through it. This crate provides the
//! frame codec, the bus connection with its registration handshake, a
//! concurrent receive loop, and request/response correlation, plus a product
//! catalog service and client built on top of them.

pub mod catalog;
pub mod config;
pub mod network;
pub mod protocol;
