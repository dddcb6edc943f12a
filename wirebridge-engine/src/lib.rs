//! # wirebridge-engine
//!
//! Couples an opaque protocol session to a socket whose connection
//! lifecycle runs on its own schedule.
//!
//! This crate provides:
//! - **Bridge**: waits for the socket to open, assembles the pipe, forwards
//!   socket failures into the protocol stream and runs the graceful
//!   shutdown from whichever state the socket is in
//! - **Outbound guard**: drops protocol output once the socket is closing
//!   instead of failing the pipe
//! - **Stream socket**: a four-state socket over any split async byte
//!   transport, with TCP and QUIC connectors and listeners
//! - **Channel session**: a channel-backed protocol stream for applications
//!   that just want to send and receive bytes

pub mod bridge;
pub mod guard;
pub mod pipe;
pub mod quic;
pub mod session;
pub mod socket;
pub mod tcp;

#[cfg(test)]
mod testing;
