//! # wirebridge-core
//!
//! Shared contracts for coupling an opaque protocol session to a socket
//! whose connection lifecycle is managed independently.
//!
//! This crate is consumed by [`wirebridge-engine`], which implements the
//! bridge itself and the concrete transports.
//!
//! ## Responsibilities
//!
//! - **Collaborator contracts** — the [`Socket`](transport::Socket) and
//!   [`ProtocolStream`](transport::ProtocolStream) traits, plus connector and
//!   listener factories for obtaining sockets.
//!
//! - **Lifecycle** — the ordered four-state [`ReadyState`](lifecycle::ReadyState)
//!   and the monotonic [`Lifecycle`](lifecycle::Lifecycle) cell that turns the
//!   `open` / `close` signals into futures.
//!
//! - **Errors and configuration** — the cloneable [`BridgeError`](error::BridgeError)
//!   and serde-backed tunables.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod transport;
