//! Wormhole client library
//!
//! Session machinery for the wormhole tunnel client: the multiplexed TLS
//! transport, the registration handshake, stream dispatch, forwarding, and
//! metrics consumption. The `wormhole` binary is a thin CLI over
//! [`session::Session`].

pub mod config;
pub mod dashboard;
pub mod forward;
pub mod session;
pub mod transport;

mod dispatch;
mod metrics;
